//! The shared object contract.
//!
//! Consumers plug replicated state into a node by implementing
//! [`SharedObject`]. The node calls into objects; objects never call back
//! into the node. A message is absorbed only when every registered object
//! validates it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Rejection;
use crate::message::SharedMessage;

/// Replicated state driven by gossip messages.
///
/// Digests handled by the optional merkelized methods are whatever the
/// object uses to address its own log entries; the node passes them through
/// untouched.
pub trait SharedObject: Send + 'static {
    /// Class identifier used by the sync protocol. Defaults to the type name
    /// without its module path.
    fn class_name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Returns true if `message` may be absorbed. Must not mutate state, and
    /// should return true for shapes the object does not handle.
    fn is_valid(&self, message: &SharedMessage) -> bool;

    /// Absorbs a message that every object validated.
    fn add_message(&mut self, message: &SharedMessage);

    /// Returns true if the object is an ordered, digest-addressable log that
    /// supports incremental sync.
    fn is_merkelized(&self) -> bool {
        false
    }

    /// Digest of the newest log entry.
    fn get_latest_digest(&self) -> Option<String> {
        None
    }

    /// Returns true if `digest` names an entry of the log.
    fn is_valid_digest(&self, _digest: &str) -> bool {
        false
    }

    /// Messages for every entry strictly after `digest`, oldest first.
    /// Unknown digests yield nothing.
    fn gossip_object(&self, _digest: &str) -> Vec<SharedMessage> {
        Vec::new()
    }
}

/// Shared, lockable handle to a registered object.
pub type SharedObjectHandle = Arc<Mutex<dyn SharedObject>>;

/// Wraps an object in a [`SharedObjectHandle`].
pub fn handle<T: SharedObject>(object: T) -> SharedObjectHandle {
    Arc::new(Mutex::new(object))
}

/// The objects registered with a node, in registration order.
#[derive(Clone, Default)]
pub struct SharedObjects {
    objects: Vec<SharedObjectHandle>,
}

impl std::fmt::Debug for SharedObjects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedObjects")
            .field("len", &self.objects.len())
            .finish()
    }
}

impl SharedObjects {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an object.
    pub fn push(&mut self, object: SharedObjectHandle) {
        self.objects.push(object);
    }

    /// Number of registered objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Registered handles.
    #[must_use]
    pub fn handles(&self) -> &[SharedObjectHandle] {
        &self.objects
    }

    /// Asks every object to validate `message`. Stops at the first refusal.
    /// A panicking object counts as a refusal.
    pub fn validate(&self, message: &SharedMessage) -> Result<(), Rejection> {
        for object in &self.objects {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let guard = object.lock();
                (guard.is_valid(message), guard.class_name().to_string())
            }));
            match outcome {
                Ok((true, _)) => {}
                Ok((false, class_name)) => {
                    debug!(class_name = %class_name, "shared object refused message");
                    return Err(Rejection::SharedObject(class_name));
                }
                Err(_) => {
                    let class_name = class_name_of(object);
                    warn!(class_name = %class_name, "shared object panicked in is_valid");
                    return Err(Rejection::ConsumerFault(class_name));
                }
            }
        }
        Ok(())
    }

    /// Hands `message` to every object. A panic is reported after the
    /// remaining objects have been fed, so callers must treat the message as
    /// seen even on error.
    pub fn absorb(&self, message: &SharedMessage) -> Result<(), Rejection> {
        let mut fault = None;
        for object in &self.objects {
            let outcome = catch_unwind(AssertUnwindSafe(|| object.lock().add_message(message)));
            if outcome.is_err() {
                let class_name = class_name_of(object);
                warn!(class_name = %class_name, "shared object panicked in add_message");
                fault.get_or_insert(Rejection::ConsumerFault(class_name));
            }
        }
        fault.map_or(Ok(()), Err)
    }

    /// `(class_name, head_digest)` for every merkelized object that has a
    /// head.
    #[must_use]
    pub fn merkelized_heads(&self) -> Vec<(String, String)> {
        self.objects
            .iter()
            .filter_map(|object| {
                catch_unwind(AssertUnwindSafe(|| {
                    let guard = object.lock();
                    if !guard.is_merkelized() {
                        return None;
                    }
                    guard
                        .get_latest_digest()
                        .map(|digest| (guard.class_name().to_string(), digest))
                }))
                .ok()
                .flatten()
            })
            .collect()
    }

    /// Messages that bring a peer holding `digest` up to date, taken from the
    /// first merkelized object of class `class_name` that knows the digest.
    #[must_use]
    pub fn updates_after(&self, class_name: &str, digest: &str) -> Vec<SharedMessage> {
        for object in &self.objects {
            let found = catch_unwind(AssertUnwindSafe(|| {
                let guard = object.lock();
                (guard.is_merkelized()
                    && guard.class_name() == class_name
                    && guard.is_valid_digest(digest))
                .then(|| guard.gossip_object(digest))
            }));
            match found {
                Ok(Some(messages)) => return messages,
                Ok(None) => {}
                Err(_) => {
                    warn!(class_name = %class_name, "shared object panicked while serving sync");
                }
            }
        }
        Vec::new()
    }
}

fn class_name_of(object: &SharedObjectHandle) -> String {
    catch_unwind(AssertUnwindSafe(|| object.lock().class_name().to_string()))
        .unwrap_or_else(|_| "<unknown>".to_string())
}
