//! Message acceptance policy.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::schema::{AcceptedType, FieldType, MessageSchema, ObjectSchema};

/// Valid signature string lengths.
pub const SIGNATURE_LENGTHS: [usize; 6] = [130, 132, 134, 136, 140, 142];

/// Length of a hash string.
pub const HASH_LENGTH: usize = 64;

/// Decides which payloads a node accepts.
///
/// With no registered types everything is accepted. Otherwise the payload
/// must match at least one registered type.
#[derive(Debug, Clone, Default)]
pub struct AcceptancePolicy {
    types: Vec<AcceptedType>,
}

impl AcceptancePolicy {
    /// A policy that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy restricted to `types`.
    #[must_use]
    pub fn with_types(types: Vec<AcceptedType>) -> Self {
        Self { types }
    }

    /// Registers another accepted type.
    pub fn register(&mut self, accepted: AcceptedType) {
        self.types.push(accepted);
    }

    /// Registered types.
    #[must_use]
    pub fn types(&self) -> &[AcceptedType] {
        &self.types
    }

    /// Returns true if no types are registered.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.types.is_empty()
    }

    /// Returns true if `data` is acceptable.
    #[must_use]
    pub fn accepts(&self, data: &Value) -> bool {
        if self.types.is_empty() {
            return true;
        }
        self.types.iter().any(|accepted| match accepted {
            AcceptedType::Scalar(primitive) => primitive.matches(data),
            AcceptedType::Message(schema) => data
                .as_object()
                .is_some_and(|map| self.matches_message(map, schema)),
        })
    }

    fn matches_message(&self, map: &Map<String, Value>, schema: &MessageSchema) -> bool {
        let tagged = map
            .get("message_type")
            .and_then(Value::as_str)
            .is_some_and(|t| t == schema.message_type);
        tagged && self.matches_object(map, &schema.fields, &mut HashSet::new())
    }

    fn matches_object<'a>(
        &'a self,
        map: &Map<String, Value>,
        schema: &'a ObjectSchema,
        visited: &mut HashSet<&'a FieldType>,
    ) -> bool {
        let mandatory_ok = schema.mandatory_fields.iter().all(|(name, ty)| {
            map.get(name)
                .is_some_and(|value| self.matches_field(value, ty, visited))
        });
        mandatory_ok
            && schema.optional_fields.iter().all(|(name, ty)| {
                map.get(name)
                    .is_none_or(|value| self.matches_field(value, ty, visited))
            })
    }

    /// Recursive field check. `visited` holds the element types of the
    /// sequences currently being walked; meeting one of them again on the
    /// same path fails the match.
    fn matches_field<'a>(
        &'a self,
        value: &Value,
        ty: &'a FieldType,
        visited: &mut HashSet<&'a FieldType>,
    ) -> bool {
        match ty {
            FieldType::Primitive(primitive) => primitive.matches(value),
            FieldType::Hash => value.as_str().is_some_and(|s| s.chars().count() == HASH_LENGTH),
            FieldType::Signature => value
                .as_str()
                .is_some_and(|s| SIGNATURE_LENGTHS.contains(&s.chars().count())),
            FieldType::SequenceOf(element) => {
                let Some(items) = value.as_array() else {
                    return false;
                };
                if !visited.insert(element.as_ref()) {
                    return false;
                }
                let ok = items
                    .iter()
                    .all(|item| self.matches_field(item, element, visited));
                visited.remove(element.as_ref());
                ok
            }
            FieldType::Object(schema) => value
                .as_object()
                .is_some_and(|map| self.matches_object(map, schema, visited)),
            FieldType::Ref(name) => {
                let Some(schema) = self.message_schema(name) else {
                    return false;
                };
                value
                    .as_object()
                    .is_some_and(|map| self.matches_object(map, &schema.fields, visited))
            }
        }
    }

    fn message_schema(&self, name: &str) -> Option<&MessageSchema> {
        self.types.iter().find_map(|accepted| match accepted {
            AcceptedType::Message(schema) if schema.message_type == name => Some(schema),
            _ => None,
        })
    }
}
