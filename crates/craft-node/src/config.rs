//! Node configuration.
//!
//! Configuration covers:
//! - Bind address selection (fixed, explicit port, or random port)
//! - Peer capacity and local discovery
//! - Durable storage location
//! - Gossip timing
//! - Accepted message type descriptions

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NodeError, NodeResult};
use crate::schema::AcceptedType;
use crate::transport::BindMode;

/// Host used in fixed-address mode.
pub const FIXED_HOST: &str = "localhost";
/// Port used in fixed-address mode.
pub const FIXED_PORT: u16 = 21000;
/// Default bind host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Configuration for a [`crate::CraftNode`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Host to bind and to announce to peers.
    pub host: String,
    /// First port to try. Without one a random port in 5000..=9000 is used.
    pub port: Option<u16>,
    /// Bind exactly `localhost:21000` and fail if it is taken.
    pub use_fixed_address: bool,
    /// Peer directory capacity.
    pub max_peers: usize,
    /// Keep messages, peers and bans in a file that survives restarts.
    pub persistent: bool,
    /// Delete any existing store file before opening it.
    pub reset_db: bool,
    /// Directory holding the store file.
    pub data_dir: PathBuf,
    /// Answer `REQUEST_LOCAL_PEERS` with our peer list.
    pub local_discovery: bool,
    /// Period of the gossip and sync loops, in milliseconds.
    pub gossip_interval_ms: u64,
    /// Accepted message type descriptions. Empty accepts everything.
    pub accepted_message_types: Vec<Value>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            use_fixed_address: false,
            max_peers: 5,
            persistent: false,
            reset_db: false,
            data_dir: PathBuf::from("."),
            local_discovery: true,
            gossip_interval_ms: 500,
            accepted_message_types: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bind host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the first port to try.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables fixed-address mode.
    #[must_use]
    pub const fn with_fixed_address(mut self, fixed: bool) -> Self {
        self.use_fixed_address = fixed;
        self
    }

    /// Sets the peer capacity.
    #[must_use]
    pub const fn with_max_peers(mut self, max: usize) -> Self {
        self.max_peers = max;
        self
    }

    /// Enables durable storage under `data_dir`.
    #[must_use]
    pub fn with_persistence(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.persistent = true;
        self.data_dir = data_dir.into();
        self
    }

    /// Deletes an existing store file on open.
    #[must_use]
    pub const fn with_reset_db(mut self, reset: bool) -> Self {
        self.reset_db = reset;
        self
    }

    /// Enables or disables answering local peer requests.
    #[must_use]
    pub const fn with_local_discovery(mut self, enabled: bool) -> Self {
        self.local_discovery = enabled;
        self
    }

    /// Sets the gossip interval.
    #[must_use]
    pub const fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Adds an accepted message type description.
    #[must_use]
    pub fn with_accepted_type(mut self, description: Value) -> Self {
        self.accepted_message_types.push(description);
        self
    }

    /// Gossip and sync period.
    #[must_use]
    pub const fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    /// How the transport should bind.
    #[must_use]
    pub fn bind_mode(&self) -> BindMode {
        if self.use_fixed_address {
            BindMode::Fixed {
                host: FIXED_HOST.to_string(),
                port: FIXED_PORT,
            }
        } else {
            BindMode::Random {
                host: self.host.clone(),
                first: self.port,
            }
        }
    }

    /// Store file location for a node bound to `port`.
    #[must_use]
    pub fn store_path(&self, port: u16) -> PathBuf {
        self.data_dir.join(format!("node_{port}.json"))
    }

    /// Parses the accepted message type descriptions.
    pub fn accepted_types(&self) -> NodeResult<Vec<AcceptedType>> {
        self.accepted_message_types
            .iter()
            .map(AcceptedType::from_json)
            .collect()
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(content: &str) -> NodeResult<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| NodeError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to a JSON file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> NodeResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> NodeResult<()> {
        if self.host.is_empty() {
            return Err(NodeError::Config("host cannot be empty".to_string()));
        }
        if self.max_peers == 0 {
            return Err(NodeError::Config(
                "max_peers must be greater than 0".to_string(),
            ));
        }
        if self.gossip_interval_ms == 0 {
            return Err(NodeError::Config(
                "gossip_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.use_fixed_address && self.port.is_some_and(|p| p != FIXED_PORT) {
            return Err(NodeError::Config(format!(
                "use_fixed_address binds port {FIXED_PORT}; remove the explicit port"
            )));
        }
        self.accepted_types()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, None);
        assert_eq!(config.max_peers, 5);
        assert_eq!(config.gossip_interval(), Duration::from_millis(500));
        assert!(config.local_discovery);
        assert!(!config.persistent);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn fixed_address_overrides_host() {
        let config = NodeConfig::new().with_host("10.0.0.1").with_fixed_address(true);
        assert_eq!(
            config.bind_mode(),
            BindMode::Fixed {
                host: "localhost".to_string(),
                port: 21000
            }
        );
    }

    #[test]
    fn explicit_port_is_tried_first() {
        let config = NodeConfig::new().with_port(7000);
        assert_eq!(
            config.bind_mode(),
            BindMode::Random {
                host: "127.0.0.1".to_string(),
                first: Some(7000)
            }
        );
    }

    #[test]
    fn store_path_uses_port() {
        let config = NodeConfig::new().with_persistence("/var/lib/craft");
        assert_eq!(
            config.store_path(7001),
            PathBuf::from("/var/lib/craft/node_7001.json")
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = NodeConfig::from_json(r#"{"port": 6001, "max_peers": 2}"#).unwrap();
        assert_eq!(config.port, Some(6001));
        assert_eq!(config.max_peers, 2);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(NodeConfig::new().with_max_peers(0).validate().is_err());
        assert!(NodeConfig::new().with_host("").validate().is_err());
        assert!(
            NodeConfig::new()
                .with_gossip_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            NodeConfig::new()
                .with_fixed_address(true)
                .with_port(5000)
                .validate()
                .is_err()
        );
        assert!(
            NodeConfig::new()
                .with_accepted_type(json!("nonsense"))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn accepted_types_parse() {
        let config = NodeConfig::new()
            .with_accepted_type(json!("str"))
            .with_accepted_type(json!({"message_type": "Ping", "mandatory_fields": {"n": "int"}}));
        assert_eq!(config.accepted_types().unwrap().len(), 2);
    }

    #[test]
    fn file_round_trip() {
        let config = NodeConfig::new()
            .with_port(6100)
            .with_gossip_interval(Duration::from_millis(50))
            .with_accepted_type(json!("int"));
        let file = NamedTempFile::new().expect("temp file");
        config.save_to_file(file.path()).unwrap();

        assert_eq!(NodeConfig::from_file(file.path()).unwrap(), config);
    }

    #[test]
    fn from_file_reports_bad_json() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"{ not json").expect("write");
        let err = NodeConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }
}
