//! Connection configuration.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;
use crate::identity::AccessoryIdentity;

/// Default read buffer size. Matches the largest AOA bulk transfer most
/// accessories issue.
pub const DEFAULT_BUFFER_SIZE: usize = 16384;

/// Default kernel accessory node.
pub const DEFAULT_DEVICE_NODE: &str = "/dev/usb_accessory";

/// Configuration for an `AccessoryConnection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Accessory this connection accepts.
    pub identity: AccessoryIdentity,
    /// Read buffer size in bytes. Fixed for the life of a connection.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Settings for `DeviceNodePlatform`.
    #[serde(default)]
    pub device_node: DeviceNodeConfig,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Settings for the device node platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNodeConfig {
    pub path: PathBuf,
}

impl Default for DeviceNodeConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DEVICE_NODE),
        }
    }
}

impl ConnectionConfig {
    pub fn new(identity: AccessoryIdentity) -> Self {
        Self {
            identity,
            buffer_size: DEFAULT_BUFFER_SIZE,
            device_node: DeviceNodeConfig::default(),
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn validate(&self) -> Result<(), ConnectionError> {
        self.identity.validate()?;
        if self.buffer_size == 0 {
            return Err(ConnectionError::InvalidConfig(
                "buffer_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConnectionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accessory.toml");
        std::fs::write(
            &path,
            r#"
[identity]
manufacturer = "Acme"
model = "Widget"
version = "1.0"
"#,
        )
        .unwrap();

        let config = ConnectionConfig::load_from_file(&path).unwrap();
        assert_eq!(config.identity.model(), "Widget");
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.device_node.path, PathBuf::from(DEFAULT_DEVICE_NODE));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accessory.toml");
        let config = ConnectionConfig::new(AccessoryIdentity::new("Acme", "Widget", "1.0").unwrap())
            .with_buffer_size(512);

        config.save_to_file(&path).unwrap();
        assert_eq!(ConnectionConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_load_rejects_empty_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accessory.toml");
        std::fs::write(
            &path,
            "[identity]\nmanufacturer = \"Acme\"\nmodel = \"\"\nversion = \"1.0\"\n",
        )
        .unwrap();

        assert!(ConnectionConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn test_zero_buffer_is_invalid() {
        let config = ConnectionConfig::new(AccessoryIdentity::new("Acme", "Widget", "1.0").unwrap())
            .with_buffer_size(0);
        assert!(matches!(
            config.validate(),
            Err(ConnectionError::InvalidConfig(_))
        ));
    }
}
