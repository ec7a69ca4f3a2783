//! Accessory identification.
//!
//! An `AccessoryIdentity` is what the application expects to talk to; an
//! `AccessoryDescriptor` is what the platform reports after enumeration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;

/// One of the three strings an accessory is matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityField {
    Manufacturer,
    Model,
    Version,
}

impl IdentityField {
    /// Fields in the order they are compared.
    pub const ALL: [IdentityField; 3] = [
        IdentityField::Manufacturer,
        IdentityField::Model,
        IdentityField::Version,
    ];

    /// Human readable reason reported when this field does not match.
    pub fn mismatch_reason(&self) -> &'static str {
        match self {
            IdentityField::Manufacturer => "Manufacturer is not matched!",
            IdentityField::Model => "Model is not matched!",
            IdentityField::Version => "Version is not matched!",
        }
    }
}

impl fmt::Display for IdentityField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityField::Manufacturer => write!(f, "manufacturer"),
            IdentityField::Model => write!(f, "model"),
            IdentityField::Version => write!(f, "version"),
        }
    }
}

/// Expected manufacturer/model/version of the accessory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryIdentity {
    manufacturer: String,
    model: String,
    version: String,
}

impl AccessoryIdentity {
    /// Create an identity. All three strings must be non-empty.
    pub fn new(
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self, ConnectionError> {
        let identity = Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
            version: version.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Check the non-empty invariant. Deserialized identities bypass `new`,
    /// so config validation calls this too.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        for field in IdentityField::ALL {
            if self.get(field).is_empty() {
                return Err(ConnectionError::EmptyIdentityField(field));
            }
        }
        Ok(())
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get(&self, field: IdentityField) -> &str {
        match field {
            IdentityField::Manufacturer => &self.manufacturer,
            IdentityField::Model => &self.model,
            IdentityField::Version => &self.version,
        }
    }

    /// First field (in manufacturer, model, version order) on which the
    /// descriptor differs. Comparison is exact.
    pub fn first_mismatch(&self, descriptor: &AccessoryDescriptor) -> Option<IdentityField> {
        IdentityField::ALL
            .into_iter()
            .find(|&field| self.get(field) != descriptor.get(field))
    }

    pub fn matches(&self, descriptor: &AccessoryDescriptor) -> bool {
        self.first_mismatch(descriptor).is_none()
    }
}

impl fmt::Display for AccessoryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.manufacturer, self.model, self.version)
    }
}

/// Accessory as reported by platform discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessoryDescriptor {
    pub manufacturer: String,
    pub model: String,
    pub version: String,
    /// Optional AOA strings. Not used for matching.
    pub description: Option<String>,
    pub uri: Option<String>,
    pub serial: Option<String>,
}

impl AccessoryDescriptor {
    pub fn new(
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn get(&self, field: IdentityField) -> &str {
        match field {
            IdentityField::Manufacturer => &self.manufacturer,
            IdentityField::Model => &self.model,
            IdentityField::Version => &self.version,
        }
    }
}

impl fmt::Display for AccessoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.manufacturer, self.model, self.version)?;
        if let Some(serial) = &self.serial {
            write!(f, " serial={}", serial)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> AccessoryIdentity {
        AccessoryIdentity::new("Acme", "Widget", "1.0").unwrap()
    }

    #[test]
    fn test_identity_rejects_empty_fields() {
        let err = AccessoryIdentity::new("Acme", "", "1.0").unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::EmptyIdentityField(IdentityField::Model)
        ));
        assert!(AccessoryIdentity::new("", "", "").is_err());
    }

    #[test]
    fn test_exact_match() {
        let descriptor = AccessoryDescriptor::new("Acme", "Widget", "1.0").with_serial("42");
        assert!(acme().matches(&descriptor));
    }

    #[test]
    fn test_version_mismatch_reason() {
        let descriptor = AccessoryDescriptor::new("Acme", "Widget", "2.0");
        let field = acme().first_mismatch(&descriptor).unwrap();
        assert_eq!(field, IdentityField::Version);
        assert_eq!(field.mismatch_reason(), "Version is not matched!");
    }

    #[test]
    fn test_first_mismatch_wins() {
        let descriptor = AccessoryDescriptor::new("Other", "Gadget", "9.9");
        assert_eq!(
            acme().first_mismatch(&descriptor),
            Some(IdentityField::Manufacturer)
        );

        let descriptor = AccessoryDescriptor::new("Acme", "Gadget", "9.9");
        assert_eq!(acme().first_mismatch(&descriptor), Some(IdentityField::Model));
    }

    #[test]
    fn test_comparison_is_case_sensitive() {
        let descriptor = AccessoryDescriptor::new("acme", "Widget", "1.0");
        assert!(!acme().matches(&descriptor));
    }
}
