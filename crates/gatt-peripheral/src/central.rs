//! Connected centrals
//!
//! A central is identified by its transport-level address. The link
//! security level travels with it so permission checks can be made
//! without asking the transport again.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::gatt::SecurityLevel;

/// A remote device connected to this peripheral
#[derive(Debug, Clone)]
pub struct Central {
    /// Transport address, e.g. `AA:BB:CC:DD:EE:FF`
    pub address: String,
    /// Current link security
    pub security: SecurityLevel,
}

impl Central {
    /// Central on an unencrypted link
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            security: SecurityLevel::Open,
        }
    }

    /// Set the link security level
    pub fn with_security(mut self, security: SecurityLevel) -> Self {
        self.security = security;
        self
    }
}

// Identity is the address alone; security may change over a link's lifetime.
impl PartialEq for Central {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Central {}

impl Hash for Central {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Central {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Set of currently connected centrals keyed by address
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    centrals: HashMap<String, Central>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection
    ///
    /// Returns `false` if the address was already connected; the stored
    /// entry is refreshed with the new security level either way.
    pub fn add(&mut self, central: Central) -> bool {
        self.centrals
            .insert(central.address.clone(), central)
            .is_none()
    }

    /// Forget a connection, returning the removed entry
    pub fn remove(&mut self, address: &str) -> Option<Central> {
        self.centrals.remove(address)
    }

    /// Look up a connected central
    pub fn get(&self, address: &str) -> Option<&Central> {
        self.centrals.get(address)
    }

    /// Whether `address` is connected
    pub fn contains(&self, address: &str) -> bool {
        self.centrals.contains_key(address)
    }

    /// Whether no central is connected
    pub fn is_empty(&self) -> bool {
        self.centrals.is_empty()
    }

    /// Number of connected centrals
    pub fn len(&self) -> usize {
        self.centrals.len()
    }

    /// Iterate connected centrals in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Central> {
        self.centrals.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_address() {
        let a = Central::new("AA:BB:CC:DD:EE:FF");
        let b = Central::new("AA:BB:CC:DD:EE:FF").with_security(SecurityLevel::Authenticated);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_registry_add_remove() {
        let mut registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.add(Central::new("11:11:11:11:11:11")));
        assert!(registry.add(Central::new("22:22:22:22:22:22")));
        assert!(!registry.add(
            Central::new("11:11:11:11:11:11").with_security(SecurityLevel::Encrypted)
        ));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("11:11:11:11:11:11").map(|c| c.security),
            Some(SecurityLevel::Encrypted)
        );

        assert!(registry.remove("11:11:11:11:11:11").is_some());
        assert!(registry.remove("11:11:11:11:11:11").is_none());
        assert!(!registry.contains("11:11:11:11:11:11"));
        assert_eq!(registry.iter().count(), 1);
    }
}
