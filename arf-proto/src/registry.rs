//! Process-wide struct registry.
//!
//! Decoding a struct value requires its id to be registered; registration is
//! expected to happen at startup, before any decode that may reference the
//! id. Redefinition replaces the prior entry.

use crate::record::ArfStruct;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Descriptor for a registered record type.
#[derive(Debug, Clone)]
pub struct StructDescriptor {
    pub id: &'static str,
    pub type_name: &'static str,
    /// Field tags in encoding order.
    pub tags: Vec<u64>,
}

fn registry() -> &'static RwLock<HashMap<String, StructDescriptor>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, StructDescriptor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers a record type under its struct id.
pub fn register<T: ArfStruct>() {
    let body = T::default().to_body();
    let mut tags: Vec<u64> = body.fields.iter().map(|(tag, _)| *tag).collect();
    tags.sort_unstable();

    let descriptor = StructDescriptor {
        id: T::STRUCT_ID,
        type_name: std::any::type_name::<T>(),
        tags,
    };
    registry()
        .write()
        .insert(T::STRUCT_ID.to_string(), descriptor);
}

/// Returns whether a struct id is registered.
pub fn contains(id: &str) -> bool {
    registry().read().contains_key(id)
}

/// Returns the descriptor for a registered struct id.
pub fn descriptor(id: &str) -> Option<StructDescriptor> {
    registry().read().get(id).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::arf_struct! {
        struct Registered: "tests/registry/registered" {
            2 => second: u32,
            1 => first: String,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        register::<Registered>();
        assert!(contains("tests/registry/registered"));

        let desc = descriptor("tests/registry/registered").unwrap();
        assert_eq!(desc.id, "tests/registry/registered");
        // Descriptor tags are sorted regardless of declaration order.
        assert_eq!(desc.tags, vec![1, 2]);
    }

    #[test]
    fn test_unknown_id() {
        assert!(!contains("tests/registry/unknown"));
        assert!(descriptor("tests/registry/unknown").is_none());
    }

    #[test]
    fn test_redefinition_replaces() {
        register::<Registered>();
        register::<Registered>();
        assert!(contains("tests/registry/registered"));
    }
}
