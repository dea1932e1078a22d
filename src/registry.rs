//! Mapping between wire type names and local type descriptions.

use std::collections::HashMap;
use std::sync::Arc;

/// Description of one translatable object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    /// Name the type travels under on the wire.
    pub wire_name: String,
    /// Name decoded objects carry locally.
    pub local_name: String,
    /// Canonical field order used when emitting class definitions. May
    /// be empty, in which case the first encoded instance fixes the
    /// order.
    pub fields: Vec<String>,
}

impl TypeDef {
    pub fn new(
        wire_name: impl Into<String>,
        local_name: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            wire_name: wire_name.into(),
            local_name: local_name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Read-only mapping consulted by the codec in both directions.
///
/// Populated once through [TypeRegistry::builder] and frozen. The same
/// registry serves any number of concurrent invocations without
/// locking; wire type names it does not know decode to a generic
/// structural value instead of failing.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_wire: HashMap<String, Arc<TypeDef>>,
    by_local: HashMap<String, Arc<TypeDef>>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Registry without any entries. Objects keep their wire names.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn by_wire_name(&self, wire_name: &str) -> Option<&TypeDef> {
        self.by_wire.get(wire_name).map(Arc::as_ref)
    }

    pub fn by_local_name(&self, local_name: &str) -> Option<&TypeDef> {
        self.by_local.get(local_name).map(Arc::as_ref)
    }
}

#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    defs: Vec<TypeDef>,
}

impl TypeRegistryBuilder {
    /// Add a type. A later registration under the same wire or local
    /// name replaces the earlier one.
    pub fn register(mut self, def: TypeDef) -> Self {
        self.defs.push(def);
        self
    }

    pub fn build(self) -> TypeRegistry {
        let mut registry = TypeRegistry::default();
        for def in self.defs {
            let def = Arc::new(def);
            registry
                .by_wire
                .insert(def.wire_name.clone(), Arc::clone(&def));
            registry.by_local.insert(def.local_name.clone(), def);
        }
        registry
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolves_both_directions() {
        let registry = TypeRegistry::builder()
            .register(TypeDef::new("com.example.Point", "Point", vec!["x", "y"]))
            .build();
        let def = registry.by_wire_name("com.example.Point").unwrap();
        assert_eq!(def.local_name, "Point");
        let def = registry.by_local_name("Point").unwrap();
        assert_eq!(def.wire_name, "com.example.Point");
        assert!(registry.by_wire_name("com.example.Other").is_none());
    }

    #[test]
    fn later_registration_wins() {
        let registry = TypeRegistry::builder()
            .register(TypeDef::new("com.example.Point", "Point", vec!["x"]))
            .register(TypeDef::new("com.example.Point", "Point", vec!["x", "y"]))
            .build();
        let def = registry.by_wire_name("com.example.Point").unwrap();
        assert_eq!(def.fields, vec!["x".to_string(), "y".to_string()]);
    }
}
