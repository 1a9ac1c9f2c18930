//! Shader Properties
//!
//! The atomic unit of shader variation description: an ordered, deduplicated
//! set of `(property ID, i32 value)` pairs. Property IDs are FNV1a hashes of
//! the property name, so a property set hashes identically across runs.
//!
//! Internally an ordered `Vec` kept sorted by property ID; identical sets
//! always produce identical hash values regardless of insertion order.
//!
//! - Insertion / lookup: O(log n) binary search
//! - Hashing: O(n), deterministic
//! - Equality: value-wise (order-independent given the sorted invariant)

use std::hash::{Hash, Hasher};

use crate::hash::fnv1a_32;

/// Hashed shader property name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderPropertyId(pub u32);

impl ShaderPropertyId {
    /// Hash a property name into its ID.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(fnv1a_32(name.as_bytes()))
    }
}

/// One shader property: hashed name plus integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderProperty {
    pub property_id: ShaderPropertyId,
    pub value: i32,
}

/// An ordered, deduplicated collection of shader properties.
///
/// Built per shader-build request — either the properties referenced by a
/// blueprint, or the optimized set merged from a material instance — and
/// treated as immutable once handed to signature hashing.
#[derive(Debug, Clone, Default)]
pub struct ShaderProperties {
    properties: Vec<ShaderProperty>,
}

impl ShaderProperties {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            properties: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            properties: Vec::with_capacity(capacity),
        }
    }

    /// Insert or overwrite a property value, keeping the vector sorted by ID.
    pub fn set_property_value(&mut self, property_id: ShaderPropertyId, value: i32) {
        match self
            .properties
            .binary_search_by_key(&property_id, |p| p.property_id)
        {
            Ok(index) => self.properties[index].value = value,
            Err(index) => self.properties.insert(index, ShaderProperty { property_id, value }),
        }
    }

    /// Look up a property value.
    #[must_use]
    pub fn get_property_value(&self, property_id: ShaderPropertyId) -> Option<i32> {
        self.properties
            .binary_search_by_key(&property_id, |p| p.property_id)
            .ok()
            .map(|index| self.properties[index].value)
    }

    /// Look up a property value, falling back to `default` when absent.
    #[inline]
    #[must_use]
    pub fn get_property_value_or(&self, property_id: ShaderPropertyId, default: i32) -> i32 {
        self.get_property_value(property_id).unwrap_or(default)
    }

    /// Whether the property is present.
    #[must_use]
    pub fn has_property_value(&self, property_id: ShaderPropertyId) -> bool {
        self.properties
            .binary_search_by_key(&property_id, |p| p.property_id)
            .is_ok()
    }

    /// Merge another property set into this one; `other`'s entries override on
    /// conflict.
    pub fn set_property_values(&mut self, other: &ShaderProperties) {
        for property in &other.properties {
            self.set_property_value(property.property_id, property.value);
        }
    }

    /// Remove a property. Returns whether it was present.
    pub fn remove_property_value(&mut self, property_id: ShaderPropertyId) -> bool {
        if let Ok(index) = self
            .properties
            .binary_search_by_key(&property_id, |p| p.property_id)
        {
            self.properties.remove(index);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.properties.clear();
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Sorted property slice (ascending by property ID).
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[ShaderProperty] {
        &self.properties
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &ShaderProperty> {
        self.properties.iter()
    }
}

impl Hash for ShaderProperties {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.properties.hash(state);
    }
}

impl PartialEq for ShaderProperties {
    fn eq(&self, other: &Self) -> bool {
        self.properties == other.properties
    }
}

impl Eq for ShaderProperties {}

impl From<&[(&str, i32)]> for ShaderProperties {
    fn from(pairs: &[(&str, i32)]) -> Self {
        let mut properties = Self::with_capacity(pairs.len());
        for (name, value) in pairs {
            properties.set_property_value(ShaderPropertyId::from_name(name), *value);
        }
        properties
    }
}
