//! Asset and Resource Identifiers
//!
//! Thin `Copy` newtypes around `u32` hashes. Distinct types prevent mixing up
//! asset IDs with the resource IDs of loaded blueprints. All IDs are FNV1a
//! hashes of the source name so they stay stable across runs; this is what
//! makes the persisted cache blob reusable.

use crate::hash::fnv1a_32;

/// Identifier of a source asset (shader blueprint file, shader piece file).
///
/// Derived from the asset's virtual filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(pub u32);

impl AssetId {
    /// Hash an asset name into its ID.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(fnv1a_32(name.as_bytes()))
    }
}

/// Identifier of a loaded shader blueprint resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderBlueprintResourceId(pub u32);

impl ShaderBlueprintResourceId {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(fnv1a_32(name.as_bytes()))
    }
}

/// Identifier of a loaded material blueprint resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialBlueprintResourceId(pub u32);

impl MaterialBlueprintResourceId {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(fnv1a_32(name.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_distinct() {
        assert_eq!(
            AssetId::from_name("Standard.shader_blueprint"),
            AssetId::from_name("Standard.shader_blueprint")
        );
        assert_ne!(
            AssetId::from_name("Standard.shader_blueprint"),
            AssetId::from_name("Sky.shader_blueprint")
        );
    }
}
