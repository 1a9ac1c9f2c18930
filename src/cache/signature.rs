//! Pipeline State Signatures
//!
//! A signature identifies one fully-specified pipeline state request. From
//! its inputs — material blueprint, serialized fixed-function state hash and
//! the optimized shader properties — it derives:
//!
//! - the **signature ID**: FNV1a fold over all inputs, the key of the
//!   pipeline state cache;
//! - per graphics stage, a **shader combination ID**: FNV1a over the stage's
//!   shader blueprint resource ID and the subset of the properties that
//!   blueprint actually references, the key of the shader cache.
//!
//! Restricting each stage to its referenced properties means a property only
//! the fragment shader reads cannot fragment the vertex shader cache.
//!
//! Known limitation: IDs are 32-bit hashes used directly as keys; collisions
//! are accepted as the standard hash-cache tradeoff. Two signatures with
//! equal derived IDs are assumed to come from equal inputs; debug builds
//! verify this on cache hits.

use crate::asset::MaterialBlueprintResourceId;
use crate::blueprint::{MaterialBlueprintResource, ShaderRepository};
use crate::error::{CrucibleError, Result};
use crate::hash::Fnv1a32;
use crate::properties::ShaderProperties;
use crate::rhi::{SerializedGraphicsPipelineStateHash, ShaderStage};

/// Identifies one graphics pipeline state request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineStateSignatureId(pub u32);

/// Identifies one compute pipeline state request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePipelineStateSignatureId(pub u32);

/// Identifies one (shader blueprint, referenced property subset) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderCombinationId(pub u32);

/// Fully-derived identity of a graphics pipeline state request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsPipelineStateSignature {
    material_blueprint_resource_id: MaterialBlueprintResourceId,
    serialized_graphics_pipeline_state_hash: SerializedGraphicsPipelineStateHash,
    shader_properties: ShaderProperties,
    signature_id: GraphicsPipelineStateSignatureId,
    shader_combination_ids:
        [Option<ShaderCombinationId>; ShaderStage::NUMBER_OF_GRAPHICS_STAGES],
}

impl GraphicsPipelineStateSignature {
    /// Derive the signature for a pipeline state request.
    ///
    /// Fails when a stage slot of the material blueprint names a shader
    /// blueprint resource that is not loaded.
    pub fn new(
        material_blueprint: &MaterialBlueprintResource,
        repository: &ShaderRepository,
        serialized_graphics_pipeline_state_hash: SerializedGraphicsPipelineStateHash,
        shader_properties: ShaderProperties,
    ) -> Result<Self> {
        let mut shader_combination_ids = [None; ShaderStage::NUMBER_OF_GRAPHICS_STAGES];
        for (index, stage) in ShaderStage::GRAPHICS.iter().enumerate() {
            let Some(blueprint_id) = material_blueprint.graphics_shader_blueprint(*stage) else {
                continue;
            };
            let blueprint = repository
                .shader_blueprint(blueprint_id)
                .ok_or(CrucibleError::ShaderBlueprintNotFound(blueprint_id))?;

            let mut hasher = Fnv1a32::new();
            hasher.write_u32(blueprint_id.0);
            for property in shader_properties
                .iter()
                .filter(|p| blueprint.references_property(p.property_id))
            {
                hasher.write_u32(property.property_id.0);
                hasher.write_i32(property.value);
            }
            shader_combination_ids[index] = Some(ShaderCombinationId(hasher.finish()));
        }

        let mut hasher = Fnv1a32::new();
        hasher.write_u32(material_blueprint.resource_id().0);
        hasher.write_u32(serialized_graphics_pipeline_state_hash.0);
        for property in shader_properties.iter() {
            hasher.write_u32(property.property_id.0);
            hasher.write_i32(property.value);
        }

        Ok(Self {
            material_blueprint_resource_id: material_blueprint.resource_id(),
            serialized_graphics_pipeline_state_hash,
            shader_properties,
            signature_id: GraphicsPipelineStateSignatureId(hasher.finish()),
            shader_combination_ids,
        })
    }

    #[inline]
    #[must_use]
    pub fn signature_id(&self) -> GraphicsPipelineStateSignatureId {
        self.signature_id
    }

    /// Shader combination ID for one graphics stage; `None` when the stage is
    /// absent from the material blueprint (not an error — not every material
    /// uses every stage).
    #[must_use]
    pub fn shader_combination_id(&self, stage: ShaderStage) -> Option<ShaderCombinationId> {
        stage
            .graphics_index()
            .and_then(|index| self.shader_combination_ids[index])
    }

    #[inline]
    #[must_use]
    pub fn material_blueprint_resource_id(&self) -> MaterialBlueprintResourceId {
        self.material_blueprint_resource_id
    }

    #[inline]
    #[must_use]
    pub fn serialized_graphics_pipeline_state_hash(&self) -> SerializedGraphicsPipelineStateHash {
        self.serialized_graphics_pipeline_state_hash
    }

    #[inline]
    #[must_use]
    pub fn shader_properties(&self) -> &ShaderProperties {
        &self.shader_properties
    }
}

/// Fully-derived identity of a compute pipeline state request.
///
/// Compute dispatches carry no fixed-function state, so the signature folds
/// only the material blueprint ID and the shader properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputePipelineStateSignature {
    material_blueprint_resource_id: MaterialBlueprintResourceId,
    shader_properties: ShaderProperties,
    signature_id: ComputePipelineStateSignatureId,
    shader_combination_id: Option<ShaderCombinationId>,
}

impl ComputePipelineStateSignature {
    pub fn new(
        material_blueprint: &MaterialBlueprintResource,
        repository: &ShaderRepository,
        shader_properties: ShaderProperties,
    ) -> Result<Self> {
        let shader_combination_id = match material_blueprint.compute_shader_blueprint() {
            Some(blueprint_id) => {
                let blueprint = repository
                    .shader_blueprint(blueprint_id)
                    .ok_or(CrucibleError::ShaderBlueprintNotFound(blueprint_id))?;
                let mut hasher = Fnv1a32::new();
                hasher.write_u32(blueprint_id.0);
                for property in shader_properties
                    .iter()
                    .filter(|p| blueprint.references_property(p.property_id))
                {
                    hasher.write_u32(property.property_id.0);
                    hasher.write_i32(property.value);
                }
                Some(ShaderCombinationId(hasher.finish()))
            }
            None => None,
        };

        let mut hasher = Fnv1a32::new();
        hasher.write_u32(material_blueprint.resource_id().0);
        for property in shader_properties.iter() {
            hasher.write_u32(property.property_id.0);
            hasher.write_i32(property.value);
        }

        Ok(Self {
            material_blueprint_resource_id: material_blueprint.resource_id(),
            shader_properties,
            signature_id: ComputePipelineStateSignatureId(hasher.finish()),
            shader_combination_id,
        })
    }

    #[inline]
    #[must_use]
    pub fn signature_id(&self) -> ComputePipelineStateSignatureId {
        self.signature_id
    }

    #[inline]
    #[must_use]
    pub fn shader_combination_id(&self) -> Option<ShaderCombinationId> {
        self.shader_combination_id
    }

    #[inline]
    #[must_use]
    pub fn material_blueprint_resource_id(&self) -> MaterialBlueprintResourceId {
        self.material_blueprint_resource_id
    }

    #[inline]
    #[must_use]
    pub fn shader_properties(&self) -> &ShaderProperties {
        &self.shader_properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{AssetId, ShaderBlueprintResourceId};
    use crate::blueprint::ShaderBlueprintResource;
    use crate::properties::ShaderPropertyId;

    fn repository_with_blueprints() -> (ShaderRepository, MaterialBlueprintResource) {
        let repository = ShaderRepository::new();
        let vertex_id = ShaderBlueprintResourceId::from_name("test/vertex");
        let fragment_id = ShaderBlueprintResourceId::from_name("test/fragment");
        repository.add_shader_blueprint(ShaderBlueprintResource::new(
            vertex_id,
            AssetId::from_name("test/vertex.blueprint"),
            "void main() {}",
            Vec::new(),
            ShaderBlueprintResource::referenced_from_names(&["HAS_SKINNING"]),
        ));
        repository.add_shader_blueprint(ShaderBlueprintResource::new(
            fragment_id,
            AssetId::from_name("test/fragment.blueprint"),
            "void main() {}",
            Vec::new(),
            ShaderBlueprintResource::referenced_from_names(&["USE_NORMAL_MAP"]),
        ));
        let material = MaterialBlueprintResource::graphics(
            MaterialBlueprintResourceId::from_name("test/material"),
            [Some(vertex_id), None, None, None, Some(fragment_id)],
        );
        (repository, material)
    }

    #[test]
    fn equal_inputs_produce_equal_ids() {
        let (repository, material) = repository_with_blueprints();
        let state_hash = SerializedGraphicsPipelineStateHash::from_state_blob(b"opaque");
        let properties = ShaderProperties::from([("USE_NORMAL_MAP", 1)].as_slice());

        let a = GraphicsPipelineStateSignature::new(
            &material,
            &repository,
            state_hash,
            properties.clone(),
        )
        .unwrap();
        let b =
            GraphicsPipelineStateSignature::new(&material, &repository, state_hash, properties)
                .unwrap();

        assert_eq!(a.signature_id(), b.signature_id());
        for stage in ShaderStage::GRAPHICS {
            assert_eq!(a.shader_combination_id(stage), b.shader_combination_id(stage));
        }
    }

    #[test]
    fn absent_stages_have_no_combination_id() {
        let (repository, material) = repository_with_blueprints();
        let signature = GraphicsPipelineStateSignature::new(
            &material,
            &repository,
            SerializedGraphicsPipelineStateHash(0),
            ShaderProperties::new(),
        )
        .unwrap();

        assert!(signature.shader_combination_id(ShaderStage::Vertex).is_some());
        assert!(signature.shader_combination_id(ShaderStage::Geometry).is_none());
        assert!(signature.shader_combination_id(ShaderStage::Compute).is_none());
    }

    #[test]
    fn unreferenced_property_changes_signature_but_not_combination() {
        let (repository, material) = repository_with_blueprints();
        let state_hash = SerializedGraphicsPipelineStateHash(0);

        let base = GraphicsPipelineStateSignature::new(
            &material,
            &repository,
            state_hash,
            ShaderProperties::from([("USE_NORMAL_MAP", 1)].as_slice()),
        )
        .unwrap();
        let with_unrelated = GraphicsPipelineStateSignature::new(
            &material,
            &repository,
            state_hash,
            ShaderProperties::from([("USE_NORMAL_MAP", 1), ("UNRELATED", 1)].as_slice()),
        )
        .unwrap();

        assert_ne!(base.signature_id(), with_unrelated.signature_id());
        assert_eq!(
            base.shader_combination_id(ShaderStage::Fragment),
            with_unrelated.shader_combination_id(ShaderStage::Fragment)
        );
        assert_eq!(
            base.shader_combination_id(ShaderStage::Vertex),
            with_unrelated.shader_combination_id(ShaderStage::Vertex)
        );
    }

    #[test]
    fn referenced_property_value_changes_combination_id() {
        let (repository, material) = repository_with_blueprints();
        let state_hash = SerializedGraphicsPipelineStateHash(0);

        let on = GraphicsPipelineStateSignature::new(
            &material,
            &repository,
            state_hash,
            ShaderProperties::from([("USE_NORMAL_MAP", 1)].as_slice()),
        )
        .unwrap();
        let off = GraphicsPipelineStateSignature::new(
            &material,
            &repository,
            state_hash,
            ShaderProperties::from([("USE_NORMAL_MAP", 0)].as_slice()),
        )
        .unwrap();

        assert_ne!(
            on.shader_combination_id(ShaderStage::Fragment),
            off.shader_combination_id(ShaderStage::Fragment)
        );
        // The vertex blueprint does not read USE_NORMAL_MAP.
        assert_eq!(
            on.shader_combination_id(ShaderStage::Vertex),
            off.shader_combination_id(ShaderStage::Vertex)
        );
    }

    #[test]
    fn missing_blueprint_resource_is_an_error() {
        let repository = ShaderRepository::new();
        let material = MaterialBlueprintResource::graphics(
            MaterialBlueprintResourceId::from_name("test/material"),
            [Some(ShaderBlueprintResourceId::from_name("missing")), None, None, None, None],
        );
        let result = GraphicsPipelineStateSignature::new(
            &material,
            &repository,
            SerializedGraphicsPipelineStateHash(0),
            ShaderProperties::new(),
        );
        assert!(matches!(
            result,
            Err(CrucibleError::ShaderBlueprintNotFound(_))
        ));
    }

    #[test]
    fn compute_signature_reflects_property_subset() {
        let repository = ShaderRepository::new();
        let compute_id = ShaderBlueprintResourceId::from_name("test/compute");
        repository.add_shader_blueprint(ShaderBlueprintResource::new(
            compute_id,
            AssetId::from_name("test/compute.blueprint"),
            "void main() {}",
            Vec::new(),
            ShaderBlueprintResource::referenced_from_names(&["TILE_SIZE"]),
        ));
        let material = MaterialBlueprintResource::compute(
            MaterialBlueprintResourceId::from_name("test/compute_material"),
            compute_id,
        );

        let a = ComputePipelineStateSignature::new(
            &material,
            &repository,
            ShaderProperties::from([("TILE_SIZE", 8)].as_slice()),
        )
        .unwrap();
        let b = ComputePipelineStateSignature::new(
            &material,
            &repository,
            ShaderProperties::from([("TILE_SIZE", 16)].as_slice()),
        )
        .unwrap();

        assert_ne!(a.shader_combination_id(), b.shader_combination_id());
        assert_ne!(a.signature_id(), b.signature_id());
    }

    #[test]
    fn property_insertion_order_does_not_matter() {
        let (repository, material) = repository_with_blueprints();
        let state_hash = SerializedGraphicsPipelineStateHash(0);

        let mut forward = ShaderProperties::new();
        forward.set_property_value(ShaderPropertyId::from_name("USE_NORMAL_MAP"), 1);
        forward.set_property_value(ShaderPropertyId::from_name("HAS_SKINNING"), 1);

        let mut reverse = ShaderProperties::new();
        reverse.set_property_value(ShaderPropertyId::from_name("HAS_SKINNING"), 1);
        reverse.set_property_value(ShaderPropertyId::from_name("USE_NORMAL_MAP"), 1);

        let a = GraphicsPipelineStateSignature::new(&material, &repository, state_hash, forward)
            .unwrap();
        let b = GraphicsPipelineStateSignature::new(&material, &repository, state_hash, reverse)
            .unwrap();
        assert_eq!(a.signature_id(), b.signature_id());
    }
}
