//! Blueprint Resources
//!
//! In-memory representations of the loaded shader assets the caching layer
//! consumes: shader pieces (named fragment libraries), shader blueprints (one
//! template per shader stage) and material blueprints (the per-material
//! mapping from pipeline stages to shader blueprints, plus the owner of that
//! material's pipeline state caches).
//!
//! Asset loading itself (files, decompression, async dispatch) is an external
//! collaborator; this module only stores the decoded results and answers the
//! queries the cache hierarchy needs, including the reverse lookups used by
//! hot-reload invalidation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use xxhash_rust::xxh3::xxh3_64;

use crate::asset::{AssetId, MaterialBlueprintResourceId, ShaderBlueprintResourceId};
use crate::cache::compute::ComputePipelineStateCacheManager;
use crate::cache::graphics::GraphicsPipelineStateCacheManager;
use crate::error::{CrucibleError, Result};
use crate::properties::ShaderPropertyId;
use crate::rhi::ShaderStage;

/// A loaded shader piece asset: a reusable fragment library whose `@piece`
/// definitions blueprints pull in via `@insertpiece`.
#[derive(Debug, Clone)]
pub struct ShaderPieceResource {
    pub asset_id: AssetId,
    /// Content hash of the source text; folds into
    /// [`crate::builder::BuildShader::combined_asset_file_hash`].
    pub file_hash: u64,
    pub source_code: String,
}

impl ShaderPieceResource {
    #[must_use]
    pub fn new(asset_id: AssetId, source_code: impl Into<String>) -> Self {
        let source_code = source_code.into();
        let file_hash = xxh3_64(source_code.as_bytes());
        Self {
            asset_id,
            file_hash,
            source_code,
        }
    }
}

/// A loaded shader blueprint asset: the template for one shader stage.
#[derive(Debug, Clone)]
pub struct ShaderBlueprintResource {
    pub resource_id: ShaderBlueprintResourceId,
    pub asset_id: AssetId,
    pub file_hash: u64,
    /// Shader piece assets this blueprint includes, in include order.
    pub include_piece_asset_ids: Vec<AssetId>,
    /// Sorted, deduplicated property IDs this blueprint's template reads.
    /// Only these participate in the stage's shader combination ID, so
    /// properties a stage never looks at cannot fragment its shader cache.
    referenced_properties: Vec<ShaderPropertyId>,
    pub source_code: String,
}

impl ShaderBlueprintResource {
    #[must_use]
    pub fn new(
        resource_id: ShaderBlueprintResourceId,
        asset_id: AssetId,
        source_code: impl Into<String>,
        include_piece_asset_ids: Vec<AssetId>,
        mut referenced_properties: Vec<ShaderPropertyId>,
    ) -> Self {
        let source_code = source_code.into();
        let file_hash = xxh3_64(source_code.as_bytes());
        referenced_properties.sort_unstable();
        referenced_properties.dedup();
        Self {
            resource_id,
            asset_id,
            file_hash,
            include_piece_asset_ids,
            referenced_properties,
            source_code,
        }
    }

    /// Hash a list of property names into referenced-property IDs.
    #[must_use]
    pub fn referenced_from_names(names: &[&str]) -> Vec<ShaderPropertyId> {
        names.iter().map(|n| ShaderPropertyId::from_name(n)).collect()
    }

    /// Whether this blueprint's template reads the given property.
    #[must_use]
    pub fn references_property(&self, property_id: ShaderPropertyId) -> bool {
        self.referenced_properties.binary_search(&property_id).is_ok()
    }

    #[must_use]
    pub fn referenced_properties(&self) -> &[ShaderPropertyId] {
        &self.referenced_properties
    }
}

/// A loaded material blueprint resource.
///
/// Maps each pipeline stage to a shader blueprint and exclusively owns the
/// pipeline state cache managers for this material. The shader combination
/// generation counter increments whenever hot reload invalidates this
/// material's caches, letting dependent systems detect staleness.
#[derive(Debug)]
pub struct MaterialBlueprintResource {
    resource_id: MaterialBlueprintResourceId,
    graphics_shader_blueprints:
        [Option<ShaderBlueprintResourceId>; ShaderStage::NUMBER_OF_GRAPHICS_STAGES],
    compute_shader_blueprint: Option<ShaderBlueprintResourceId>,
    graphics_pipeline_state_cache_manager: GraphicsPipelineStateCacheManager,
    compute_pipeline_state_cache_manager: ComputePipelineStateCacheManager,
    shader_combination_generation: AtomicU32,
}

impl MaterialBlueprintResource {
    /// A graphics material blueprint. Slots follow [`ShaderStage::GRAPHICS`]
    /// order; absent stages stay `None`.
    #[must_use]
    pub fn graphics(
        resource_id: MaterialBlueprintResourceId,
        graphics_shader_blueprints: [Option<ShaderBlueprintResourceId>;
            ShaderStage::NUMBER_OF_GRAPHICS_STAGES],
    ) -> Self {
        Self {
            resource_id,
            graphics_shader_blueprints,
            compute_shader_blueprint: None,
            graphics_pipeline_state_cache_manager: GraphicsPipelineStateCacheManager::new(
                resource_id,
            ),
            compute_pipeline_state_cache_manager: ComputePipelineStateCacheManager::new(
                resource_id,
            ),
            shader_combination_generation: AtomicU32::new(0),
        }
    }

    /// A compute material blueprint with a single compute shader blueprint.
    #[must_use]
    pub fn compute(
        resource_id: MaterialBlueprintResourceId,
        compute_shader_blueprint: ShaderBlueprintResourceId,
    ) -> Self {
        Self {
            resource_id,
            graphics_shader_blueprints: [None; ShaderStage::NUMBER_OF_GRAPHICS_STAGES],
            compute_shader_blueprint: Some(compute_shader_blueprint),
            graphics_pipeline_state_cache_manager: GraphicsPipelineStateCacheManager::new(
                resource_id,
            ),
            compute_pipeline_state_cache_manager: ComputePipelineStateCacheManager::new(
                resource_id,
            ),
            shader_combination_generation: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn resource_id(&self) -> MaterialBlueprintResourceId {
        self.resource_id
    }

    /// Shader blueprint of one graphics stage; `None` for absent stages and
    /// for [`ShaderStage::Compute`].
    #[must_use]
    pub fn graphics_shader_blueprint(
        &self,
        stage: ShaderStage,
    ) -> Option<ShaderBlueprintResourceId> {
        stage
            .graphics_index()
            .and_then(|index| self.graphics_shader_blueprints[index])
    }

    #[must_use]
    pub fn compute_shader_blueprint(&self) -> Option<ShaderBlueprintResourceId> {
        self.compute_shader_blueprint
    }

    #[inline]
    #[must_use]
    pub fn graphics_pipeline_state_cache_manager(&self) -> &GraphicsPipelineStateCacheManager {
        &self.graphics_pipeline_state_cache_manager
    }

    #[inline]
    #[must_use]
    pub fn compute_pipeline_state_cache_manager(&self) -> &ComputePipelineStateCacheManager {
        &self.compute_pipeline_state_cache_manager
    }

    /// Whether any stage slot (graphics or compute) references the blueprint.
    #[must_use]
    pub fn references_shader_blueprint(&self, id: ShaderBlueprintResourceId) -> bool {
        self.graphics_shader_blueprints
            .iter()
            .any(|slot| *slot == Some(id))
            || self.compute_shader_blueprint == Some(id)
    }

    /// Current shader combination generation.
    #[must_use]
    pub fn shader_combination_generation(&self) -> u32 {
        self.shader_combination_generation.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_shader_combination_generation(&self) {
        self.shader_combination_generation.fetch_add(1, Ordering::Relaxed);
    }
}

/// Storage for loaded shader pieces, shader blueprints and material
/// blueprints.
///
/// Interior locking keeps lookups usable from both the render thread and the
/// background compiler worker. The reverse queries
/// ([`Self::blueprints_including_piece`]) drive hot-reload invalidation.
#[derive(Debug, Default)]
pub struct ShaderRepository {
    pieces: RwLock<FxHashMap<AssetId, Arc<ShaderPieceResource>>>,
    shader_blueprints: RwLock<FxHashMap<ShaderBlueprintResourceId, Arc<ShaderBlueprintResource>>>,
    material_blueprints:
        RwLock<FxHashMap<MaterialBlueprintResourceId, Arc<MaterialBlueprintResource>>>,
}

impl ShaderRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a shader piece asset.
    pub fn add_shader_piece(&self, piece: ShaderPieceResource) -> Arc<ShaderPieceResource> {
        let piece = Arc::new(piece);
        self.pieces.write().insert(piece.asset_id, Arc::clone(&piece));
        piece
    }

    /// Register (or replace) a shader blueprint resource.
    pub fn add_shader_blueprint(
        &self,
        blueprint: ShaderBlueprintResource,
    ) -> Arc<ShaderBlueprintResource> {
        let blueprint = Arc::new(blueprint);
        self.shader_blueprints
            .write()
            .insert(blueprint.resource_id, Arc::clone(&blueprint));
        blueprint
    }

    /// Register a material blueprint resource.
    pub fn add_material_blueprint(
        &self,
        material: MaterialBlueprintResource,
    ) -> Arc<MaterialBlueprintResource> {
        let material = Arc::new(material);
        self.material_blueprints
            .write()
            .insert(material.resource_id(), Arc::clone(&material));
        material
    }

    #[must_use]
    pub fn shader_piece(&self, asset_id: AssetId) -> Option<Arc<ShaderPieceResource>> {
        self.pieces.read().get(&asset_id).cloned()
    }

    #[must_use]
    pub fn shader_blueprint(
        &self,
        resource_id: ShaderBlueprintResourceId,
    ) -> Option<Arc<ShaderBlueprintResource>> {
        self.shader_blueprints.read().get(&resource_id).cloned()
    }

    #[must_use]
    pub fn material_blueprint(
        &self,
        resource_id: MaterialBlueprintResourceId,
    ) -> Option<Arc<MaterialBlueprintResource>> {
        self.material_blueprints.read().get(&resource_id).cloned()
    }

    /// Snapshot of all registered material blueprints.
    #[must_use]
    pub fn material_blueprints(&self) -> Vec<Arc<MaterialBlueprintResource>> {
        self.material_blueprints.read().values().cloned().collect()
    }

    /// Resolve a blueprint's included shader pieces, in include order.
    pub fn shader_pieces_for_blueprint(
        &self,
        blueprint: &ShaderBlueprintResource,
    ) -> Result<Vec<Arc<ShaderPieceResource>>> {
        let pieces = self.pieces.read();
        blueprint
            .include_piece_asset_ids
            .iter()
            .map(|asset_id| {
                pieces
                    .get(asset_id)
                    .cloned()
                    .ok_or(CrucibleError::ShaderPieceNotFound(*asset_id))
            })
            .collect()
    }

    /// Shader blueprints whose include list contains the given piece asset.
    #[must_use]
    pub fn blueprints_including_piece(&self, asset_id: AssetId) -> Vec<ShaderBlueprintResourceId> {
        self.shader_blueprints
            .read()
            .values()
            .filter(|blueprint| blueprint.include_piece_asset_ids.contains(&asset_id))
            .map(|blueprint| blueprint.resource_id)
            .collect()
    }
}
