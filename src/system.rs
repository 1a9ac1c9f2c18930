//! Pipeline State System
//!
//! The crate's front door. Owns the process-global caches, the asynchronous
//! compiler and the shader repository handle, and wires them into every
//! lookup so callers deal in material blueprint IDs and shader properties
//! only.
//!
//! Hot reload enters here too: `on_shader_piece_reloaded` and
//! `on_shader_blueprint_reloaded` walk the dependency graph downward and
//! invalidate exactly the caches built from the changed asset.

use std::sync::Arc;

use crate::asset::{AssetId, MaterialBlueprintResourceId, ShaderBlueprintResourceId};
use crate::blueprint::{MaterialBlueprintResource, ShaderRepository};
use crate::cache::compute::ComputePipelineStateCache;
use crate::cache::graphics::GraphicsPipelineStateCache;
use crate::cache::program::GraphicsProgramCacheManager;
use crate::cache::shader::ShaderCacheManager;
use crate::cache::PipelineEnvironment;
use crate::compiler::{
    BackgroundPipelineStateCompiler, ImmediatePipelineStateCompiler, PipelineStateCompiler,
};
use crate::error::{CrucibleError, Result};
use crate::persist::{BlobReader, BlobWriter};
use crate::properties::ShaderProperties;
use crate::rhi::{SerializedGraphicsPipelineStateHash, ShaderLanguage};

const SYSTEM_CACHE_MAGIC: [u8; 4] = *b"CRUC";

/// Owns the shader, program and pipeline state caching machinery.
pub struct PipelineStateSystem {
    environment: PipelineEnvironment,
    compiler: Box<dyn PipelineStateCompiler>,
}

impl PipelineStateSystem {
    /// System with a background compiler thread. The usual runtime setup.
    #[must_use]
    pub fn new(
        repository: Arc<ShaderRepository>,
        shader_language: Arc<dyn ShaderLanguage>,
    ) -> Self {
        let environment = Self::make_environment(repository, shader_language);
        let compiler = Box::new(BackgroundPipelineStateCompiler::new(environment.clone()));
        Self {
            environment,
            compiler,
        }
    }

    /// System that compiles inline on the calling thread. For tools, cache
    /// warmers and deterministic tests.
    #[must_use]
    pub fn with_immediate_compiler(
        repository: Arc<ShaderRepository>,
        shader_language: Arc<dyn ShaderLanguage>,
    ) -> Self {
        let environment = Self::make_environment(repository, shader_language);
        let compiler = Box::new(ImmediatePipelineStateCompiler::new(environment.clone()));
        Self {
            environment,
            compiler,
        }
    }

    fn make_environment(
        repository: Arc<ShaderRepository>,
        shader_language: Arc<dyn ShaderLanguage>,
    ) -> PipelineEnvironment {
        PipelineEnvironment {
            repository,
            shader_language,
            shader_cache_manager: Arc::new(ShaderCacheManager::new()),
            graphics_program_cache_manager: Arc::new(GraphicsProgramCacheManager::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn repository(&self) -> &Arc<ShaderRepository> {
        &self.environment.repository
    }

    #[inline]
    #[must_use]
    pub fn environment(&self) -> &PipelineEnvironment {
        &self.environment
    }

    #[inline]
    #[must_use]
    pub fn shader_cache_manager(&self) -> &ShaderCacheManager {
        &self.environment.shader_cache_manager
    }

    #[inline]
    #[must_use]
    pub fn graphics_program_cache_manager(&self) -> &GraphicsProgramCacheManager {
        &self.environment.graphics_program_cache_manager
    }

    /// Graphics pipeline state cache entry for a draw request.
    ///
    /// The returned entry may be serving a fallback; check
    /// [`GraphicsPipelineStateCache::is_using_fallback`] when exactness
    /// matters more than latency.
    pub fn get_graphics_pipeline_state(
        &self,
        material_blueprint_resource_id: MaterialBlueprintResourceId,
        serialized_state_hash: SerializedGraphicsPipelineStateHash,
        shader_properties: ShaderProperties,
        allow_emergency_sync: bool,
    ) -> Result<Arc<GraphicsPipelineStateCache>> {
        let material_blueprint = self.material_blueprint(material_blueprint_resource_id)?;
        material_blueprint
            .graphics_pipeline_state_cache_manager()
            .get_pipeline_state_cache(
                &self.environment,
                self.compiler.as_ref(),
                &material_blueprint,
                serialized_state_hash,
                shader_properties,
                allow_emergency_sync,
            )
    }

    /// Compute pipeline state cache entry for a dispatch request.
    pub fn get_compute_pipeline_state(
        &self,
        material_blueprint_resource_id: MaterialBlueprintResourceId,
        shader_properties: ShaderProperties,
        allow_emergency_sync: bool,
    ) -> Result<Arc<ComputePipelineStateCache>> {
        let material_blueprint = self.material_blueprint(material_blueprint_resource_id)?;
        material_blueprint
            .compute_pipeline_state_cache_manager()
            .get_pipeline_state_cache(
                &self.environment,
                self.compiler.as_ref(),
                &material_blueprint,
                shader_properties,
                allow_emergency_sync,
            )
    }

    fn material_blueprint(
        &self,
        id: MaterialBlueprintResourceId,
    ) -> Result<Arc<MaterialBlueprintResource>> {
        self.environment
            .repository
            .material_blueprint(id)
            .ok_or(CrucibleError::MaterialBlueprintNotFound(id))
    }

    /// Block until the asynchronous compiler has drained its queue.
    pub fn wait_idle(&self) {
        self.compiler.wait_idle();
    }

    /// A shader piece asset changed on disk. Invalidates every blueprint
    /// that includes it, and everything built on top.
    pub fn on_shader_piece_reloaded(&self, asset_id: AssetId) {
        log::info!("shader piece {asset_id:?} reloaded");
        for blueprint_id in self
            .environment
            .repository
            .blueprints_including_piece(asset_id)
        {
            self.invalidate_shader_blueprint(blueprint_id);
        }
    }

    /// A shader blueprint asset changed on disk.
    pub fn on_shader_blueprint_reloaded(&self, blueprint_id: ShaderBlueprintResourceId) {
        log::info!("shader blueprint {blueprint_id:?} reloaded");
        self.invalidate_shader_blueprint(blueprint_id);
    }

    fn invalidate_shader_blueprint(&self, blueprint_id: ShaderBlueprintResourceId) {
        let removed_shader_caches = self
            .environment
            .shader_cache_manager
            .invalidate_shader_blueprint(blueprint_id);
        self.environment
            .graphics_program_cache_manager
            .invalidate_shader_caches(&removed_shader_caches);

        for material_blueprint in self.environment.repository.material_blueprints() {
            if material_blueprint.references_shader_blueprint(blueprint_id) {
                material_blueprint
                    .graphics_pipeline_state_cache_manager()
                    .clear_cache();
                material_blueprint
                    .compute_pipeline_state_cache_manager()
                    .clear_cache();
                material_blueprint.bump_shader_combination_generation();
            }
        }
    }

    /// Drop every cache. In-flight async compiles are invalidated by the
    /// generation bump inside each pipeline state cache clear.
    pub fn clear_cache(&self) {
        for material_blueprint in self.environment.repository.material_blueprints() {
            material_blueprint
                .graphics_pipeline_state_cache_manager()
                .clear_cache();
            material_blueprint
                .compute_pipeline_state_cache_manager()
                .clear_cache();
        }
        self.environment.graphics_program_cache_manager.clear();
        self.environment.shader_cache_manager.clear();
    }

    /// Serialize every cache into one blob: shader bytecode first, then the
    /// pipeline state signature inputs of each material blueprint. Waits for
    /// the compiler so in-flight results are included.
    pub fn save_cache(&self, writer: &mut dyn std::io::Write) -> Result<()> {
        self.wait_idle();

        let mut blob_writer = BlobWriter::new(writer);
        blob_writer.write_header(SYSTEM_CACHE_MAGIC, self.environment.shader_language.name())?;

        let mut shader_section = Vec::new();
        self.environment
            .shader_cache_manager
            .save_cache(self.environment.shader_language.as_ref(), &mut shader_section)?;
        blob_writer.write_bytes(&shader_section)?;

        let material_blueprints = self.environment.repository.material_blueprints();
        blob_writer.write_u32(material_blueprints.len() as u32)?;
        for material_blueprint in material_blueprints {
            blob_writer.write_u32(material_blueprint.resource_id().0)?;

            // Length-prefixed so loading can skip materials that no longer
            // exist without understanding their record layout.
            let mut section = Vec::new();
            material_blueprint
                .graphics_pipeline_state_cache_manager()
                .save_cache(&self.environment, &mut section)?;
            material_blueprint
                .compute_pipeline_state_cache_manager()
                .save_cache(&self.environment, &mut section)?;
            blob_writer.write_bytes(&section)?;
        }
        Ok(())
    }

    /// Restore a blob written by [`Self::save_cache`].
    ///
    /// Returns the number of restored pipeline state entries. A stale header
    /// restores nothing; sections of unknown material blueprints are skipped.
    pub fn load_cache(&self, reader: &mut dyn std::io::Read) -> Result<usize> {
        let mut blob_reader = BlobReader::new(reader);
        if !blob_reader.read_header(SYSTEM_CACHE_MAGIC, self.environment.shader_language.name())? {
            log::info!("pipeline cache blob is stale, starting cold");
            return Ok(0);
        }

        let shader_section = blob_reader.read_bytes()?;
        self.environment.shader_cache_manager.load_cache(
            &self.environment.repository,
            self.environment.shader_language.as_ref(),
            &mut shader_section.as_slice(),
        )?;

        let material_count = blob_reader.read_u32()?;
        let mut restored = 0;
        for _ in 0..material_count {
            let material_id = MaterialBlueprintResourceId(blob_reader.read_u32()?);
            let section = blob_reader.read_bytes()?;
            let Some(material_blueprint) =
                self.environment.repository.material_blueprint(material_id)
            else {
                log::warn!("skipping cache section of unknown material blueprint {material_id:?}");
                continue;
            };
            let mut cursor = section.as_slice();
            restored += material_blueprint
                .graphics_pipeline_state_cache_manager()
                .load_cache(&self.environment, &material_blueprint, &mut cursor)?;
            restored += material_blueprint
                .compute_pipeline_state_cache_manager()
                .load_cache(&self.environment, &material_blueprint, &mut cursor)?;
        }
        log::info!("restored {restored} pipeline state cache entries from disk");
        Ok(restored)
    }
}
