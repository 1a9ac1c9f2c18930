//! Compute Pipeline State Cache
//!
//! Compute analog of [`super::graphics`], one layer shorter: a compute
//! pipeline state is created straight from the compute shader cache, with no
//! program link and no fixed-function state. Fallback, generation stamping
//! and persistence follow the graphics manager.

use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::asset::MaterialBlueprintResourceId;
use crate::blueprint::MaterialBlueprintResource;
use crate::cache::signature::{ComputePipelineStateSignature, ComputePipelineStateSignatureId};
use crate::cache::PipelineEnvironment;
use crate::compiler::{CompileJob, PipelineStateCompiler};
use crate::error::{CrucibleError, Result};
use crate::persist::{BlobReader, BlobWriter};
use crate::properties::{ShaderProperties, ShaderPropertyId};
use crate::rhi::PipelineStateHandle;

const COMPUTE_PSO_CACHE_MAGIC: [u8; 4] = *b"CCPS";

#[derive(Debug, Default)]
struct PipelineStateSlot {
    pipeline_state: Option<PipelineStateHandle>,
    is_using_fallback: bool,
}

/// One cached compute pipeline state entry.
#[derive(Debug)]
pub struct ComputePipelineStateCache {
    signature: ComputePipelineStateSignature,
    slot: Mutex<PipelineStateSlot>,
}

impl ComputePipelineStateCache {
    fn new(signature: ComputePipelineStateSignature) -> Self {
        Self {
            signature,
            slot: Mutex::new(PipelineStateSlot::default()),
        }
    }

    #[inline]
    #[must_use]
    pub fn signature(&self) -> &ComputePipelineStateSignature {
        &self.signature
    }

    /// Current pipeline state, fallback or real. `None` while an asynchronous
    /// compile is in flight and no fallback was found.
    #[must_use]
    pub fn pipeline_state(&self) -> Option<PipelineStateHandle> {
        self.slot.lock().pipeline_state.clone()
    }

    #[must_use]
    pub fn is_using_fallback(&self) -> bool {
        self.slot.lock().is_using_fallback
    }

    fn install(&self, pipeline_state: PipelineStateHandle, is_fallback: bool) {
        let mut slot = self.slot.lock();
        if is_fallback && slot.pipeline_state.is_some() && !slot.is_using_fallback {
            return;
        }
        slot.pipeline_state = Some(pipeline_state);
        slot.is_using_fallback = is_fallback;
    }
}

/// Per-material-blueprint owner of compute pipeline state cache entries.
pub struct ComputePipelineStateCacheManager {
    material_blueprint_resource_id: MaterialBlueprintResourceId,
    caches: RwLock<FxHashMap<ComputePipelineStateSignatureId, Arc<ComputePipelineStateCache>>>,
    generation: AtomicU32,
}

impl std::fmt::Debug for ComputePipelineStateCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipelineStateCacheManager")
            .field("material_blueprint_resource_id", &self.material_blueprint_resource_id)
            .field("entries", &self.caches.read().len())
            .finish()
    }
}

impl ComputePipelineStateCacheManager {
    #[must_use]
    pub fn new(material_blueprint_resource_id: MaterialBlueprintResourceId) -> Self {
        Self {
            material_blueprint_resource_id,
            caches: RwLock::new(FxHashMap::default()),
            generation: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn material_blueprint_resource_id(&self) -> MaterialBlueprintResourceId {
        self.material_blueprint_resource_id
    }

    /// Compute analog of
    /// [`super::graphics::GraphicsPipelineStateCacheManager::get_pipeline_state_cache`].
    pub fn get_pipeline_state_cache(
        &self,
        environment: &PipelineEnvironment,
        compiler: &dyn PipelineStateCompiler,
        material_blueprint: &Arc<MaterialBlueprintResource>,
        shader_properties: ShaderProperties,
        allow_emergency_sync: bool,
    ) -> Result<Arc<ComputePipelineStateCache>> {
        debug_assert_eq!(
            material_blueprint.resource_id(),
            self.material_blueprint_resource_id
        );
        let signature = ComputePipelineStateSignature::new(
            material_blueprint,
            &environment.repository,
            shader_properties,
        )?;
        let signature_id = signature.signature_id();

        if let Some(cache) = self.caches.read().get(&signature_id) {
            debug_assert_eq!(
                *cache.signature(),
                signature,
                "compute pipeline state signature ID collision"
            );
            return Ok(Arc::clone(cache));
        }

        let fallback = self.find_fallback(environment, material_blueprint, &signature);
        let cache = Arc::new(ComputePipelineStateCache::new(signature.clone()));
        if let Some(fallback) = fallback {
            cache.install(fallback, true);
        }

        let cache = match self.caches.write().entry(signature_id) {
            Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => Arc::clone(slot.insert(cache)),
        };

        if allow_emergency_sync && !cache.is_using_fallback() {
            log::debug!(
                "compute pipeline state {signature_id:?}: no fallback available, compiling synchronously"
            );
            match compile_compute_pipeline_state(environment, &signature) {
                Ok(pipeline_state) => cache.install(pipeline_state, false),
                Err(error) => {
                    self.caches.write().remove(&signature_id);
                    return Err(error);
                }
            }
        } else {
            compiler.queue(CompileJob::Compute {
                material_blueprint: Arc::clone(material_blueprint),
                signature,
                generation: self.generation.load(Ordering::Acquire),
            });
        }
        Ok(cache)
    }

    fn find_fallback(
        &self,
        environment: &PipelineEnvironment,
        material_blueprint: &Arc<MaterialBlueprintResource>,
        signature: &ComputePipelineStateSignature,
    ) -> Option<PipelineStateHandle> {
        let mut properties = signature.shader_properties().clone();
        let caches = self.caches.read();
        while !properties.is_empty() {
            let highest: ShaderPropertyId = properties
                .as_slice()
                .last()
                .map(|property| property.property_id)?;
            properties.remove_property_value(highest);

            let relaxed = ComputePipelineStateSignature::new(
                material_blueprint,
                &environment.repository,
                properties.clone(),
            )
            .ok()?;
            if let Some(candidate) = caches.get(&relaxed.signature_id()) {
                let slot = candidate.slot.lock();
                if !slot.is_using_fallback {
                    if let Some(pipeline_state) = slot.pipeline_state.clone() {
                        return Some(pipeline_state);
                    }
                }
            }
        }
        None
    }

    pub(crate) fn install_async_result(
        &self,
        signature_id: ComputePipelineStateSignatureId,
        generation: u32,
        pipeline_state: PipelineStateHandle,
    ) {
        if generation != self.generation.load(Ordering::Acquire) {
            log::debug!("discarding stale async compute pipeline state for {signature_id:?}");
            return;
        }
        if let Some(cache) = self.caches.read().get(&signature_id) {
            cache.install(pipeline_state, false);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }

    pub fn clear_cache(&self) {
        let mut caches = self.caches.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        caches.clear();
    }

    /// Serialize the signature inputs of every ready entry.
    pub fn save_cache(
        &self,
        environment: &PipelineEnvironment,
        writer: &mut dyn std::io::Write,
    ) -> Result<()> {
        let caches = self.caches.read();
        let ready: Vec<&Arc<ComputePipelineStateCache>> = caches
            .values()
            .filter(|cache| {
                let slot = cache.slot.lock();
                slot.pipeline_state.is_some() && !slot.is_using_fallback
            })
            .collect();

        let mut writer = BlobWriter::new(writer);
        writer.write_header(COMPUTE_PSO_CACHE_MAGIC, environment.shader_language.name())?;
        writer.write_u32(self.material_blueprint_resource_id.0)?;
        writer.write_u32(ready.len() as u32)?;
        for cache in ready {
            let properties = cache.signature().shader_properties();
            writer.write_u32(properties.len() as u32)?;
            for property in properties.iter() {
                writer.write_u32(property.property_id.0)?;
                writer.write_i32(property.value)?;
            }
        }
        Ok(())
    }

    /// Restore persisted entries by re-compiling them synchronously.
    pub fn load_cache(
        &self,
        environment: &PipelineEnvironment,
        material_blueprint: &Arc<MaterialBlueprintResource>,
        reader: &mut dyn std::io::Read,
    ) -> Result<usize> {
        let mut reader = BlobReader::new(reader);
        if !reader.read_header(COMPUTE_PSO_CACHE_MAGIC, environment.shader_language.name())? {
            log::info!(
                "compute pipeline state cache blob for {:?} is stale",
                self.material_blueprint_resource_id
            );
            return Ok(0);
        }
        let stored_material = MaterialBlueprintResourceId(reader.read_u32()?);
        let count = reader.read_u32()?;
        if stored_material != self.material_blueprint_resource_id {
            log::warn!(
                "compute pipeline state cache blob belongs to {stored_material:?}, not {:?}",
                self.material_blueprint_resource_id
            );
            return Ok(0);
        }

        let mut restored = 0;
        for _ in 0..count {
            let property_count = reader.read_u32()?;
            let mut properties = ShaderProperties::with_capacity(property_count as usize);
            for _ in 0..property_count {
                let property_id = ShaderPropertyId(reader.read_u32()?);
                let value = reader.read_i32()?;
                properties.set_property_value(property_id, value);
            }

            // A record whose compute blueprint is no longer registered is as
            // stale as one that fails to compile: skip it, keep restoring.
            let signature = match ComputePipelineStateSignature::new(
                material_blueprint,
                &environment.repository,
                properties,
            ) {
                Ok(signature) => signature,
                Err(error) => {
                    log::warn!("dropping persisted compute pipeline state record: {error}");
                    continue;
                }
            };
            match compile_compute_pipeline_state(environment, &signature) {
                Ok(pipeline_state) => {
                    let cache = Arc::new(ComputePipelineStateCache::new(signature.clone()));
                    cache.install(pipeline_state, false);
                    self.caches.write().insert(signature.signature_id(), cache);
                    restored += 1;
                }
                Err(error) => {
                    log::warn!(
                        "dropping persisted compute pipeline state {:?}: {error}",
                        signature.signature_id()
                    );
                }
            }
        }
        Ok(restored)
    }
}

/// Synchronous build of a compute pipeline state from its shader cache.
pub(crate) fn compile_compute_pipeline_state(
    environment: &PipelineEnvironment,
    signature: &ComputePipelineStateSignature,
) -> Result<PipelineStateHandle> {
    let shader_cache = environment
        .shader_cache_manager
        .get_compute_shader_cache(
            &environment.repository,
            environment.shader_language.as_ref(),
            signature,
        )?
        .ok_or(CrucibleError::NoShaderStages)?;
    environment
        .shader_language
        .create_compute_pipeline_state(shader_cache.shader())
}
