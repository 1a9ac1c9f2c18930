//! Graphics Pipeline State Cache
//!
//! Top of the cache hierarchy. Each material blueprint owns one manager
//! mapping signature IDs to pipeline state cache entries.
//!
//! Pipeline state creation is expensive, so a miss normally hands the work to
//! the asynchronous compiler and immediately returns an entry backed by a
//! *fallback*: the ready pipeline state of the closest less-specialized
//! signature, found by stripping properties one at a time. Renderers draw
//! with the fallback (visually approximate, never a stall) and pick up the
//! real pipeline state on a later frame. When no fallback exists the caller
//! chooses between an emergency synchronous compile and rendering nothing.
//!
//! Async results are generation stamped: `clear_cache` bumps the generation,
//! so in-flight compiles started before a clear are discarded on arrival
//! instead of resurrecting stale entries.

use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::asset::MaterialBlueprintResourceId;
use crate::blueprint::MaterialBlueprintResource;
use crate::cache::signature::{GraphicsPipelineStateSignature, GraphicsPipelineStateSignatureId};
use crate::cache::PipelineEnvironment;
use crate::compiler::{CompileJob, PipelineStateCompiler};
use crate::error::Result;
use crate::persist::{BlobReader, BlobWriter};
use crate::properties::{ShaderProperties, ShaderPropertyId};
use crate::rhi::{PipelineStateHandle, SerializedGraphicsPipelineStateHash};

const GRAPHICS_PSO_CACHE_MAGIC: [u8; 4] = *b"CGPS";

#[derive(Debug, Default)]
struct PipelineStateSlot {
    pipeline_state: Option<PipelineStateHandle>,
    is_using_fallback: bool,
}

/// One cached graphics pipeline state entry.
///
/// The slot behind the [`Mutex`] flips at most twice: from empty or fallback
/// to the real pipeline state when the asynchronous compile lands.
#[derive(Debug)]
pub struct GraphicsPipelineStateCache {
    signature: GraphicsPipelineStateSignature,
    slot: Mutex<PipelineStateSlot>,
}

impl GraphicsPipelineStateCache {
    fn new(signature: GraphicsPipelineStateSignature) -> Self {
        Self {
            signature,
            slot: Mutex::new(PipelineStateSlot::default()),
        }
    }

    #[inline]
    #[must_use]
    pub fn signature(&self) -> &GraphicsPipelineStateSignature {
        &self.signature
    }

    /// Current pipeline state, fallback or real. `None` while an asynchronous
    /// compile is in flight and no fallback was found.
    #[must_use]
    pub fn pipeline_state(&self) -> Option<PipelineStateHandle> {
        self.slot.lock().pipeline_state.clone()
    }

    /// Whether [`Self::pipeline_state`] currently returns a substitute for a
    /// still-compiling pipeline state.
    #[must_use]
    pub fn is_using_fallback(&self) -> bool {
        self.slot.lock().is_using_fallback
    }

    fn install(&self, pipeline_state: PipelineStateHandle, is_fallback: bool) {
        let mut slot = self.slot.lock();
        // A fallback never replaces the real pipeline state.
        if is_fallback && slot.pipeline_state.is_some() && !slot.is_using_fallback {
            return;
        }
        slot.pipeline_state = Some(pipeline_state);
        slot.is_using_fallback = is_fallback;
    }
}

/// Per-material-blueprint owner of graphics pipeline state cache entries.
pub struct GraphicsPipelineStateCacheManager {
    material_blueprint_resource_id: MaterialBlueprintResourceId,
    caches:
        RwLock<FxHashMap<GraphicsPipelineStateSignatureId, Arc<GraphicsPipelineStateCache>>>,
    /// Bumped on every clear; async results carry the generation they were
    /// started under and are discarded on mismatch.
    generation: AtomicU32,
}

impl std::fmt::Debug for GraphicsPipelineStateCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipelineStateCacheManager")
            .field("material_blueprint_resource_id", &self.material_blueprint_resource_id)
            .field("entries", &self.caches.read().len())
            .finish()
    }
}

impl GraphicsPipelineStateCacheManager {
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

    /// Pipeline state cache entry for a request, creating it on demand.
    ///
    /// On a miss the entry starts from the best available fallback and the
    /// real compile is queued on `compiler`. With no fallback available,
    /// `allow_emergency_sync` trades a stall for a guaranteed ready pipeline
    /// state; otherwise the entry is returned empty and fills in later.
    pub fn get_pipeline_state_cache(
        &self,
        environment: &PipelineEnvironment,
        compiler: &dyn PipelineStateCompiler,
        material_blueprint: &Arc<MaterialBlueprintResource>,
        serialized_state_hash: SerializedGraphicsPipelineStateHash,
        shader_properties: ShaderProperties,
        allow_emergency_sync: bool,
    ) -> Result<Arc<GraphicsPipelineStateCache>> {
        debug_assert_eq!(
            material_blueprint.resource_id(),
            self.material_blueprint_resource_id
        );
        let signature = GraphicsPipelineStateSignature::new(
            material_blueprint,
            &environment.repository,
            serialized_state_hash,
            shader_properties,
        )?;
        let signature_id = signature.signature_id();

        if let Some(cache) = self.caches.read().get(&signature_id) {
            debug_assert_eq!(
                *cache.signature(),
                signature,
                "graphics pipeline state signature ID collision"
            );
            return Ok(Arc::clone(cache));
        }

        let fallback = self.find_fallback(environment, material_blueprint, &signature);
        let cache = Arc::new(GraphicsPipelineStateCache::new(signature.clone()));
        if let Some(fallback) = fallback {
            cache.install(fallback, true);
        }

        let cache = match self.caches.write().entry(signature_id) {
            Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => Arc::clone(slot.insert(cache)),
        };

        if allow_emergency_sync && !cache.is_using_fallback() {
            log::debug!(
                "pipeline state {signature_id:?}: no fallback available, compiling synchronously"
            );
            match compile_graphics_pipeline_state(environment, &signature) {
                Ok(pipeline_state) => cache.install(pipeline_state, false),
                Err(error) => {
                    self.caches.write().remove(&signature_id);
                    return Err(error);
                }
            }
        } else {
            compiler.queue(CompileJob::Graphics {
                material_blueprint: Arc::clone(material_blueprint),
                signature,
                generation: self.generation.load(Ordering::Acquire),
            });
        }
        Ok(cache)
    }

    /// Ready pipeline state of the closest less-specialized signature.
    ///
    /// Strips the highest-valued property ID first, so properties hashed from
    /// long, specific names tend to go before short common ones; the search
    /// ends at the empty property set.
    fn find_fallback(
        &self,
        environment: &PipelineEnvironment,
        material_blueprint: &Arc<MaterialBlueprintResource>,
        signature: &GraphicsPipelineStateSignature,
    ) -> Option<PipelineStateHandle> {
        let mut properties = signature.shader_properties().clone();
        let caches = self.caches.read();
        while !properties.is_empty() {
            let highest: ShaderPropertyId = properties
                .as_slice()
                .last()
                .map(|property| property.property_id)?;
            properties.remove_property_value(highest);

            let relaxed = GraphicsPipelineStateSignature::new(
                material_blueprint,
                &environment.repository,
                signature.serialized_graphics_pipeline_state_hash(),
                properties.clone(),
            )
            .ok()?;
            if let Some(candidate) = caches.get(&relaxed.signature_id()) {
                let slot = candidate.slot.lock();
                if !slot.is_using_fallback {
                    if let Some(pipeline_state) = slot.pipeline_state.clone() {
                        log::trace!(
                            "pipeline state {:?}: falling back to {:?}",
                            signature.signature_id(),
                            relaxed.signature_id()
                        );
                        return Some(pipeline_state);
                    }
                }
            }
        }
        None
    }

    /// Install the result of an asynchronous compile. Results from before the
    /// last clear, and results whose entry no longer exists, are discarded.
    pub(crate) fn install_async_result(
        &self,
        signature_id: GraphicsPipelineStateSignatureId,
        generation: u32,
        pipeline_state: PipelineStateHandle,
    ) {
        if generation != self.generation.load(Ordering::Acquire) {
            log::debug!("discarding stale async pipeline state for {signature_id:?}");
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

    /// Drop every entry and invalidate in-flight async compiles.
    pub fn clear_cache(&self) {
        let mut caches = self.caches.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        caches.clear();
    }

    /// Serialize the signature inputs of every ready entry. Pipeline states
    /// themselves are backend objects; on load they are re-created through
    /// the normal synchronous path, hitting the restored shader bytecode
    /// caches underneath.
    pub fn save_cache(
        &self,
        environment: &PipelineEnvironment,
        writer: &mut dyn std::io::Write,
    ) -> Result<()> {
        let caches = self.caches.read();
        let ready: Vec<&Arc<GraphicsPipelineStateCache>> = caches
            .values()
            .filter(|cache| {
                let slot = cache.slot.lock();
                slot.pipeline_state.is_some() && !slot.is_using_fallback
            })
            .collect();

        let mut writer = BlobWriter::new(writer);
        writer.write_header(GRAPHICS_PSO_CACHE_MAGIC, environment.shader_language.name())?;
        writer.write_u32(self.material_blueprint_resource_id.0)?;
        writer.write_u32(ready.len() as u32)?;
        for cache in ready {
            let signature = cache.signature();
            writer.write_u32(signature.serialized_graphics_pipeline_state_hash().0)?;
            let properties = signature.shader_properties();
            writer.write_u32(properties.len() as u32)?;
            for property in properties.iter() {
                writer.write_u32(property.property_id.0)?;
                writer.write_i32(property.value)?;
            }
        }
        Ok(())
    }

    /// Restore persisted entries by re-compiling them synchronously.
    ///
    /// Returns the number of restored entries; zero with a stale header. An
    /// entry that fails to compile (its blueprint may have changed meanwhile)
    /// is logged and skipped.
    pub fn load_cache(
        &self,
        environment: &PipelineEnvironment,
        material_blueprint: &Arc<MaterialBlueprintResource>,
        reader: &mut dyn std::io::Read,
    ) -> Result<usize> {
        let mut reader = BlobReader::new(reader);
        if !reader.read_header(GRAPHICS_PSO_CACHE_MAGIC, environment.shader_language.name())? {
            log::info!(
                "graphics pipeline state cache blob for {:?} is stale",
                self.material_blueprint_resource_id
            );
            return Ok(0);
        }
        let stored_material = MaterialBlueprintResourceId(reader.read_u32()?);
        let count = reader.read_u32()?;
        if stored_material != self.material_blueprint_resource_id {
            log::warn!(
                "graphics pipeline state cache blob belongs to {stored_material:?}, not {:?}",
                self.material_blueprint_resource_id
            );
            return Ok(0);
        }

        let mut restored = 0;
        for _ in 0..count {
            let serialized_state_hash =
                SerializedGraphicsPipelineStateHash(reader.read_u32()?);
            let property_count = reader.read_u32()?;
            let mut properties = ShaderProperties::with_capacity(property_count as usize);
            for _ in 0..property_count {
                let property_id = ShaderPropertyId(reader.read_u32()?);
                let value = reader.read_i32()?;
                properties.set_property_value(property_id, value);
            }

            // A record whose stage blueprint is no longer registered is as
            // stale as one that fails to compile: skip it, keep restoring.
            let signature = match GraphicsPipelineStateSignature::new(
                material_blueprint,
                &environment.repository,
                serialized_state_hash,
                properties,
            ) {
                Ok(signature) => signature,
                Err(error) => {
                    log::warn!("dropping persisted pipeline state record: {error}");
                    continue;
                }
            };
            match compile_graphics_pipeline_state(environment, &signature) {
                Ok(pipeline_state) => {
                    let cache = Arc::new(GraphicsPipelineStateCache::new(signature.clone()));
                    cache.install(pipeline_state, false);
                    self.caches.write().insert(signature.signature_id(), cache);
                    restored += 1;
                }
                Err(error) => {
                    log::warn!(
                        "dropping persisted pipeline state {:?}: {error}",
                        signature.signature_id()
                    );
                }
            }
        }
        log::debug!(
            "restored {restored} graphics pipeline state(s) for {:?}",
            self.material_blueprint_resource_id
        );
        Ok(restored)
    }
}

/// Full synchronous build of a graphics pipeline state: stage shaders,
/// linked program, pipeline state object. Shared by the emergency path, the
/// asynchronous compiler and cache loading.
pub(crate) fn compile_graphics_pipeline_state(
    environment: &PipelineEnvironment,
    signature: &GraphicsPipelineStateSignature,
) -> Result<PipelineStateHandle> {
    let program_cache = environment
        .graphics_program_cache_manager
        .get_graphics_program_cache(
            &environment.repository,
            environment.shader_language.as_ref(),
            &environment.shader_cache_manager,
            signature,
        )?;
    environment.shader_language.create_graphics_pipeline_state(
        program_cache.program(),
        signature.serialized_graphics_pipeline_state_hash(),
    )
}
