//! Graphics Program Cache
//!
//! Caches linked graphics programs. Two signatures whose stages all resolved
//! to the same shader caches (directly or through master redirects) share one
//! linked program, so the program cache key is the FNV1a fold of the
//! per-stage shader cache IDs in fixed stage order, with a zero marker for
//! absent stages.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::blueprint::ShaderRepository;
use crate::cache::shader::ShaderCacheManager;
use crate::cache::signature::{GraphicsPipelineStateSignature, ShaderCombinationId};
use crate::error::{CrucibleError, Result};
use crate::hash::Fnv1a32;
use crate::rhi::{GraphicsProgramHandle, GraphicsShaderSet, ShaderLanguage, ShaderStage};

/// Identifies one linked graphics program by its per-stage shader caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphicsProgramCacheId(pub u32);

/// One cached linked graphics program.
#[derive(Debug)]
pub struct GraphicsProgramCache {
    program_cache_id: GraphicsProgramCacheId,
    /// Shader caches linked into this program, [`ShaderStage::GRAPHICS`] order.
    shader_cache_ids: [Option<ShaderCombinationId>; ShaderStage::NUMBER_OF_GRAPHICS_STAGES],
    program: GraphicsProgramHandle,
}

impl GraphicsProgramCache {
    #[inline]
    #[must_use]
    pub fn program_cache_id(&self) -> GraphicsProgramCacheId {
        self.program_cache_id
    }

    #[inline]
    #[must_use]
    pub fn program(&self) -> &GraphicsProgramHandle {
        &self.program
    }

    fn links_any_of(&self, shader_cache_ids: &[ShaderCombinationId]) -> bool {
        self.shader_cache_ids
            .iter()
            .flatten()
            .any(|id| shader_cache_ids.contains(id))
    }
}

/// Process-global owner of all [`GraphicsProgramCache`] entries.
#[derive(Default)]
pub struct GraphicsProgramCacheManager {
    caches: RwLock<FxHashMap<GraphicsProgramCacheId, Arc<GraphicsProgramCache>>>,
}

impl GraphicsProgramCacheManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Linked program for a signature, resolving (and on demand building) the
    /// per-stage shader caches first.
    ///
    /// Fails with [`CrucibleError::NoShaderStages`] when the signature
    /// resolves to no shader at all.
    pub fn get_graphics_program_cache(
        &self,
        repository: &ShaderRepository,
        shader_language: &dyn ShaderLanguage,
        shader_cache_manager: &ShaderCacheManager,
        signature: &GraphicsPipelineStateSignature,
    ) -> Result<Arc<GraphicsProgramCache>> {
        let mut shader_cache_ids = [None; ShaderStage::NUMBER_OF_GRAPHICS_STAGES];
        let mut shaders = GraphicsShaderSet::default();
        let mut hasher = Fnv1a32::new();
        for (index, stage) in ShaderStage::GRAPHICS.iter().enumerate() {
            match shader_cache_manager.get_graphics_shader_cache(
                repository,
                shader_language,
                signature,
                *stage,
            )? {
                Some(shader_cache) => {
                    // The effective (master) ID, so combinations redirected
                    // to the same compile share one linked program.
                    hasher.write_u32(shader_cache.effective_shader_cache_id().0);
                    shader_cache_ids[index] = Some(shader_cache.effective_shader_cache_id());
                    shaders.set(*stage, Arc::clone(shader_cache.shader()));
                }
                None => hasher.write_u32(0),
            }
        }
        if shaders.is_empty() {
            return Err(CrucibleError::NoShaderStages);
        }
        let program_cache_id = GraphicsProgramCacheId(hasher.finish());

        if let Some(cache) = self.caches.read().get(&program_cache_id) {
            return Ok(Arc::clone(cache));
        }

        log::debug!("program cache {program_cache_id:?}: linking {} stage(s)", shaders.len());
        let program = shader_language.create_graphics_program(&shaders)?;
        let cache = Arc::new(GraphicsProgramCache {
            program_cache_id,
            shader_cache_ids,
            program,
        });

        match self.caches.write().entry(program_cache_id) {
            Entry::Occupied(existing) => Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => Ok(Arc::clone(slot.insert(cache))),
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

    /// Drop every program linked against one of the given shader caches.
    /// Called after the shader cache manager invalidated a blueprint.
    pub fn invalidate_shader_caches(&self, shader_cache_ids: &[ShaderCombinationId]) -> usize {
        if shader_cache_ids.is_empty() {
            return 0;
        }
        let mut caches = self.caches.write();
        let before = caches.len();
        caches.retain(|_, cache| !cache.links_any_of(shader_cache_ids));
        let removed = before - caches.len();
        if removed > 0 {
            log::debug!("invalidated {removed} graphics program cache(s)");
        }
        removed
    }

    pub fn clear(&self) {
        self.caches.write().clear();
    }
}
