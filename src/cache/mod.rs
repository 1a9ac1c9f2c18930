//! Pipeline State Caching
//!
//! Cache hierarchy, bottom to top:
//!
//! 1. [`shader`] — generated source code and compiled shaders, deduplicated
//!    across combinations through master redirects;
//! 2. [`program`] — linked graphics programs, one per distinct set of
//!    per-stage shader caches;
//! 3. [`graphics`] / [`compute`] — pipeline state objects keyed by
//!    [`signature`] IDs, with fallback states while asynchronous compilation
//!    is in flight.
//!
//! Shader and program caches are process-global; pipeline state cache
//! managers are owned by their material blueprint.

pub mod compute;
pub mod graphics;
pub mod program;
pub mod shader;
pub mod signature;

use std::sync::Arc;

use crate::blueprint::ShaderRepository;
use crate::rhi::ShaderLanguage;

/// The process-global collaborators every cache lookup and compile job needs.
///
/// Cheap to clone; compile jobs carry one across threads.
#[derive(Clone)]
pub struct PipelineEnvironment {
    pub repository: Arc<ShaderRepository>,
    pub shader_language: Arc<dyn ShaderLanguage>,
    pub shader_cache_manager: Arc<shader::ShaderCacheManager>,
    pub graphics_program_cache_manager: Arc<program::GraphicsProgramCacheManager>,
}
