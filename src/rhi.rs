//! Native Backend Interface
//!
//! The caching layer never talks to a graphics API directly. Everything it
//! needs from the native backend — compiling a shader stage, linking a
//! graphics program, creating a pipeline state object — goes through the
//! [`ShaderLanguage`] trait. A Direct3D, Vulkan or wgpu backend implements it
//! once; tests implement it with counting mocks.
//!
//! Native objects are returned as shared-ownership [`Arc`] handles. The cache
//! managers are the long-term owners; callers (draw submission, the
//! asynchronous compiler) hold cheap clones for as long as they need them, so
//! a cache clear can never leave a dangling native handle behind.

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::Result;
use crate::hash::fnv1a_32;

/// One shader stage of the graphics or compute pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Number of graphics pipeline stages (compute excluded).
    pub const NUMBER_OF_GRAPHICS_STAGES: usize = 5;

    /// Graphics stages in the fixed order used for all deterministic folds
    /// (program cache IDs, per-stage signature arrays).
    pub const GRAPHICS: [ShaderStage; Self::NUMBER_OF_GRAPHICS_STAGES] = [
        ShaderStage::Vertex,
        ShaderStage::TessellationControl,
        ShaderStage::TessellationEvaluation,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
    ];

    /// Index of this stage within [`Self::GRAPHICS`], `None` for compute.
    #[inline]
    #[must_use]
    pub fn graphics_index(self) -> Option<usize> {
        match self {
            ShaderStage::Vertex => Some(0),
            ShaderStage::TessellationControl => Some(1),
            ShaderStage::TessellationEvaluation => Some(2),
            ShaderStage::Geometry => Some(3),
            ShaderStage::Fragment => Some(4),
            ShaderStage::Compute => None,
        }
    }
}

/// Marker trait for a native shader object (e.g. a D3D shader blob wrapper).
pub trait NativeShader: Debug + Send + Sync {}

/// Marker trait for a native linked graphics program.
pub trait NativeGraphicsProgram: Debug + Send + Sync {}

/// Marker trait for a native pipeline state object.
pub trait NativePipelineState: Debug + Send + Sync {}

/// Shared-ownership handle to a native shader.
pub type ShaderHandle = Arc<dyn NativeShader>;

/// Shared-ownership handle to a native graphics program.
pub type GraphicsProgramHandle = Arc<dyn NativeGraphicsProgram>;

/// Shared-ownership handle to a native pipeline state object.
pub type PipelineStateHandle = Arc<dyn NativePipelineState>;

/// Result of compiling shader source code with the native backend.
///
/// The bytecode is kept alongside the handle so the shader cache can persist
/// it and skip source generation plus compilation on the next run. Backends
/// that cannot expose bytecode return an empty vector; those entries are
/// simply rebuilt from source after a restart.
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub handle: ShaderHandle,
    pub bytecode: Vec<u8>,
}

/// The per-stage shaders handed to [`ShaderLanguage::create_graphics_program`].
///
/// Slots follow [`ShaderStage::GRAPHICS`] order; absent stages stay `None`
/// (not every material uses every stage).
#[derive(Debug, Clone, Default)]
pub struct GraphicsShaderSet {
    shaders: [Option<ShaderHandle>; ShaderStage::NUMBER_OF_GRAPHICS_STAGES],
}

impl GraphicsShaderSet {
    pub fn set(&mut self, stage: ShaderStage, handle: ShaderHandle) {
        if let Some(index) = stage.graphics_index() {
            self.shaders[index] = Some(handle);
        }
    }

    #[must_use]
    pub fn get(&self, stage: ShaderStage) -> Option<&ShaderHandle> {
        stage
            .graphics_index()
            .and_then(|index| self.shaders[index].as_ref())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shaders.iter().all(Option::is_none)
    }

    /// Number of populated stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shaders.iter().filter(|s| s.is_some()).count()
    }
}

/// FNV1a hash of the serialized fixed-function pipeline state
/// (blend/depth/rasterizer state, primitive topology, render pass formats).
///
/// The caching layer treats the fixed-function state as an opaque blob; only
/// its hash participates in the pipeline state signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerializedGraphicsPipelineStateHash(pub u32);

impl SerializedGraphicsPipelineStateHash {
    /// Hash a serialized fixed-function state blob.
    #[must_use]
    pub fn from_state_blob(blob: &[u8]) -> Self {
        Self(fnv1a_32(blob))
    }
}

/// Everything the caching layer requires from a native shader language
/// backend.
///
/// [`Self::name`] identifies the shader language ("hlsl", "glsl", "wgsl", a
/// driver version suffix, ...) and is baked into the persisted cache header;
/// a name change invalidates the whole on-disk cache.
pub trait ShaderLanguage: Send + Sync {
    /// Shader language name, part of the persisted cache identity.
    fn name(&self) -> &str;

    /// Compile final shader source code for one stage.
    fn create_shader_from_source_code(
        &self,
        stage: ShaderStage,
        source_code: &str,
    ) -> Result<CompiledShader>;

    /// Re-create a shader from previously persisted bytecode.
    fn create_shader_from_bytecode(
        &self,
        stage: ShaderStage,
        bytecode: &[u8],
    ) -> Result<ShaderHandle>;

    /// Link the populated stages of `shaders` into a graphics program.
    fn create_graphics_program(&self, shaders: &GraphicsShaderSet)
    -> Result<GraphicsProgramHandle>;

    /// Create a graphics pipeline state object from a linked program and the
    /// fixed-function state identified by `serialized_state`.
    fn create_graphics_pipeline_state(
        &self,
        program: &GraphicsProgramHandle,
        serialized_state: SerializedGraphicsPipelineStateHash,
    ) -> Result<PipelineStateHandle>;

    /// Create a compute pipeline state object from one compute shader.
    fn create_compute_pipeline_state(
        &self,
        compute_shader: &ShaderHandle,
    ) -> Result<PipelineStateHandle>;
}
