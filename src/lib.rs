#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

//! Pipeline state and shader caching for property-driven renderers.
//!
//! Materials are described by *blueprints* whose shader templates are
//! specialized through integer *shader properties*. This crate turns a
//! (material blueprint, fixed-function state, property set) request into a
//! ready native pipeline state, caching at every level in between: built
//! shader source, compiled shaders, linked programs and pipeline state
//! objects. Expensive misses compile asynchronously while the caller renders
//! with the closest existing pipeline state as a fallback.
//!
//! [`PipelineStateSystem`] is the entry point; the native graphics API is
//! abstracted behind the [`rhi::ShaderLanguage`] trait.

pub mod asset;
pub mod blueprint;
pub mod builder;
pub mod cache;
pub mod compiler;
pub mod error;
pub mod hash;
pub mod properties;
pub mod rhi;
pub mod system;

mod persist;

pub use asset::{AssetId, MaterialBlueprintResourceId, ShaderBlueprintResourceId};
pub use blueprint::{
    MaterialBlueprintResource, ShaderBlueprintResource, ShaderPieceResource, ShaderRepository,
};
pub use builder::{BuildShader, ShaderBuilder};
pub use cache::signature::{
    ComputePipelineStateSignature, GraphicsPipelineStateSignature, ShaderCombinationId,
};
pub use cache::PipelineEnvironment;
pub use compiler::{
    BackgroundPipelineStateCompiler, CompileJob, ImmediatePipelineStateCompiler,
    PipelineStateCompiler,
};
pub use error::{CrucibleError, Result};
pub use properties::{ShaderProperties, ShaderProperty, ShaderPropertyId};
pub use rhi::{
    CompiledShader, GraphicsShaderSet, SerializedGraphicsPipelineStateHash, ShaderLanguage,
    ShaderStage,
};
pub use system::PipelineStateSystem;
