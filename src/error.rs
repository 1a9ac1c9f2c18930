//! Error Types
//!
//! The main error type [`CrucibleError`] covers all failure modes of the
//! caching and compilation pipeline:
//! - Shader template build errors (malformed directives, unknown pieces,
//!   unresolved expressions)
//! - Native backend failures (shader compilation, program linking, pipeline
//!   state creation)
//! - Missing blueprint / piece resources
//! - Persisted cache blob I/O and corruption
//!
//! A build or compilation error is fatal for the affected shader stage only:
//! it propagates as "no shader produced" through the shader cache, the program
//! cache and the pipeline state cache, and the draw using that material falls
//! back to an error visualization instead of crashing.

use thiserror::Error;

use crate::asset::{AssetId, MaterialBlueprintResourceId, ShaderBlueprintResourceId};
use crate::rhi::ShaderStage;

/// The main error type of the crate.
#[derive(Error, Debug)]
pub enum CrucibleError {
    // ========================================================================
    // Shader Builder Errors
    // ========================================================================
    /// Malformed template directive (unbalanced parentheses, missing `@end`,
    /// wrong argument count).
    #[error("malformed @{directive} directive: {message}")]
    TemplateSyntax {
        /// Directive name without the leading `@`
        directive: &'static str,
        /// What was wrong
        message: String,
    },

    /// An integer expression could not be evaluated.
    #[error("failed to evaluate `{expression}`: {message}")]
    ExpressionEvaluation {
        expression: String,
        message: String,
    },

    /// `@insertpiece` referenced a piece that was never collected.
    #[error("unknown shader piece `{0}`")]
    UnknownShaderPiece(String),

    /// `@value` referenced a shader property that is not set.
    #[error("unknown shader property `{0}`")]
    UnknownShaderProperty(String),

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// A shader piece asset referenced by a blueprint is not loaded.
    #[error("shader piece asset not loaded: {0:?}")]
    ShaderPieceNotFound(AssetId),

    /// A shader blueprint resource referenced by a material blueprint is not
    /// loaded.
    #[error("shader blueprint resource not loaded: {0:?}")]
    ShaderBlueprintNotFound(ShaderBlueprintResourceId),

    /// The requested material blueprint resource is not registered.
    #[error("material blueprint resource not loaded: {0:?}")]
    MaterialBlueprintNotFound(MaterialBlueprintResourceId),

    // ========================================================================
    // Native Backend Errors
    // ========================================================================
    /// The native shader compiler rejected the generated source code.
    #[error("{stage:?} shader compilation failed: {message}")]
    ShaderCompilation {
        stage: ShaderStage,
        message: String,
    },

    /// The native backend failed to link a graphics program.
    #[error("graphics program creation failed: {0}")]
    GraphicsProgramCreation(String),

    /// The native backend failed to create a pipeline state object.
    #[error("pipeline state creation failed: {0}")]
    PipelineStateCreation(String),

    /// The material blueprint has no shader stage to build a program from.
    #[error("material blueprint has no shader stages to link")]
    NoShaderStages,

    /// Catch-all for backend implementations.
    #[error("backend error: {0}")]
    Backend(String),

    // ========================================================================
    // Persisted Cache Errors
    // ========================================================================
    /// The cache blob does not parse (truncated, wrong magic, bad record).
    #[error("pipeline cache blob is corrupt: {0}")]
    CorruptCacheBlob(String),

    /// File I/O error while reading or writing a cache blob.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for `Result<T, CrucibleError>`.
pub type Result<T> = std::result::Result<T, CrucibleError>;
