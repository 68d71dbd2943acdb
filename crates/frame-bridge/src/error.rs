//! Error taxonomy for the frame bridge.

use gpu_interop::{ShaderStage, SurfaceError};

use crate::registry::TextureId;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// A failed frame blit. Aborts the frame, never the surface.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BlitError {
    #[error("upload: {0}")]
    Upload(String),

    #[error("binding: {0}")]
    Binding(String),
}

impl BlitError {
    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }

    pub fn binding(msg: impl Into<String>) -> Self {
        Self::Binding(msg.into())
    }

    /// Short failure class, `"upload"` or `"binding"`.
    pub fn reason(&self) -> &'static str {
        match self {
            BlitError::Upload(_) => "upload",
            BlitError::Binding(_) => "binding",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("surface creation error: {0}")]
    SurfaceCreation(#[source] SurfaceError),

    #[error("{stage} shader compile error: {log}")]
    ShaderCompile { stage: ShaderStage, log: String },

    #[error("shader link error: {log}")]
    ShaderLink { log: String },

    #[error("blit error: {0}")]
    Blit(#[from] BlitError),

    #[error("unknown texture id {0}")]
    UnknownTexture(TextureId),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("bridge used after teardown")]
    UseAfterTeardown,

    #[error("texture registration failed: {0:#}")]
    Registration(#[source] anyhow::Error),

    #[error("surface error: {0}")]
    Surface(#[source] SurfaceError),
}

impl BridgeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unsupported(method: impl Into<String>) -> Self {
        Self::UnsupportedOperation(method.into())
    }

    /// Whether the current surface is unusable after this error.
    ///
    /// Per-request failures (validation, unknown id, a failed blit, a slow
    /// fence) leave the surface and its registration in place for the next
    /// frame.
    pub fn is_fatal_to_surface(&self) -> bool {
        match self {
            BridgeError::UseAfterTeardown => true,
            BridgeError::Surface(e) => !matches!(e, SurfaceError::FenceTimeout(_)),
            _ => false,
        }
    }
}

impl From<SurfaceError> for BridgeError {
    fn from(e: SurfaceError) -> Self {
        match e {
            SurfaceError::UseAfterTeardown => BridgeError::UseAfterTeardown,
            other => BridgeError::Surface(other),
        }
    }
}
