//! Renderer error types.

use crate::backend::BackendError;
use crate::resources::ViewId;
use thiserror::Error;

/// Errors raised while preparing or running a render pass.
///
/// None of these cross a pass entry point: the driver logs them and skips
/// the pass for the frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    /// A texture or buffer could not be created.
    #[error("failed to initialize {resource}: {source}")]
    ResourceInitFailure {
        resource: String,
        #[source]
        source: BackendError,
    },
    /// The shader asset is still loading; retried next frame.
    #[error("shader {0} is not ready")]
    ShaderNotReady(String),
    /// The shader was compiled against a different constant buffer layout.
    #[error("constant buffer {slot} of shader {shader} is {actual} bytes, expected {expected}")]
    ConstantBufferSizeMismatch {
        shader: String,
        slot: u32,
        expected: usize,
        actual: usize,
    },
    /// The device lacks a capability this feature requires.
    #[error("unsupported platform feature: {0}")]
    UnsupportedPlatformFeature(&'static str),
    /// The surface atlas has no room for a tile this frame.
    #[error("surface atlas is full")]
    AtlasInsertFull,
    /// The view was never created or was already destroyed.
    #[error("unknown view {0:?}")]
    UnknownView(ViewId),
    /// Any other backend failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RenderError {
    pub fn resource(resource: impl Into<String>, source: BackendError) -> Self {
        RenderError::ResourceInitFailure {
            resource: resource.into(),
            source,
        }
    }

    /// Whether the failure indicates the build is out of sync and should be
    /// reported loudly rather than retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::ConstantBufferSizeMismatch { .. })
    }
}

pub type RenderResult<T> = Result<T, RenderError>;
