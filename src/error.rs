//! Error taxonomy for the engine's external (non-audio-thread) operations.
//!
//! Nothing in the per-sample render path returns `Result`: numerical
//! divergence is handled locally (a hammer terminates its own contact) and a
//! failed convolution backend falls back to passthrough for the affected
//! block. Those two kinds never reach a caller as an `Err` by design.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("failed to load resource ({context}): {source}")]
    ResourceLoadFailure {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("convolution backend failure ({context})")]
    BackendFailure { context: String },
}
