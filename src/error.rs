//! The error taxonomy shared by every stage of the cloaking pipeline.
//!
//! Fallback decisions are driven by the error *kind*, never by matching on
//! message text: [`CloakError::Backend`] is the only recoverable variant (the
//! engine retries on a more conservative compute path), everything else
//! aborts the run.

use thiserror::Error;

/// Errors surfaced by the cloaking engine.
#[derive(Debug, Error)]
pub enum CloakError {
    /// The input failed validation (unsupported format, over the size
    /// ceiling, out-of-range configuration, ...).
    #[error("invalid input: {0}")]
    Validation(String),

    /// A face-scoped attack was requested, but no face regions were found.
    #[error("no face detected; choose a method that does not require faces (e.g. global)")]
    NoFaceDetected,

    /// The accelerated compute path faulted. Recoverable: the engine retries
    /// on a coarser tier before surfacing this.
    #[error("compute backend fault: {0}")]
    Backend(String),

    /// The run was cancelled by the caller. No partial result is produced.
    #[error("operation cancelled")]
    Cancelled,

    /// Transient tensor memory stayed above the budget even after a forced
    /// reclamation pass.
    #[error("transient tensor memory exhausted ({live} bytes live, budget {budget})")]
    ResourceExhausted {
        /// Live transient-tensor bytes at the time of the failure.
        live: usize,
        /// The absolute byte budget that was exceeded.
        budget: usize,
    },

    /// An image could not be decoded or encoded.
    #[error("failed to {action} image: {reason}")]
    Conversion {
        /// What was being attempted ("decode" or "encode").
        action: &'static str,
        /// The codec's message, passed through verbatim.
        reason: String,
    },
}

impl CloakError {
    /// Returns `true` for faults the engine may transparently retry on a
    /// slower compute path.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CloakError::Backend(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = CloakError> = std::result::Result<T, E>;
