//! Error taxonomy for kernel construction, invocation and readback.
//!
//! Every fallible operation in the crate reports one of these variants
//! synchronously, at the point where the problem was detected. Nothing is
//! retried internally; a caller that wants retries owns that policy.

use crate::backend::Backend;

/// Errors reported by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested concrete backend is not usable in this environment.
    ///
    /// Never produced for [`Mode::Auto`](crate::backend::Mode::Auto), which
    /// always falls back to the CPU.
    #[error("backend `{backend}` is not available: {reason}")]
    UnsupportedBackend {
        /// The backend that was asked for.
        backend: Backend,
        /// Why it could not be used.
        reason: String,
    },

    /// The configured output extents are not a rank 1, 2 or 3 shape of
    /// positive sizes, or do not fit the device's storage grid.
    #[error("invalid output shape {extents:?}: {reason}")]
    InvalidOutputShape {
        /// The rejected extents, x first.
        extents: Vec<usize>,
        /// What is wrong with them.
        reason: String,
    },

    /// The kernel (or the runtime that created it) was destroyed.
    #[error("kernel `{0}` has been destroyed")]
    KernelDestroyed(String),

    /// Invocation arguments do not match the program's declared inputs.
    #[error("argument mismatch for kernel `{kernel}`: {reason}")]
    ArgumentMismatch {
        /// Name of the program being invoked.
        kernel: String,
        /// Which argument is wrong and how.
        reason: String,
    },

    /// Reading backend storage back into host memory failed.
    #[error("readback failed: {0}")]
    ReadbackFailure(String),

    /// The device rejected a resource, shader or pipeline.
    #[error("GPU failure: {0}")]
    Gpu(String),
}

impl Error {
    pub(crate) fn mismatch(kernel: &str, reason: impl Into<String>) -> Self {
        Self::ArgumentMismatch {
            kernel: kernel.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(extents: &[usize], reason: impl Into<String>) -> Self {
        Self::InvalidOutputShape {
            extents: extents.to_vec(),
            reason: reason.into(),
        }
    }
}

/// Shorthand for results carrying [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
