//! Error types shared across the engine.

use thiserror::Error;

/// Errors surfaced by the modeling engine.
///
/// The engine itself has no user-facing error channel; these values are
/// reported to the embedding hook dispatcher, which decides whether a
/// failure is fail-open or fail-closed. Modeling outcomes (trusted,
/// untrusted, trust-pending) are carried on the task state, never here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// An allocation failed, including exhaustion of a pre-allocated
    /// magazine in non-blocking context.
    #[error("out of memory: {context}")]
    OutOfMemory {
        /// Which allocation failed.
        context: &'static str,
    },

    /// The hash primitive reported a failure.
    #[error("hash primitive failure: {context}")]
    CryptoFailure {
        /// Which operation failed.
        context: &'static str,
    },

    /// A caller-supplied argument was malformed.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Why the argument was rejected.
        reason: String,
    },

    /// Reading file contents for digesting failed.
    #[error("file read failed: {0}")]
    Io(#[from] std::io::Error),

    /// The hardware trust device is absent.
    #[error("hardware trust device not available")]
    NotAvailable,

    /// The caller was interrupted by a fatal signal while waiting for an
    /// external agent to adjudicate its trust status.
    #[error("cancelled by fatal signal while trust-pending")]
    Cancelled,

    /// A digest configuration or encoding error.
    #[error(transparent)]
    Digest(#[from] DigestError),
}

/// Errors from digest selection and encoding.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DigestError {
    /// The named hash algorithm is not supported.
    #[error("unknown digest algorithm: {name}")]
    UnknownAlgorithm {
        /// The rejected name.
        name: String,
    },

    /// A raw digest had an unusable length.
    #[error("digest length {len} out of range (1..={max})")]
    InvalidLength {
        /// The rejected length.
        len: usize,
        /// The maximum supported length.
        max: usize,
    },

    /// A hex-encoded digest could not be decoded.
    #[error("invalid hex digest: {reason}")]
    InvalidHex {
        /// Why decoding failed.
        reason: String,
    },
}
