//! Crate-wide error type
//!
//! One variant per failure mode named in the error-handling design:
//! builder/encoder errors are fatal for the build, `DeviceError` aborts the
//! current `acquire` leaving partial buffers inspectable by the caller.
//! Nothing is retried automatically.

use thiserror::Error;

/// Result alias for this crate's fallible operations.
pub type Result<T> = std::result::Result<T, TProcError>;

/// Errors raised by the assembler, sequencer, and averager runtime.
#[derive(Debug, Error)]
pub enum TProcError {
    /// `emit` was called with a mnemonic not present in the instruction
    /// definition table.
    #[error("unknown instruction mnemonic '{mnemonic}'")]
    UnknownInstruction {
        /// The mnemonic that was not recognized.
        mnemonic: String,
    },

    /// `compile` could not resolve a jump target because the referenced
    /// label was never bound with `label(name)`.
    #[error("unknown label '{label}'")]
    UnknownLabel {
        /// The label name that was referenced but never defined.
        label: String,
    },

    /// A math/compare/bitwise/read operator token is not present in the
    /// operator table for its instruction kind.
    #[error("unknown operator token '{token}'")]
    UnknownOperator {
        /// The operator token that was not recognized.
        token: String,
    },

    /// An immediate value does not fit in 31 bits after sign-folding
    /// (`imm >= 2^31`).
    #[error("immediate {value} overflows the 31-bit immediate field")]
    ImmediateOverflow {
        /// The offending (already sign-folded) value.
        value: i64,
    },

    /// An arbitrary or flat-top envelope's sample length is not a positive
    /// multiple of 16.
    #[error("envelope length {length} is not a positive multiple of 16")]
    EnvelopeLengthInvalid {
        /// The invalid sample length.
        length: usize,
    },

    /// A DAC channel index fell outside the valid `1..=8` range.
    #[error("DAC channel {channel} is out of range (expected 1..=8)")]
    ChannelOutOfRange {
        /// The out-of-range channel index.
        channel: usize,
    },

    /// A required configuration key was absent (e.g. `reps` in `acquire`).
    #[error("missing required configuration key '{key}'")]
    ConfigMissing {
        /// The name of the missing configuration key.
        key: String,
    },

    /// The device façade reported a failure (I/O, hardware timeout,
    /// protocol error, etc). The underlying error is boxed since concrete
    /// device implementations are external to this crate.
    #[error("device error: {0}")]
    DeviceError(#[from] Box<dyn std::error::Error + Send + Sync>),
}
