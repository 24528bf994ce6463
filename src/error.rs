//! Error types and result definitions for the emission backend.
//!
//! Two failure classes are kept strictly apart:
//! - A *bailout* is an expected limitation (a construct this backend does
//!   not compile). It propagates unwrapped so the caller can retry at a
//!   lower tier or stay in the interpreter.
//! - An *internal error* is a violated assembler invariant. The block
//!   scheduler wraps it with the offending block/instruction identity and
//!   the compilation attempt is discarded, never partially installed.

use thiserror::Error;

/// The result type used throughout the emission backend.
pub type JitResult<T> = Result<T, JitError>;

/// Why a compilation bailed out.
///
/// Bailouts are anticipated: the method is simply not compiled at this
/// tier. They carry enough detail for compilation logs, nothing more.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BailoutReason {
    /// A frame slot offset does not fit the 16-bit displacement field.
    #[error("frame too large: slot offset {offset} exceeds 16-bit displacement")]
    FrameTooLarge {
        /// The unencodable byte offset.
        offset: i64,
    },

    /// A memory operand displacement does not fit the instruction format.
    #[error("unencodable displacement {offset}")]
    UnencodableOffset {
        /// The out-of-range displacement.
        offset: i64,
    },

    /// A data-section constant requested an unsupported alignment.
    #[error("unsupported data alignment {align}")]
    UnsupportedAlignment {
        /// The requested alignment in bytes.
        align: u32,
    },
}

/// Errors produced during code emission.
#[derive(Error, Debug)]
pub enum JitError {
    /// Expected, recoverable abort. The caller may retry with a different
    /// strategy; no code is installed.
    #[error("compilation bailout: {0}")]
    Bailout(#[from] BailoutReason),

    /// An assembler invariant was violated. Always wrapped with the
    /// offending block and instruction before it reaches the caller.
    #[error("internal error in block {block}, instruction {inst} `{inst_text}`: {detail}")]
    Internal {
        /// Code-emitting-order block id.
        block: u32,
        /// Index of the instruction within its block.
        inst: u32,
        /// Rendered form of the offending instruction.
        inst_text: String,
        /// What went wrong.
        detail: String,
    },

    /// A plugged-in instruction verifier rejected emitted bytes.
    #[error("verification failure for `{inst_text}` (bytes {bytes:02x?}): {detail}")]
    Verification {
        /// Rendered form of the offending instruction.
        inst_text: String,
        /// The exact bytes the instruction emitted.
        bytes: Vec<u8>,
        /// Verifier-provided description.
        detail: String,
    },

    /// A raw invariant violation before block/instruction context is known.
    /// The block scheduler converts this into [`JitError::Internal`].
    #[error("assembler invariant violated: {0}")]
    Invariant(String),
}

impl JitError {
    /// Raw internal error, to be wrapped with context by the scheduler.
    pub fn invariant(detail: impl Into<String>) -> Self {
        JitError::Invariant(detail.into())
    }

    /// True for errors that must propagate unwrapped.
    pub fn is_bailout(&self) -> bool {
        matches!(self, JitError::Bailout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bailout_is_not_wrapped() {
        let err = JitError::Bailout(BailoutReason::FrameTooLarge { offset: 40000 });
        assert!(err.is_bailout());
        assert!(!JitError::invariant("x").is_bailout());
    }

    #[test]
    fn internal_error_mentions_instruction() {
        let err = JitError::Internal {
            block: 3,
            inst: 7,
            inst_text: "move v0, a0".to_string(),
            detail: "delay slot left empty".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("block 3"));
        assert!(text.contains("move v0, a0"));
    }
}
