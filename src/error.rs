//! The fixed taxonomy of failures this crate can report.
//!
//! Every parse or decode operation returns one of these variants rather than
//! a generic boxed error: callers (and log lines) always know exactly which
//! failure mode they're looking at, and there's no dynamic downcasting at
//! the call site.

use thiserror::Error;

/// Where in the input a [`ParseError`] occurred, for log context.
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    pub fragment_index: usize,
    pub rtp_sequence: Option<u16>,
    pub offset: usize,
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fragment #{} seq={:?} offset={}", self.fragment_index, self.rtp_sequence, self.offset)
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    /// A structurally invalid element: bad start code, unknown stream id,
    /// or a field that doesn't make sense given what's been seen so far.
    #[error("invalid PS data at {ctx}: {detail}")]
    Inval { ctx: ErrorContext, detail: String },

    /// The output accumulator (or the cursor's stitch scratch) can't hold
    /// the bytes this operation needs.
    #[error("buffer too small at {ctx}: need {needed} bytes, have {available}")]
    TooSmall { ctx: ErrorContext, needed: usize, available: usize },

    /// The fragment array was exhausted while a field was still expected.
    #[error("unexpected end of fragments at {ctx}: wanted {wanted} more bytes")]
    Eof { ctx: ErrorContext, wanted: usize },

    /// An invariant was violated. This indicates a bug in the cursor or
    /// framer, not a malformed stream.
    #[error("internal invariant violated at {ctx}: {detail}")]
    Bug { ctx: ErrorContext, detail: String },

    /// The requested codec, direction, or packing mode isn't served by this
    /// adapter's descriptor.
    #[error("unsupported: {0}")]
    Unsup(String),

    /// The injected H.264 decoder rejected the assembled buffer.
    #[error("decoder rejected frame: {0}")]
    DecoderFailed(String),
}

impl ParseError {
    pub fn inval(ctx: ErrorContext, detail: impl Into<String>) -> Self {
        ParseError::Inval { ctx, detail: detail.into() }
    }

    pub fn too_small(ctx: ErrorContext, needed: usize, available: usize) -> Self {
        ParseError::TooSmall { ctx, needed, available }
    }

    pub fn eof(ctx: ErrorContext, wanted: usize) -> Self {
        ParseError::Eof { ctx, wanted }
    }

    pub fn bug(ctx: ErrorContext, detail: impl Into<String>) -> Self {
        ParseError::Bug { ctx, detail: detail.into() }
    }
}
