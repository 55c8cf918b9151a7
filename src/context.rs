//! Lightweight context carried alongside frames for logging.
//!
//! Mirrors the `crate::Context` / `crate::Timestamp` pattern used throughout
//! the RTP client this crate was built from: cheap `Copy`/`Clone` values
//! threaded through so error and trace messages can name exactly which
//! fragment and timestamp they're about, without owning anything from the
//! transport layer.

use std::fmt;

/// Identifies where a fragment came from, for diagnostics only.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Context {
    /// Index of the fragment within the array passed to `decode`.
    pub fragment_index: usize,
    /// RTP sequence number of that fragment, if known.
    pub rtp_sequence: Option<u16>,
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rtp_sequence {
            Some(seq) => write!(f, "fragment #{} (rtp seq {:04x})", self.fragment_index, seq),
            None => write!(f, "fragment #{}", self.fragment_index),
        }
    }
}

/// A frame timestamp in the stream's clock-rate units, with wraparound
/// already resolved by the upstream jitter buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub timestamp: u64,
    pub clock_rate: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timestamp, self.clock_rate)
    }
}
