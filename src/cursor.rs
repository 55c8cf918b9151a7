//! Cross-fragment read cursor.
//!
//! A [`Cursor`] makes an array of RTP fragments look like one logical byte
//! stream to the PS framer. Most reads land entirely within the current
//! fragment and are zero-copy; a read that straddles a boundary is stitched
//! into a small reusable scratch buffer instead of forcing the framer to
//! special-case the boundary itself.

use bytes::{Bytes, BytesMut};

use crate::context::Context;
use crate::error::{ErrorContext, ParseError};

/// One RTP payload, the cursor's unit of input.
pub struct Fragment {
    pub buf: Bytes,
    pub rtp_sequence: Option<u16>,
}

impl Fragment {
    pub fn new(buf: Bytes) -> Self {
        Fragment { buf, rtp_sequence: None }
    }

    pub fn with_sequence(buf: Bytes, rtp_sequence: u16) -> Self {
        Fragment { buf, rtp_sequence: Some(rtp_sequence) }
    }
}

pub struct Cursor<'f> {
    fragments: &'f [Fragment],
    idx: usize,
    offset: usize,
    scratch: BytesMut,
    scratch_cap: usize,
}

impl<'f> Cursor<'f> {
    /// `scratch_cap` bounds how many bytes a single stitched [`Cursor::get`]
    /// may span; it's a construction parameter, not a hardcoded constant,
    /// so callers can size it to their own worst-case field width.
    pub fn new(fragments: &'f [Fragment], scratch_cap: usize) -> Self {
        Cursor {
            fragments,
            idx: 0,
            offset: 0,
            scratch: BytesMut::with_capacity(scratch_cap),
            scratch_cap,
        }
    }

    fn current_ctx(&self) -> Context {
        Context {
            fragment_index: self.idx.min(self.fragments.len().saturating_sub(1)),
            rtp_sequence: self.fragments.get(self.idx).and_then(|f| f.rtp_sequence),
        }
    }

    fn err_ctx(&self, offset: usize) -> ErrorContext {
        let ctx = self.current_ctx();
        ErrorContext { fragment_index: ctx.fragment_index, rtp_sequence: ctx.rtp_sequence, offset }
    }

    /// True once every fragment has been fully consumed.
    pub fn is_exhausted(&self) -> bool {
        self.idx >= self.fragments.len()
    }

    fn current_remaining(&self) -> usize {
        self.fragments.get(self.idx).map_or(0, |f| f.buf.len() - self.offset)
    }

    /// Advances past fully-consumed fragments. Called after every operation
    /// so `current_remaining() == 0` never persists once a later fragment
    /// exists.
    fn normalize(&mut self) {
        while self.idx < self.fragments.len() && self.offset >= self.fragments[self.idx].buf.len() {
            self.idx += 1;
            self.offset = 0;
        }
    }

    /// Reads exactly `n` bytes, returning a slice into the current fragment
    /// when possible and otherwise a slice into the reusable scratch buffer.
    /// The returned slice borrows `self`, so it must be consumed before the
    /// next call that needs to refill scratch.
    pub fn get(&mut self, n: usize) -> Result<&[u8], ParseError> {
        self.normalize();
        if self.current_remaining() >= n {
            let frag = &self.fragments[self.idx].buf;
            let start = self.offset;
            self.offset += n;
            return Ok(&frag[start..start + n]);
        }
        if n > self.scratch_cap {
            return Err(ParseError::too_small(self.err_ctx(self.offset), n, self.scratch_cap));
        }
        self.scratch.clear();
        let mut remaining = n;
        while remaining > 0 {
            self.normalize();
            if self.idx >= self.fragments.len() {
                return Err(ParseError::eof(self.err_ctx(self.offset), remaining));
            }
            let frag = &self.fragments[self.idx].buf;
            let avail = frag.len() - self.offset;
            let take = avail.min(remaining);
            self.scratch.extend_from_slice(&frag[self.offset..self.offset + take]);
            self.offset += take;
            remaining -= take;
        }
        Ok(&self.scratch[..n])
    }

    /// Advances past `n` bytes without copying them anywhere.
    pub fn seek(&mut self, n: usize) -> Result<(), ParseError> {
        let mut remaining = n;
        while remaining > 0 {
            self.normalize();
            if self.idx >= self.fragments.len() {
                return Err(ParseError::eof(self.err_ctx(self.offset), remaining));
            }
            let avail = self.current_remaining();
            let take = avail.min(remaining);
            self.offset += take;
            remaining -= take;
        }
        self.normalize();
        Ok(())
    }

    /// Appends exactly `n` bytes of cursor data onto `out`, crossing
    /// fragment boundaries transparently. Fails without partially writing
    /// past `cap` if `out` would exceed it.
    pub fn copy_into(&mut self, n: usize, out: &mut BytesMut, cap: usize) -> Result<(), ParseError> {
        if out.len() + n > cap {
            return Err(ParseError::too_small(self.err_ctx(self.offset), out.len() + n, cap));
        }
        let mut remaining = n;
        while remaining > 0 {
            self.normalize();
            if self.idx >= self.fragments.len() {
                return Err(ParseError::eof(self.err_ctx(self.offset), remaining));
            }
            let frag = &self.fragments[self.idx].buf;
            let avail = frag.len() - self.offset;
            let take = avail.min(remaining);
            out.extend_from_slice(&frag[self.offset..self.offset + take]);
            self.offset += take;
            remaining -= take;
        }
        Ok(())
    }
}
