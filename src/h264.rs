//! H.264 NAL reassembly from RTP payload (per [RFC
//! 6184](https://tools.ietf.org/html/rfc6184)): single-NAL, STAP-A
//! aggregation, and FU-A fragmentation.
//!
//! Unlike a general RTP/H.264 depacketizer this one doesn't track access
//! unit boundaries itself — that's the PS framer's job, driven by PES
//! packet boundaries. Given one NAL-carrying chunk pulled out of a video
//! PES, [`Depacketizer::unpack`] appends its annex-B form (3-byte start
//! code + NAL body) to the caller's accumulator.

use bytes::{Buf, BufMut, BytesMut};

use crate::context::Context;
use crate::error::{ErrorContext, ParseError};

const ANNEXB_START_CODE: [u8; 3] = [0, 0, 1];

#[derive(Default)]
pub struct Depacketizer {
    /// In-progress FU-A reassembly buffer, carried across calls so a
    /// fragmented NAL can span more than one `unpack` invocation.
    frag_buf: Option<BytesMut>,

    /// The largest fragment buffer used so far; sizes the next one's
    /// initial capacity to cut down on reallocation.
    frag_high_water: usize,
}

impl Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the annex-B form of `data` (one RTP/H.264 payload, in any of
    /// the three packing modes) onto `out`, never growing it past `cap`
    /// bytes. `mark` is the RTP marker bit; it's only consulted to catch an
    /// FU-A that neither completes nor sets the marker, a stream-level
    /// contract violation.
    ///
    /// A STAP-A payload can aggregate any number of NALs, so the cap has to
    /// be enforced per NAL as each one is written rather than precomputed
    /// by the caller from the aggregate payload size.
    pub fn unpack(&mut self, mut data: &[u8], mark: bool, out: &mut BytesMut, cap: usize, ctx: Context) -> Result<(), ParseError> {
        if data.is_empty() {
            return Err(ParseError::inval(err_ctx(ctx), "empty NAL payload"));
        }
        let nal_header = data[0];
        if (nal_header >> 7) != 0 {
            return Err(ParseError::inval(err_ctx(ctx), "NAL header has forbidden_zero_bit set"));
        }
        match nal_header & 0b1_1111 {
            1..=23 => {
                if self.frag_buf.is_some() {
                    return Err(ParseError::inval(err_ctx(ctx), "non-fragmented NAL while FU-A in progress"));
                }
                write_annexb(out, data, cap, ctx)?;
            }
            24 => {
                // STAP-A: https://tools.ietf.org/html/rfc6184#section-5.7.1
                data.advance(1);
                loop {
                    if data.remaining() < 2 {
                        return Err(ParseError::inval(err_ctx(ctx), "STAP-A truncated before NAL length"));
                    }
                    let len = usize::from(data.get_u16()) as usize;
                    if data.remaining() < len {
                        return Err(ParseError::inval(err_ctx(ctx), "STAP-A NAL length exceeds remaining payload"));
                    }
                    write_annexb(out, &data[..len], cap, ctx)?;
                    data.advance(len);
                    if data.remaining() == 0 {
                        break;
                    }
                }
            }
            25..=27 | 29 => {
                return Err(ParseError::Unsup(format!("unimplemented NAL packing (header 0x{:02x})", nal_header)));
            }
            28 => {
                // FU-A: https://tools.ietf.org/html/rfc6184#section-5.8
                if data.len() < 3 {
                    return Err(ParseError::inval(err_ctx(ctx), "FU-A payload too short"));
                }
                let fu_header = data[1];
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let reserved = (fu_header & 0b0010_0000) != 0;
                let reassembled_header = (nal_header & 0b0110_0000) | (fu_header & 0b0001_1111);
                if (start && end) || reserved {
                    return Err(ParseError::inval(err_ctx(ctx), "malformed FU-A header"));
                }
                match (start, self.frag_buf.take()) {
                    (true, Some(_)) => {
                        return Err(ParseError::inval(err_ctx(ctx), "FU-A start bit while a fragment was already in progress"));
                    }
                    (true, None) => {
                        let mut buf = BytesMut::with_capacity(self.frag_high_water.max(data.len() - 1));
                        buf.put_u8(reassembled_header);
                        buf.put(&data[2..]);
                        self.frag_buf = Some(buf);
                    }
                    (false, Some(mut buf)) => {
                        if buf[0] != reassembled_header {
                            return Err(ParseError::inval(err_ctx(ctx), "FU-A NAL type changed mid-fragment"));
                        }
                        buf.put(&data[2..]);
                        if end {
                            self.frag_high_water = buf.len();
                            write_annexb(out, &buf, cap, ctx)?;
                        } else if mark {
                            return Err(ParseError::inval(err_ctx(ctx), "RTP marker set without FU-A end bit"));
                        } else {
                            self.frag_buf = Some(buf);
                        }
                    }
                    (false, None) => {
                        return Err(ParseError::inval(err_ctx(ctx), "FU-A continuation with no fragment in progress"));
                    }
                }
            }
            _ => unreachable!("5-bit field"),
        }
        Ok(())
    }

    /// True while an FU-A reassembly is mid-flight; the caller must not
    /// treat the current access unit as complete while this holds.
    pub fn fragment_in_progress(&self) -> bool {
        self.frag_buf.is_some()
    }
}

/// Appends one NAL's annex-B form to `out`, failing `TooSmall` without
/// writing anything if doing so would grow `out` past `cap`: the bound is
/// checked before the write, never as a truncation after.
fn write_annexb(out: &mut BytesMut, nal: &[u8], cap: usize, ctx: Context) -> Result<(), ParseError> {
    let needed = out.len() + ANNEXB_START_CODE.len() + nal.len();
    if needed > cap {
        return Err(ParseError::too_small(err_ctx(ctx), needed, cap));
    }
    out.extend_from_slice(&ANNEXB_START_CODE);
    out.extend_from_slice(nal);
    Ok(())
}

fn err_ctx(ctx: Context) -> ErrorContext {
    ErrorContext { fragment_index: ctx.fragment_index, rtp_sequence: ctx.rtp_sequence, offset: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::default()
    }

    #[test]
    fn single_nal_passthrough() {
        let mut d = Depacketizer::new();
        let mut out = BytesMut::new();
        d.unpack(&[0x65, 1, 2, 3], true, &mut out, 4096, ctx()).unwrap();
        assert_eq!(&out[..], &[0, 0, 1, 0x65, 1, 2, 3]);
    }

    #[test]
    fn stap_a_splits_two_nals() {
        let mut d = Depacketizer::new();
        let mut out = BytesMut::new();
        // STAP-A header (24), then NAL1 len=2 {0x67,0xAA}, NAL2 len=2 {0x68,0xBB}.
        let payload = [24, 0, 2, 0x67, 0xAA, 0, 2, 0x68, 0xBB];
        d.unpack(&payload, true, &mut out, 4096, ctx()).unwrap();
        assert_eq!(&out[..], &[0, 0, 1, 0x67, 0xAA, 0, 0, 1, 0x68, 0xBB]);
    }

    #[test]
    fn fu_a_reassembles_across_two_calls() {
        let mut d = Depacketizer::new();
        let mut out = BytesMut::new();
        let nal_header = 0x65u8; // nal_ref_idc=3, type=5 (IDR slice)
        let fu_indicator = (nal_header & 0b1110_0000) | 28;
        let start_header = 0b1000_0000 | (nal_header & 0x1f);
        let end_header = 0b0100_0000 | (nal_header & 0x1f);
        d.unpack(&[fu_indicator, start_header, 0xAA, 0xBB], false, &mut out, 4096, ctx()).unwrap();
        assert!(d.fragment_in_progress());
        d.unpack(&[fu_indicator, end_header, 0xCC], true, &mut out, 4096, ctx()).unwrap();
        assert!(!d.fragment_in_progress());
        assert_eq!(&out[..], &[0, 0, 1, nal_header, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn fu_a_type_change_mid_fragment_is_inval() {
        let mut d = Depacketizer::new();
        let mut out = BytesMut::new();
        let fu_indicator_1 = 0x60 | 28;
        d.unpack(&[fu_indicator_1, 0b1000_0000 | 5, 1], false, &mut out, 4096, ctx()).unwrap();
        let fu_indicator_2 = 0x60 | 28;
        let err = d.unpack(&[fu_indicator_2, 0b0100_0000 | 7, 2], true, &mut out, 4096, ctx());
        assert!(matches!(err, Err(ParseError::Inval { .. })));
    }

    #[test]
    fn stap_a_over_cap_is_too_small() {
        let mut d = Depacketizer::new();
        let mut out = BytesMut::new();
        // Five 1-byte NALs aggregated in one STAP-A; each costs 3 (start code) + 1
        // (NAL length byte's worth) + 2 (length prefix accounted separately), so the
        // running total blows past a cap sized for only the first couple.
        let mut payload = vec![24u8];
        for n in 0..5u8 {
            payload.extend_from_slice(&[0, 1, 0x67 + n]);
        }
        let err = d.unpack(&payload, true, &mut out, 10, ctx());
        assert!(matches!(err, Err(ParseError::TooSmall { .. })));
    }
}
