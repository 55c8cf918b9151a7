//! MPEG Program Stream framing.
//!
//! [`unpack`] drives a [`Cursor`] over one frame's worth of RTP fragments,
//! recognizing each PS element by its start-code-prefixed stream id and
//! dispatching to a per-element parser. Video PES payload is handed to the
//! [`crate::h264::Depacketizer`]; everything else is either skipped (audio,
//! private data) or consumed for its side effect on frame state (pack
//! header, system header, PSM).

pub mod psm;

use bytes::BytesMut;
use log::{debug, warn};

use crate::context::Context;
use crate::cursor::Cursor;
use crate::error::{ErrorContext, ParseError};
use crate::h264::Depacketizer;
use psm::CodecId;

const START_CODE_PREFIX: [u8; 3] = [0, 0, 1];

/// The PS element a start code's fourth byte identifies.
#[derive(Debug, PartialEq, Eq)]
enum PsElement {
    PackHeader,
    SystemHeader,
    Psm,
    VideoPes,
    AudioPes,
    PrivateTail,
    Unknown(u8),
}

impl PsElement {
    fn from_stream_id(b: u8) -> Self {
        match b {
            0xBA => PsElement::PackHeader,
            0xBB => PsElement::SystemHeader,
            0xBC => PsElement::Psm,
            0xE0 => PsElement::VideoPes,
            0xC0 => PsElement::AudioPes,
            0xBD => PsElement::PrivateTail,
            other => PsElement::Unknown(other),
        }
    }
}

/// Accumulated state for one frame's worth of PS parsing.
pub struct FrameAssembly {
    pub accumulator: BytesMut,
    accumulator_cap: usize,
    pub is_i_frame: bool,
    pub total_video_pes_len: usize,
    pub video_codec_id: Option<CodecId>,
    pub audio_codec_id: Option<CodecId>,
    /// Optional caller-supplied identifier threaded through rather than
    /// smuggled inside the accumulator's contents.
    pub callee_id: Option<String>,
    depacketizer: Depacketizer,
}

impl FrameAssembly {
    pub fn new(accumulator_cap: usize) -> Self {
        FrameAssembly {
            accumulator: BytesMut::with_capacity(accumulator_cap),
            accumulator_cap,
            is_i_frame: false,
            total_video_pes_len: 0,
            video_codec_id: None,
            audio_codec_id: None,
            callee_id: None,
            depacketizer: Depacketizer::new(),
        }
    }
}

fn err_ctx(ctx: Context, offset: usize) -> ErrorContext {
    ErrorContext { fragment_index: ctx.fragment_index, rtp_sequence: ctx.rtp_sequence, offset }
}

fn frag_ctx(cur_idx: usize) -> Context {
    Context { fragment_index: cur_idx, rtp_sequence: None }
}

/// Consumes the cursor to exhaustion, populating `state`. Returns `Ok(())`
/// on a clean parse; any error leaves `state.accumulator` with whatever was
/// written before the failing element and must not be handed to a decoder.
pub fn unpack(cursor: &mut Cursor<'_>, state: &mut FrameAssembly) -> Result<(), ParseError> {
    let mut element_index = 0usize;
    while !cursor.is_exhausted() {
        let ctx = frag_ctx(element_index);
        let result = unpack_one_element(cursor, state, ctx, &mut element_index);
        if let Err(ref e) = result {
            warn!("PS parse failed at {}: {}", ctx, e);
        }
        result?;
    }
    Ok(())
}

/// Parses exactly one start-code-prefixed element. Factored out of
/// [`unpack`] so every failure, from whichever sub-parser produced it, logs
/// once at a single call site instead of each parser logging its own
/// error before propagating it with `?`.
fn unpack_one_element(cursor: &mut Cursor<'_>, state: &mut FrameAssembly, ctx: Context, element_index: &mut usize) -> Result<(), ParseError> {
    let prefix: [u8; 4] = {
        let b = cursor.get(4)?;
        [b[0], b[1], b[2], b[3]]
    };
    if prefix[0..3] != START_CODE_PREFIX {
        return Err(ParseError::inval(err_ctx(ctx, 0), format!("expected start code prefix, got {:02x?}", &prefix[0..3])));
    }
    *element_index += 1;
    match PsElement::from_stream_id(prefix[3]) {
        PsElement::PackHeader => parse_pack_header(cursor, ctx)?,
        PsElement::SystemHeader => {
            parse_length_prefixed_skip(cursor, ctx)?;
            state.is_i_frame = true;
        }
        PsElement::Psm => {
            parse_psm(cursor, state, ctx)?;
            state.is_i_frame = true;
        }
        PsElement::VideoPes => parse_video_pes(cursor, state, ctx)?,
        PsElement::AudioPes => parse_length_prefixed_skip(cursor, ctx)?,
        PsElement::PrivateTail => parse_length_prefixed_skip(cursor, ctx)?,
        PsElement::Unknown(id) => {
            return Err(ParseError::inval(err_ctx(ctx, 3), format!("unknown PS stream id 0x{:02x}", id)));
        }
    }
    Ok(())
}

/// Pack header (`0xBA`): 10 bytes of fixed fields followed by a
/// variable-length stuffing run given by the low 3 bits of the last byte.
fn parse_pack_header(cursor: &mut Cursor<'_>, ctx: Context) -> Result<(), ParseError> {
    let stuffing_len = {
        let b = cursor.get(10)?;
        usize::from(b[9] & 0b0000_0111)
    };
    cursor.seek(stuffing_len).map_err(|_| ParseError::eof(err_ctx(ctx, 10), stuffing_len))
}

/// Handles any element whose layout is "2-byte big-endian length, then that
/// many bytes to skip": system header, audio PES payload (we don't decode
/// audio), and the private/PS-tail element.
fn parse_length_prefixed_skip(cursor: &mut Cursor<'_>, ctx: Context) -> Result<(), ParseError> {
    let len = {
        let b = cursor.get(2)?;
        usize::from(u16::from_be_bytes([b[0], b[1]]))
    };
    cursor.seek(len).map_err(|_| ParseError::eof(err_ctx(ctx, 2), len))
}

fn parse_psm(cursor: &mut Cursor<'_>, state: &mut FrameAssembly, ctx: Context) -> Result<(), ParseError> {
    let _psm_len = {
        let b = cursor.get(2)?;
        usize::from(u16::from_be_bytes([b[0], b[1]]))
    };
    cursor.seek(2)?; // PSM control bytes (current_next_indicator / reserved / version).

    let program_stream_info_len = {
        let b = cursor.get(2)?;
        usize::from(u16::from_be_bytes([b[0], b[1]]))
    };
    cursor.seek(program_stream_info_len)?;

    let mut es_map_remaining = {
        let b = cursor.get(2)?;
        usize::from(u16::from_be_bytes([b[0], b[1]]))
    };
    while es_map_remaining > 0 {
        let (stream_type, stream_id) = {
            let b = cursor.get(2)?;
            (b[0], b[1])
        };
        let es_info_len = {
            let b = cursor.get(2)?;
            usize::from(u16::from_be_bytes([b[0], b[1]]))
        };
        cursor.seek(es_info_len)?;
        es_map_remaining = es_map_remaining.checked_sub(4 + es_info_len).ok_or_else(|| {
            ParseError::inval(err_ctx(ctx, 0), "elementary_stream_map_length shorter than its own entries")
        })?;

        let codec = psm::resolve(stream_id, stream_type)
            .ok_or_else(|| ParseError::inval(err_ctx(ctx, 0), format!("unrecognized PSM pair (stream_id=0x{:02x}, stream_type=0x{:02x})", stream_id, stream_type)))?;
        debug!("PSM: stream_id=0x{:02x} stream_type=0x{:02x} -> {:?}", stream_id, stream_type, codec);
        match stream_id {
            0xE0..=0xEF => state.video_codec_id = Some(codec),
            0xC0..=0xDF => state.audio_codec_id = Some(codec),
            _ => {}
        }
    }
    cursor.seek(4) // CRC_32
}

/// Video PES (`0xE0`). Extracts `video_data`, the elementary-stream payload
/// length, and either hands it to the H.264 depacketizer (when it opens
/// with the alternate 4-byte NAL start prefix) or copies it straight into
/// the accumulator (the common case: already-framed annex-B data).
fn parse_video_pes(cursor: &mut Cursor<'_>, state: &mut FrameAssembly, ctx: Context) -> Result<(), ParseError> {
    let pes_len = {
        let b = cursor.get(2)?;
        usize::from(u16::from_be_bytes([b[0], b[1]]))
    };
    let header_data_len = {
        let b = cursor.get(3)?;
        usize::from(b[2])
    };
    cursor.seek(header_data_len)?;

    let video_data = pes_len.checked_sub(3 + header_data_len).ok_or_else(|| {
        ParseError::inval(err_ctx(ctx, 2), "PES packet length shorter than its own header")
    })?;
    if video_data < 4 {
        return Err(ParseError::inval(err_ctx(ctx, 2), "video PES payload too short to contain a NAL prefix"));
    }

    let peek: [u8; 4] = {
        let b = cursor.get(4)?;
        [b[0], b[1], b[2], b[3]]
    };
    if peek == [0, 0, 0, 1] {
        // The 4-byte NAL start prefix counts as the PS 3-byte prefix plus
        // one extra byte; correct the running total and hand the rest to
        // the RTP/H.264 packing rules.
        let nal_len = video_data - 4;
        state.total_video_pes_len += video_data - 1;
        let payload = cursor.get(nal_len)?.to_vec();
        let mut acc = std::mem::take(&mut state.accumulator);
        let result = state.depacketizer.unpack(&payload, true, &mut acc, state.accumulator_cap, ctx);
        state.accumulator = acc;
        result?;
    } else {
        state.total_video_pes_len += video_data;
        if state.accumulator.len() + video_data > state.accumulator_cap {
            return Err(ParseError::too_small(err_ctx(ctx, 6), state.accumulator.len() + video_data, state.accumulator_cap));
        }
        state.accumulator.extend_from_slice(&peek);
        cursor.copy_into(video_data - 4, &mut state.accumulator, state.accumulator_cap)?;
    }
    Ok(())
}
