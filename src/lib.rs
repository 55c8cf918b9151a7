//! MPEG Program Stream demultiplexing and H.264 RTP depacketization.
//!
//! This crate sits between an RTP jitter buffer and an H.264 video decoder.
//! Given the array of RTP fragments that make up one encoded frame, it
//! parses the nested MPEG-PS framing, pulls out the H.264 elementary
//! stream, and hands a single annex-B buffer either to an injected decoder
//! or to a caller-installed callback for key frames.
//!
//! The four pieces, leaf to root: [`cursor`] (a read head over fragments
//! that stitches across boundaries only when it must), [`ps`] (the PS
//! element state machine), [`h264`] (single-NAL/STAP-A/FU-A reassembly),
//! and [`codec`] (the factory surface presented to the surrounding media
//! framework). [`params`] builds decoder extradata from SPS/PPS when a
//! stream's parameter sets arrive out of band (SDP `fmtp`) rather than
//! in-band.

pub mod codec;
pub mod context;
pub mod cursor;
pub mod error;
pub mod h264;
pub mod params;
pub mod ps;

pub use codec::{CodecDescriptor, CodecEvent, CodecHandle, DecodeOutcome, DecodedFrame, EventSink, Fmtp, FrameCallback, Runtime, VideoDecoder};
pub use context::{Context, Timestamp};
pub use cursor::{Cursor, Fragment};
pub use error::{ErrorContext, ParseError};
pub use params::Parameters;
pub use ps::psm::CodecId;
pub use ps::FrameAssembly;
