//! Program Stream Map codec-id resolution.
//!
//! The PSM declares each elementary stream's `(stream_id, stream_type)`
//! pair; this table maps that pair onto the codec identifiers this crate
//! cares about. Pairs this crate has no decoder for still resolve to a
//! named [`CodecId::None`] variant rather than failing the lookup, matching
//! the source system's behavior of registering the stream without being
//! able to act on it.

/// A codec identified by the PSM, independent of whether this crate can do
/// anything with it beyond recognizing it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecId {
    H264,
    Mpeg4,
    G722,
    G723_1,
    G729,
    /// Recognized stream type with no supported decode path here: this
    /// crate only accumulates video NALs, so even the named audio codec
    /// ids above are recorded from the PSM and never decoded.
    None,
}

const PSM_TABLE: &[(u8, u8, CodecId)] = &[
    (0xE0, 0x1B, CodecId::H264),
    (0xE0, 0x10, CodecId::Mpeg4),
    (0xE0, 0x80, CodecId::None), // SVAC video
    (0xC0, 0x90, CodecId::None), // G.711
    (0xC0, 0x92, CodecId::G722),
    (0xC0, 0x93, CodecId::G723_1),
    (0xC0, 0x99, CodecId::G729),
    (0xC0, 0x9B, CodecId::None), // SVAC audio
];

/// Resolves a `(stream_id, stream_type)` pair from a PSM elementary-stream
/// map entry. Returns `None` if the pair isn't in the table at all (as
/// opposed to [`CodecId::None`], which means "known but unsupported").
pub fn resolve(stream_id: u8, stream_type: u8) -> Option<CodecId> {
    PSM_TABLE.iter().find(|(id, ty, _)| *id == stream_id && *ty == stream_type).map(|(_, _, codec)| *codec)
}
