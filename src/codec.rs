//! The codec-factory surface this crate presents to the surrounding media
//! framework: allocation, open/close, and the two decode entry points
//! (`decode` over RTP fragments, `decode_whole` over an assembled annex-B
//! buffer).
//!
//! The PS/H.264 parsing above this module is kept pure — it only produces
//! bytes. The actual video decoder is an injected capability
//! ([`VideoDecoder`]), so this module never depends on a concrete decoding
//! library.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::error;

use crate::context::Timestamp;
use crate::cursor::{Cursor, Fragment};
use crate::error::{ErrorContext, ParseError};
use crate::params::Parameters;
use crate::ps::{self, FrameAssembly};

/// A decoded video frame, as returned by the injected [`VideoDecoder`].
#[derive(Debug)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub timestamp: Timestamp,
    pub data: bytes::Bytes,
    /// Whether the underlying decoder reports this frame as a key frame.
    /// Drives the `KeyframeFound`/`KeyframeMissing` events.
    pub is_keyframe: bool,
}

/// What a [`Runtime::decode`] call produced. A key frame routed to an
/// installed [`FrameCallback`] never reaches the decoder, so that outcome
/// is a distinct variant rather than an error — it isn't a failure, and
/// collapsing it into `Result`'s error arm would make callers that `match`
/// on `ParseError` have to special-case a non-error. A non-key frame while
/// a callback is installed is dropped the same way: the callback exists to
/// capture raw key frames, so anything else with a callback installed never
/// reaches the decoder either.
#[derive(Debug)]
pub enum DecodeOutcome {
    Decoded(DecodedFrame),
    CapturedKeyframe,
    Dropped,
}

/// Events the adapter emits to the surrounding framework's event sink.
/// These are distinct from [`ParseError`]: they describe state transitions
/// in an otherwise-successful decode, not failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecEvent {
    FmtChanged { width: u32, height: u32 },
    KeyframeFound,
    KeyframeMissing,
}

/// The external H.264 decoder, injected so this crate has no link-time
/// dependency on a concrete decoding library.
pub trait VideoDecoder: Send {
    /// `params` is `Some` when the negotiated fmtp carried
    /// `sprop-parameter-sets`, giving the decoder SPS/PPS-derived extradata
    /// up front instead of waiting to see an in-band parameter set NAL.
    fn open(&mut self, descriptor: &CodecDescriptor, params: Option<&Parameters>) -> Result<(), ParseError>;
    fn close(&mut self);
    fn decode(&mut self, annex_b: &[u8], ts: Timestamp) -> Result<DecodedFrame, ParseError>;
}

/// Receives a completed I-frame's raw annex-B buffer instead of letting it
/// reach the decoder, so upstream code can republish or archive the raw
/// bitstream. Installed once; never swapped mid-call.
pub trait FrameCallback: Send {
    fn on_keyframe(&mut self, annex_b: &[u8], callee_id: Option<&str>, ts: Timestamp);
}

/// The surrounding media framework's event bus, injected the same way the
/// decoder is: this crate only decides *when* a [`CodecEvent`] fires,
/// never how it's delivered upstream.
pub trait EventSink: Send {
    fn emit(&mut self, event: CodecEvent);
}

/// Static codec parameters. A plain `Copy` struct built with an explicit
/// constructor, not a config-file/`serde` layer: these values are process
/// constants, not externally tunable.
#[derive(Copy, Clone, Debug)]
pub struct CodecDescriptor {
    pub frame_size: (u32, u32),
    pub frame_rate: (u32, u32),
    pub avg_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub mtu: usize,
    /// Bound on the cross-fragment cursor's stitch scratch and, by
    /// extension, the largest single contiguous field this crate will
    /// parse out of one PS element.
    pub scratch_cap: usize,
    /// Bound on the assembled per-frame annex-B accumulator.
    pub max_frame_bytes: usize,
}

impl Default for CodecDescriptor {
    fn default() -> Self {
        CodecDescriptor {
            frame_size: (1920, 1080),
            frame_rate: (25, 1),
            avg_bitrate_bps: 256_000,
            max_bitrate_bps: 256_000,
            mtu: 1400,
            scratch_cap: 2000,
            max_frame_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Negotiated SDP fmtp parameters for one codec instance.
#[derive(Clone, Debug, Default)]
pub struct Fmtp {
    pub profile_level_id: Option<String>,
    pub packetization_mode: Option<u8>,
    pub sprop_parameter_sets: Option<String>,
}

/// Opaque identifier for a live codec instance, looked up through the
/// [`Runtime`] rather than held as a raw pointer — see DESIGN.md on
/// replacing the source's cyclic ownership with an explicit handle table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CodecHandle(u64);

struct CodecInstance {
    descriptor: CodecDescriptor,
    fmtp: Fmtp,
    parameters: Option<Parameters>,
    decoder: Box<dyn VideoDecoder>,
    callback: Option<Box<dyn FrameCallback>>,
    event_sink: Option<Box<dyn EventSink>>,
    ever_saw_keyframe: bool,
    last_dims: Option<(u32, u32)>,
}

enum FactoryState {
    Uninit,
    Init { instances: std::collections::HashMap<u64, CodecInstance> },
}

/// Factory-wide state. Guards only encoder/decoder context open/close and
/// registration — never held across a `decode` call, so concurrent codec
/// instances don't serialize on each other's hot path.
pub struct Runtime {
    state: Mutex<FactoryState>,
    next_handle: AtomicU64,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime { state: Mutex::new(FactoryState::Uninit), next_handle: AtomicU64::new(1) }
    }

    /// Idempotent: a second `init` on an already-initialized runtime
    /// succeeds without side effects.
    pub fn init(&self) {
        let mut guard = self.state.lock().unwrap();
        if matches!(*guard, FactoryState::Uninit) {
            *guard = FactoryState::Init { instances: std::collections::HashMap::new() };
        }
    }

    pub fn deinit(&self) -> Result<(), ParseError> {
        let mut guard = self.state.lock().unwrap();
        match &mut *guard {
            FactoryState::Uninit => Err(ParseError::Unsup("deinit called before init".into())),
            FactoryState::Init { instances } => {
                for (_, inst) in instances.iter_mut() {
                    inst.decoder.close();
                }
                *guard = FactoryState::Uninit;
                Ok(())
            }
        }
    }

    /// Allocates a codec instance from a boxed decoder the caller
    /// constructs. Fails [`ParseError::Unsup`] if `info` doesn't request
    /// the single descriptor this factory serves.
    pub fn alloc(&self, descriptor: CodecDescriptor, decoder: Box<dyn VideoDecoder>) -> Result<CodecHandle, ParseError> {
        let mut guard = self.state.lock().unwrap();
        let instances = match &mut *guard {
            FactoryState::Uninit => return Err(ParseError::Unsup("factory not initialized".into())),
            FactoryState::Init { instances } => instances,
        };
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        instances.insert(
            id,
            CodecInstance {
                descriptor,
                fmtp: Fmtp::default(),
                parameters: None,
                decoder,
                callback: None,
                event_sink: None,
                ever_saw_keyframe: false,
                last_dims: None,
            },
        );
        Ok(CodecHandle(id))
    }

    /// Applies the negotiated fmtp (profile-level-id / packetization-mode /
    /// sprop-parameter-sets) and opens the injected decoder under the
    /// factory mutex (context open/close is the one thing this mutex
    /// serializes).
    pub fn open(&self, handle: CodecHandle, fmtp: Fmtp) -> Result<(), ParseError> {
        let parameters = match fmtp.sprop_parameter_sets.as_deref() {
            Some(value) => Some(Parameters::from_sprop_parameter_sets(value)?),
            None => None,
        };
        let mut guard = self.state.lock().unwrap();
        let inst = self.get_mut(&mut guard, handle)?;
        inst.decoder.open(&inst.descriptor, parameters.as_ref())?;
        inst.fmtp = fmtp;
        inst.parameters = parameters;
        Ok(())
    }

    /// The decoder extradata derived from this codec's negotiated
    /// `sprop-parameter-sets`, if any was supplied at `open`.
    pub fn parameters(&self, handle: CodecHandle) -> Result<Option<Parameters>, ParseError> {
        let mut guard = self.state.lock().unwrap();
        let inst = self.get_mut(&mut guard, handle)?;
        Ok(inst.parameters.clone())
    }

    pub fn set_callback(&self, handle: CodecHandle, callback: Box<dyn FrameCallback>) -> Result<(), ParseError> {
        let mut guard = self.state.lock().unwrap();
        let inst = self.get_mut(&mut guard, handle)?;
        inst.callback = Some(callback);
        Ok(())
    }

    /// Installs the framework's event sink, used to surface format changes
    /// and keyframe presence/absence out of `decode_whole`.
    pub fn set_event_sink(&self, handle: CodecHandle, sink: Box<dyn EventSink>) -> Result<(), ParseError> {
        let mut guard = self.state.lock().unwrap();
        let inst = self.get_mut(&mut guard, handle)?;
        inst.event_sink = Some(sink);
        Ok(())
    }

    pub fn close(&self, handle: CodecHandle) -> Result<(), ParseError> {
        let mut guard = self.state.lock().unwrap();
        let inst = self.get_mut(&mut guard, handle)?;
        inst.decoder.close();
        Ok(())
    }

    pub fn free(&self, handle: CodecHandle) -> Result<(), ParseError> {
        let mut guard = self.state.lock().unwrap();
        match &mut *guard {
            FactoryState::Uninit => Err(ParseError::Unsup("factory not initialized".into())),
            FactoryState::Init { instances } => {
                if let Some(mut inst) = instances.remove(&handle.0) {
                    inst.decoder.close();
                }
                Ok(())
            }
        }
    }

    fn get_mut<'a>(&self, guard: &'a mut std::sync::MutexGuard<'_, FactoryState>, handle: CodecHandle) -> Result<&'a mut CodecInstance, ParseError> {
        match &mut **guard {
            FactoryState::Uninit => Err(ParseError::Unsup("factory not initialized".into())),
            FactoryState::Init { instances } => instances
                .get_mut(&handle.0)
                .ok_or_else(|| ParseError::bug(ErrorContext::default(), "unknown codec handle")),
        }
    }

    /// Parses `fragments` as one frame's worth of PS data, then either
    /// routes the completed annex-B buffer to the installed
    /// [`FrameCallback`] (for a key frame), drops it silently (a non-key
    /// frame while a callback is installed), or hands it to the decoder.
    /// `callee_id` is passed straight through to the callback, letting a
    /// caller identify which call this key frame belongs to.
    ///
    /// This doesn't hold the factory mutex across the parse or the decode
    /// call: it copies out what it needs and releases the lock, since only
    /// open/close/registration need serializing.
    pub fn decode(&self, handle: CodecHandle, fragments: &[Fragment], ts: Timestamp, callee_id: Option<String>) -> Result<DecodeOutcome, ParseError> {
        let (scratch_cap, max_frame_bytes) = {
            let mut guard = self.state.lock().unwrap();
            let inst = self.get_mut(&mut guard, handle)?;
            (inst.descriptor.scratch_cap, inst.descriptor.max_frame_bytes)
        };

        let mut cursor = Cursor::new(fragments, scratch_cap);
        let mut state = FrameAssembly::new(max_frame_bytes);
        state.callee_id = callee_id;
        ps::unpack(&mut cursor, &mut state)?;

        let has_callback = {
            let mut guard = self.state.lock().unwrap();
            let inst = self.get_mut(&mut guard, handle)?;
            inst.callback.is_some()
        };

        // A callback installed means the decoder is never invoked: a key
        // frame goes to the callback, anything else is dropped silently
        // (the callback exists to capture raw key frames, not to filter
        // what reaches the decoder).
        if has_callback {
            if state.is_i_frame {
                let mut guard = self.state.lock().unwrap();
                let inst = self.get_mut(&mut guard, handle)?;
                if let Some(cb) = inst.callback.as_mut() {
                    cb.on_keyframe(&state.accumulator, state.callee_id.as_deref(), ts);
                }
                inst.ever_saw_keyframe = true;
                return Ok(DecodeOutcome::CapturedKeyframe);
            }
            return Ok(DecodeOutcome::Dropped);
        }

        self.decode_whole(handle, &state.accumulator, ts).map(DecodeOutcome::Decoded)
    }

    /// Runs exactly one synchronous call into the injected decoder and
    /// translates its outcome into the event contract: format changes and
    /// keyframe presence/absence surface as [`CodecEvent`]s, not as part of
    /// the `Result`.
    pub fn decode_whole(&self, handle: CodecHandle, annex_b: &[u8], ts: Timestamp) -> Result<DecodedFrame, ParseError> {
        let mut guard = self.state.lock().unwrap();
        let inst = self.get_mut(&mut guard, handle)?;
        match inst.decoder.decode(annex_b, ts) {
            Ok(frame) => {
                let dims = (frame.width, frame.height);
                if inst.last_dims != Some(dims) {
                    inst.last_dims = Some(dims);
                    if let Some(sink) = inst.event_sink.as_mut() {
                        sink.emit(CodecEvent::FmtChanged { width: frame.width, height: frame.height });
                    }
                }
                if frame.is_keyframe {
                    inst.ever_saw_keyframe = true;
                    if let Some(sink) = inst.event_sink.as_mut() {
                        sink.emit(CodecEvent::KeyframeFound);
                    }
                } else if !inst.ever_saw_keyframe {
                    if let Some(sink) = inst.event_sink.as_mut() {
                        sink.emit(CodecEvent::KeyframeMissing);
                    }
                }
                Ok(frame)
            }
            Err(e) => {
                error!("decode failed ({}): {}", e, if inst.ever_saw_keyframe { "keyframe previously seen" } else { "no keyframe seen yet" });
                if !inst.ever_saw_keyframe {
                    if let Some(sink) = inst.event_sink.as_mut() {
                        sink.emit(CodecEvent::KeyframeMissing);
                    }
                }
                Err(ParseError::DecoderFailed(e.to_string()))
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDecoder {
        opened: bool,
    }

    impl VideoDecoder for NullDecoder {
        fn open(&mut self, _param: &CodecDescriptor, _params: Option<&Parameters>) -> Result<(), ParseError> {
            self.opened = true;
            Ok(())
        }
        fn close(&mut self) {
            self.opened = false;
        }
        fn decode(&mut self, annex_b: &[u8], ts: Timestamp) -> Result<DecodedFrame, ParseError> {
            Ok(DecodedFrame { width: 1920, height: 1080, timestamp: ts, data: bytes::Bytes::copy_from_slice(annex_b), is_keyframe: true })
        }
    }

    fn ts() -> Timestamp {
        Timestamp { timestamp: 0, clock_rate: 90_000 }
    }

    #[test]
    fn lifecycle_init_alloc_open_close_deinit() {
        let rt = Runtime::new();
        rt.init();
        rt.init(); // idempotent
        let handle = rt.alloc(CodecDescriptor::default(), Box::new(NullDecoder { opened: false })).unwrap();
        rt.open(handle, Fmtp::default()).unwrap();
        rt.close(handle).unwrap();
        rt.free(handle).unwrap();
        rt.deinit().unwrap();
    }

    #[test]
    fn alloc_before_init_is_unsup() {
        let rt = Runtime::new();
        let err = rt.alloc(CodecDescriptor::default(), Box::new(NullDecoder { opened: false }));
        assert!(matches!(err, Err(ParseError::Unsup(_))));
    }

    #[test]
    fn decode_whole_roundtrips_through_null_decoder() {
        let rt = Runtime::new();
        rt.init();
        let handle = rt.alloc(CodecDescriptor::default(), Box::new(NullDecoder { opened: false })).unwrap();
        rt.open(handle, Fmtp::default()).unwrap();
        let frame = rt.decode_whole(handle, &[0, 0, 1, 0x65], ts()).unwrap();
        assert_eq!(frame.data.as_ref(), &[0, 0, 1, 0x65]);
    }

    struct PanicsDecoder;
    impl VideoDecoder for PanicsDecoder {
        fn open(&mut self, _param: &CodecDescriptor, _params: Option<&Parameters>) -> Result<(), ParseError> {
            Ok(())
        }
        fn close(&mut self) {}
        fn decode(&mut self, _annex_b: &[u8], _ts: Timestamp) -> Result<DecodedFrame, ParseError> {
            panic!("decoder must not be invoked for a key frame routed to a callback");
        }
    }

    struct RecordingCallback {
        seen: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    }
    impl FrameCallback for RecordingCallback {
        fn on_keyframe(&mut self, annex_b: &[u8], _callee_id: Option<&str>, _ts: Timestamp) {
            self.seen.lock().unwrap().push(annex_b.to_vec());
        }
    }

    /// "Key-frame short-circuit": an installed callback on an
    /// I-frame must capture the accumulator and never reach the decoder.
    #[test]
    fn keyframe_with_callback_bypasses_decoder() {
        let rt = Runtime::new();
        rt.init();
        let handle = rt.alloc(CodecDescriptor::default(), Box::new(PanicsDecoder)).unwrap();
        rt.open(handle, Fmtp::default()).unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        rt.set_callback(handle, Box::new(RecordingCallback { seen: seen.clone() })).unwrap();

        let mut system_header = vec![0, 0, 1, 0xBB];
        system_header.extend_from_slice(&2u16.to_be_bytes());
        system_header.extend_from_slice(&[0u8; 2]);
        let nal = [0x65u8, 1, 2];
        let header_data_len = 0u8;
        let video_data = 3 + nal.len();
        let pes_len = 3 + header_data_len as usize + video_data;
        let mut video_pes = vec![0, 0, 1, 0xE0];
        video_pes.extend_from_slice(&(pes_len as u16).to_be_bytes());
        video_pes.extend_from_slice(&[0x80, 0x00, header_data_len]);
        video_pes.extend_from_slice(&[0, 0, 1]);
        video_pes.extend_from_slice(&nal);

        let mut input = system_header;
        input.extend_from_slice(&video_pes);
        let fragments = vec![Fragment::new(bytes::Bytes::from(input))];

        let outcome = rt.decode(handle, &fragments, ts(), None).unwrap();
        assert!(matches!(outcome, DecodeOutcome::CapturedKeyframe));
        assert_eq!(seen.lock().unwrap().as_slice(), &[vec![0, 0, 1, 0x65, 1, 2]]);
    }

    /// A non-key frame with a callback installed is dropped silently: the
    /// decoder (which would panic here) is never invoked.
    #[test]
    fn non_keyframe_with_callback_is_dropped() {
        let rt = Runtime::new();
        rt.init();
        let handle = rt.alloc(CodecDescriptor::default(), Box::new(PanicsDecoder)).unwrap();
        rt.open(handle, Fmtp::default()).unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        rt.set_callback(handle, Box::new(RecordingCallback { seen: seen.clone() })).unwrap();

        // No system header or PSM, so `is_i_frame` stays false.
        let nal = [0x61u8, 1, 2];
        let header_data_len = 0u8;
        let video_data = 3 + nal.len();
        let pes_len = 3 + header_data_len as usize + video_data;
        let mut video_pes = vec![0, 0, 1, 0xE0];
        video_pes.extend_from_slice(&(pes_len as u16).to_be_bytes());
        video_pes.extend_from_slice(&[0x80, 0x00, header_data_len]);
        video_pes.extend_from_slice(&[0, 0, 1]);
        video_pes.extend_from_slice(&nal);

        let fragments = vec![Fragment::new(bytes::Bytes::from(video_pes))];
        let outcome = rt.decode(handle, &fragments, ts(), None).unwrap();
        assert!(matches!(outcome, DecodeOutcome::Dropped));
        assert!(seen.lock().unwrap().is_empty());
    }

    /// `callee_id` passed to `decode` reaches the installed callback.
    #[test]
    fn callee_id_reaches_callback() {
        let rt = Runtime::new();
        rt.init();
        let handle = rt.alloc(CodecDescriptor::default(), Box::new(PanicsDecoder)).unwrap();
        rt.open(handle, Fmtp::default()).unwrap();
        let seen_callee = std::sync::Arc::new(std::sync::Mutex::new(None));
        struct CalleeCapturingCallback {
            seen: std::sync::Arc<std::sync::Mutex<Option<String>>>,
        }
        impl FrameCallback for CalleeCapturingCallback {
            fn on_keyframe(&mut self, _annex_b: &[u8], callee_id: Option<&str>, _ts: Timestamp) {
                *self.seen.lock().unwrap() = callee_id.map(|s| s.to_string());
            }
        }
        rt.set_callback(handle, Box::new(CalleeCapturingCallback { seen: seen_callee.clone() })).unwrap();

        let mut system_header = vec![0, 0, 1, 0xBB];
        system_header.extend_from_slice(&2u16.to_be_bytes());
        system_header.extend_from_slice(&[0u8; 2]);
        let nal = [0x65u8, 1, 2];
        let header_data_len = 0u8;
        let video_data = 3 + nal.len();
        let pes_len = 3 + header_data_len as usize + video_data;
        let mut video_pes = vec![0, 0, 1, 0xE0];
        video_pes.extend_from_slice(&(pes_len as u16).to_be_bytes());
        video_pes.extend_from_slice(&[0x80, 0x00, header_data_len]);
        video_pes.extend_from_slice(&[0, 0, 1]);
        video_pes.extend_from_slice(&nal);

        let mut input = system_header;
        input.extend_from_slice(&video_pes);
        let fragments = vec![Fragment::new(bytes::Bytes::from(input))];

        rt.decode(handle, &fragments, ts(), Some("caller-42".to_string())).unwrap();
        assert_eq!(seen_callee.lock().unwrap().as_deref(), Some("caller-42"));
    }

    struct RecordingSink {
        events: std::sync::Arc<std::sync::Mutex<Vec<CodecEvent>>>,
    }
    impl EventSink for RecordingSink {
        fn emit(&mut self, event: CodecEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct DimsThenKeyframeDecoder {
        calls: std::cell::Cell<u32>,
    }
    impl VideoDecoder for DimsThenKeyframeDecoder {
        fn open(&mut self, _param: &CodecDescriptor, _params: Option<&Parameters>) -> Result<(), ParseError> {
            Ok(())
        }
        fn close(&mut self) {}
        fn decode(&mut self, annex_b: &[u8], ts: Timestamp) -> Result<DecodedFrame, ParseError> {
            let n = self.calls.get();
            self.calls.set(n + 1);
            // First call reports a different size and no keyframe; second
            // call settles on the descriptor's size with a keyframe.
            let (width, height, is_keyframe) = if n == 0 { (640, 480, false) } else { (1920, 1080, true) };
            Ok(DecodedFrame { width, height, timestamp: ts, data: bytes::Bytes::copy_from_slice(annex_b), is_keyframe })
        }
    }

    /// Format changes surface as `FmtChanged`, and keyframe
    /// presence/absence surfaces as `KeyframeFound`/`KeyframeMissing`.
    #[test]
    fn decode_whole_emits_fmt_and_keyframe_events() {
        let rt = Runtime::new();
        rt.init();
        let handle = rt.alloc(CodecDescriptor::default(), Box::new(DimsThenKeyframeDecoder { calls: std::cell::Cell::new(0) })).unwrap();
        rt.open(handle, Fmtp::default()).unwrap();
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        rt.set_event_sink(handle, Box::new(RecordingSink { events: events.clone() })).unwrap();

        rt.decode_whole(handle, &[0, 0, 1, 0x61], ts()).unwrap();
        rt.decode_whole(handle, &[0, 0, 1, 0x65], ts()).unwrap();

        let seen = events.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[
                CodecEvent::FmtChanged { width: 640, height: 480 },
                CodecEvent::KeyframeMissing,
                CodecEvent::FmtChanged { width: 1920, height: 1080 },
                CodecEvent::KeyframeFound,
            ]
        );
    }
}
