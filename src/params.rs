//! SPS/PPS-derived codec parameters.
//!
//! Builds an `AVCDecoderConfiguration` (ISO/IEC 14496-15 §5.2.4.1) from a
//! stream's SPS and PPS NALs, the same way the sprop-parameter-sets side of
//! an SDP negotiation would — used here to hand the injected decoder the
//! pixel dimensions and "extra data" it needs to open, without this crate
//! linking against an H.264 bitstream-parsing library beyond `h264-reader`.

use std::convert::TryFrom;

use h264_reader::nal::{NalHandler, UnitType};

use crate::error::{ErrorContext, ParseError};

#[derive(Clone)]
pub struct Parameters {
    pixel_dimensions: (u32, u32),
    rfc6381_codec: String,
    avc_decoder_config: Vec<u8>,
    sps_nal: std::ops::Range<usize>,
    pps_nal: std::ops::Range<usize>,
}

impl std::fmt::Debug for Parameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use pretty_hex::PrettyHex;
        f.debug_struct("Parameters")
            .field("rfc6381_codec", &self.rfc6381_codec)
            .field("pixel_dimensions", &self.pixel_dimensions)
            .field("avc_decoder_config", &self.avc_decoder_config.hex_dump())
            .finish()
    }
}

impl Parameters {
    pub fn rfc6381_codec(&self) -> &str {
        &self.rfc6381_codec
    }

    pub fn pixel_dimensions(&self) -> (u32, u32) {
        self.pixel_dimensions
    }

    pub fn avc_decoder_config(&self) -> &[u8] {
        &self.avc_decoder_config
    }

    pub fn sps_nal(&self) -> &[u8] {
        &self.avc_decoder_config[self.sps_nal.clone()]
    }

    pub fn pps_nal(&self) -> &[u8] {
        &self.avc_decoder_config[self.pps_nal.clone()]
    }

    /// Parses raw (non-RBSP-escaped) SPS and PPS NALs, each including its
    /// one-byte NAL header, into a [`Parameters`].
    pub fn from_sps_and_pps(sps_nal: &[u8], pps_nal: &[u8]) -> Result<Self, ParseError> {
        if sps_nal.is_empty() || pps_nal.is_empty() {
            return Err(bad("empty SPS or PPS NAL"));
        }
        h264_reader::nal::NalHeader::new(sps_nal[0]).map_err(|_| bad("bad SPS NAL header"))?;
        h264_reader::nal::NalHeader::new(pps_nal[0]).map_err(|_| bad("bad PPS NAL header"))?;

        let sps_rbsp = decode_rbsp(&sps_nal[1..]);
        if sps_rbsp.len() < 4 {
            return Err(bad("SPS too short to contain profile/level"));
        }
        let rfc6381_codec = format!("avc1.{:02X}{:02X}{:02X}", sps_rbsp[0], sps_rbsp[1], sps_rbsp[2]);
        let sps = h264_reader::nal::sps::SeqParameterSet::from_bytes(&sps_rbsp).map_err(|e| bad(format!("bad SPS: {:?}", e)))?;
        let pixel_dimensions = sps.pixel_dimensions().map_err(|e| bad(format!("SPS has invalid pixel dimensions: {:?}", e)))?;

        let mut avc_decoder_config = Vec::with_capacity(11 + sps_nal.len() + pps_nal.len());
        avc_decoder_config.push(1); // configurationVersion
        avc_decoder_config.extend(&sps_rbsp[0..=2]); // profile/compat/level
        avc_decoder_config.push(0xff); // lengthSizeMinusOne = 3, reserved bits set
        avc_decoder_config.push(0xe1); // reserved 0b111 + numOfSequenceParameterSets = 1
        avc_decoder_config.extend(&u16::try_from(sps_nal.len()).map_err(|_| bad("SPS too large"))?.to_be_bytes());
        let sps_start = avc_decoder_config.len();
        avc_decoder_config.extend_from_slice(sps_nal);
        let sps_end = avc_decoder_config.len();
        avc_decoder_config.push(1); // numOfPictureParameterSets
        avc_decoder_config.extend(&u16::try_from(pps_nal.len()).map_err(|_| bad("PPS too large"))?.to_be_bytes());
        let pps_start = avc_decoder_config.len();
        avc_decoder_config.extend_from_slice(pps_nal);
        let pps_end = avc_decoder_config.len();

        Ok(Parameters {
            pixel_dimensions,
            rfc6381_codec,
            avc_decoder_config,
            sps_nal: sps_start..sps_end,
            pps_nal: pps_start..pps_end,
        })
    }

    /// Parses a `sprop-parameter-sets` SDP fmtp value (`base64,base64`). A
    /// small number of camera firmwares leave a trailing 4-byte start code
    /// on one or both NALs; that's stripped before building the config,
    /// matching the quirk this crate's H.264 support was grounded on.
    pub fn from_sprop_parameter_sets(value: &str) -> Result<Self, ParseError> {
        let mut parts = value.split(',');
        let sps_b64 = parts.next().ok_or_else(|| bad("sprop-parameter-sets missing SPS"))?;
        let pps_b64 = parts.next().ok_or_else(|| bad("sprop-parameter-sets missing PPS"))?;
        let sps = base64::decode(sps_b64).map_err(|_| bad("SPS has invalid base64 encoding"))?;
        let pps = base64::decode(pps_b64).map_err(|_| bad("PPS has invalid base64 encoding"))?;
        let sps = strip_trailing_start_code(&sps);
        let pps = strip_trailing_start_code(&pps);
        Self::from_sps_and_pps(sps, pps)
    }
}

fn strip_trailing_start_code(nal: &[u8]) -> &[u8] {
    nal.strip_suffix(b"\x00\x00\x00\x01").unwrap_or(nal)
}

fn bad(detail: impl Into<String>) -> ParseError {
    ParseError::inval(ErrorContext::default(), detail)
}

/// Strips RBSP emulation-prevention bytes from an encoded NAL body.
fn decode_rbsp(encoded: &[u8]) -> Vec<u8> {
    struct Collect(Vec<u8>);
    impl NalHandler for Collect {
        type Ctx = ();
        fn start(&mut self, _ctx: &mut h264_reader::Context<Self::Ctx>, _header: h264_reader::nal::NalHeader) {}
        fn push(&mut self, _ctx: &mut h264_reader::Context<Self::Ctx>, buf: &[u8]) {
            self.0.extend_from_slice(buf);
        }
        fn end(&mut self, _ctx: &mut h264_reader::Context<Self::Ctx>) {}
    }
    let mut decoder = h264_reader::rbsp::RbspDecoder::new(Collect(Vec::new()));
    let mut ctx = h264_reader::Context::new(());
    decoder.push(&mut ctx, encoded);
    decoder.into_handler().0
}

/// Recognizes the NAL unit type of a parsed SPS/PPS NAL, to sanity-check
/// callers feeding the right bytes into [`Parameters::from_sps_and_pps`].
pub fn nal_unit_type(nal: &[u8]) -> Option<UnitType> {
    nal.first().and_then(|b| h264_reader::nal::NalHeader::new(*b).ok()).map(|h| h.nal_unit_type())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gw_security_sprop_parameter_sets() {
        let params = Parameters::from_sprop_parameter_sets("Z00AHpWoLQ9puAgICBAAAAAB,aO48gAAAAAE=").unwrap();
        assert_eq!(params.sps_nal(), b"\x67\x4d\x00\x1e\x95\xa8\x2d\x0f\x69\xb8\x08\x08\x08\x10");
        assert_eq!(params.pps_nal(), b"\x68\xee\x3c\x80");
    }
}
