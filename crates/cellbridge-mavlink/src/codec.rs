//! Text-safe transport encodings for binary frames.
//!
//! The modem's MQTT client handles arbitrary bytes poorly, so frames travel
//! as text. Base64 costs a third more bytes on the wire; hex doubles the
//! size but is readable in a broker console. Which one a build uses is fixed
//! by the `hex-codec` feature ([`BRIDGE_CODEC`]).
//!
//! Decoding is lenient: Base64 input may carry whitespace or other stray
//! characters, several padded encodings in a row decode one after another,
//! and a dangling hex digit is ignored. Input that still cannot
//! be decoded yields no bytes from [`TextCodec::decode`].

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use log::debug;

use crate::error::{FrameError, FrameResult};

/// Standard alphabet, padding optional, trailing bits tolerated.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// A reversible byte-to-text encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCodec {
    /// Uppercase hexadecimal, two characters per byte.
    Hex,
    /// RFC 4648 Base64 with `=` padding.
    Base64,
}

/// Codec used on the bridge topics.
#[cfg(feature = "hex-codec")]
pub const BRIDGE_CODEC: TextCodec = TextCodec::Hex;

/// Codec used on the bridge topics.
#[cfg(not(feature = "hex-codec"))]
pub const BRIDGE_CODEC: TextCodec = TextCodec::Base64;

impl TextCodec {
    /// Codec name for logs.
    pub fn name(self) -> &'static str {
        match self {
            TextCodec::Hex => "hex",
            TextCodec::Base64 => "base64",
        }
    }

    /// Encoded length of `len` input bytes.
    pub fn encoded_len(self, len: usize) -> usize {
        match self {
            TextCodec::Hex => len * 2,
            TextCodec::Base64 => len.div_ceil(3) * 4,
        }
    }

    /// Encode `data` as text.
    pub fn encode(self, data: &[u8]) -> String {
        match self {
            TextCodec::Hex => hex::encode_upper(data),
            TextCodec::Base64 => STANDARD.encode(data),
        }
    }

    /// Decode `text`, reporting why it could not be decoded.
    pub fn try_decode(self, text: &[u8]) -> FrameResult<Vec<u8>> {
        match self {
            TextCodec::Hex => {
                let even = text.len() & !1;
                hex::decode(&text[..even]).map_err(|err| FrameError::InvalidText {
                    codec: self.name(),
                    message: err.to_string(),
                })
            }
            TextCodec::Base64 => {
                let symbols: Vec<u8> = text
                    .iter()
                    .copied()
                    .filter(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
                    .collect();
                let mut out = Vec::with_capacity(symbols.len() / 4 * 3 + 2);
                // Padding closes a group.
                for group in symbols.split(|&b| b == b'=').filter(|g| !g.is_empty()) {
                    // A lone trailing symbol carries fewer than eight bits.
                    let usable = group.len() - usize::from(group.len() % 4 == 1);
                    LENIENT_BASE64
                        .decode_vec(&group[..usable], &mut out)
                        .map_err(|err| FrameError::InvalidText {
                            codec: self.name(),
                            message: err.to_string(),
                        })?;
                }
                Ok(out)
            }
        }
    }

    /// Decode `text`; undecodable input yields no bytes.
    pub fn decode(self, text: &[u8]) -> Vec<u8> {
        self.try_decode(text).unwrap_or_else(|err| {
            debug!("{}", err);
            Vec::new()
        })
    }
}

impl std::fmt::Display for TextCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
