//! # PCM Codec
//!
//! Converts audio between the three representations the live coach pipeline uses:
//! normalized `f32` samples (what devices produce and consume), 16-bit little-endian
//! PCM bytes (what the remote model speaks), and base64 text (what fits inside a
//! JSON transport frame).
//!
//! ## Key Functions:
//! - **encode_binary_to_text / decode_text_to_binary**: standard padded base64
//! - **float_frame_to_pcm16**: microphone frame → PCM16 bytes
//! - **pcm16_to_float_frame**: PCM16 bytes → de-interleaved playback buffer
//! - **encode_frame**: one captured frame → one transport-ready `EncodedChunk`

use crate::audio::playback::PlaybackBuffer;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

/// Sample rate of captured microphone audio (Hz).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate the remote model uses for its spoken replies (Hz).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Scale factor between normalized floats and signed 16-bit integers.
const PCM16_SCALE: f32 = 32768.0;

/// Failure to turn transport text back into playable audio.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The text is not valid standard base64 (bad alphabet or padding).
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The byte count does not split into whole 16-bit samples for every channel.
    #[error("PCM payload of {len} bytes does not divide into 16-bit frames of {channels} channel(s)")]
    Misaligned { len: usize, channels: u16 },

    /// A buffer needs at least one channel.
    #[error("channel count must be at least 1")]
    NoChannels,
}

/// A block of normalized mono samples captured from the microphone.
///
/// Produced once per capture callback and consumed immediately by
/// [`encode_frame`]; nothing holds on to it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Samples in the range -1.0..=1.0
    pub samples: Vec<f32>,

    /// Rate the samples were captured at (16kHz for the live coach)
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// One audio frame serialized for the transport.
///
/// ## Wire Format:
/// Serializes as `{"data": "<base64>", "mimeType": "audio/pcm;rate=16000"}`,
/// which is exactly the media chunk shape the live API expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunk {
    pub data: String,
    pub mime_type: String,
}

/// Build the `audio/pcm;rate=N` mime type for a sample rate.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from an `audio/pcm` mime type.
///
/// ## Examples:
/// - `"audio/pcm;rate=24000"` → `Some(24000)`
/// - `"audio/pcm"` → `None`
/// - `"audio/pcm;rate=0"` → `None` (a zero rate can't be played)
/// - `"image/png"` → `None`
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    let mut parts = mime_type.split(';').map(str::trim);
    let essence = parts.next()?;
    if !essence.eq_ignore_ascii_case("audio/pcm") {
        return None;
    }

    parts
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|rate| *rate > 0)
}

/// Whether a mime type describes raw PCM audio.
pub fn is_pcm_mime(mime_type: &str) -> bool {
    mime_type
        .split(';')
        .next()
        .map(|essence| essence.trim().eq_ignore_ascii_case("audio/pcm"))
        .unwrap_or(false)
}

/// Encode arbitrary bytes as padded standard base64.
///
/// Output length is always a multiple of 4; empty input gives an empty string.
pub fn encode_binary_to_text(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Exact inverse of [`encode_binary_to_text`].
pub fn decode_text_to_binary(text: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(BASE64.decode(text)?)
}

/// Convert normalized float samples to 16-bit little-endian PCM.
///
/// ## Conversion:
/// Each sample is multiplied by 32768 and converted with Rust's `as i16`,
/// which truncates toward zero and saturates at the i16 bounds. That makes
/// `1.0` land on `32767` instead of wrapping around to `-32768`.
///
/// ## Rust Concepts:
/// - **Vec::with_capacity**: pre-sizes the output (2 bytes per sample)
/// - **WriteBytesExt**: byteorder's extension trait for writing fixed-width integers
pub fn float_frame_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * PCM16_SCALE) as i16;
        // Writing into a Vec<u8> cannot fail
        let _ = bytes.write_i16::<LittleEndian>(value);
    }
    bytes
}

/// Convert interleaved 16-bit little-endian PCM into a playback buffer.
///
/// ## Parameters:
/// - **bytes**: interleaved PCM16 samples
/// - **sample_rate**: rate the remote declared for this payload
/// - **channel_count**: number of interleaved channels
///
/// ## De-interleaving:
/// Sample `i` goes to channel `i % channel_count`, so a stereo payload
/// `L0 R0 L1 R1` becomes `[[L0, L1], [R0, R1]]`.
pub fn pcm16_to_float_frame(
    bytes: &[u8],
    sample_rate: u32,
    channel_count: u16,
) -> Result<PlaybackBuffer, DecodeError> {
    if channel_count == 0 {
        return Err(DecodeError::NoChannels);
    }

    let frame_bytes = 2 * channel_count as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(DecodeError::Misaligned {
            len: bytes.len(),
            channels: channel_count,
        });
    }

    let frame_count = bytes.len() / frame_bytes;
    let mut channels = vec![Vec::with_capacity(frame_count); channel_count as usize];

    let mut cursor = Cursor::new(bytes);
    let mut index = 0usize;
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        channels[index % channel_count as usize].push(sample as f32 / PCM16_SCALE);
        index += 1;
    }

    Ok(PlaybackBuffer::new(sample_rate, channels))
}

/// Serialize one captured frame into a transport chunk.
pub fn encode_frame(frame: &AudioFrame) -> EncodedChunk {
    EncodedChunk {
        data: encode_binary_to_text(&float_frame_to_pcm16(&frame.samples)),
        mime_type: pcm_mime_type(frame.sample_rate),
    }
}

/// Decode a base64 PCM payload straight into a playback buffer.
pub fn decode_chunk(
    data: &str,
    sample_rate: u32,
    channel_count: u16,
) -> Result<PlaybackBuffer, DecodeError> {
    let bytes = decode_text_to_binary(data)?;
    pcm16_to_float_frame(&bytes, sample_rate, channel_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_known_values() {
        assert_eq!(encode_binary_to_text(&[72, 101, 108, 108, 111]), "SGVsbG8=");
        assert_eq!(
            decode_text_to_binary("SGVsbG8=").unwrap(),
            vec![72, 101, 108, 108, 111]
        );
    }

    #[test]
    fn test_base64_empty_input() {
        assert_eq!(encode_binary_to_text(&[]), "");
        assert!(decode_text_to_binary("").unwrap().is_empty());
    }

    #[test]
    fn test_base64_round_trip_and_padding() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        for len in [1usize, 2, 3, 4, 5, 255, 256] {
            let text = encode_binary_to_text(&bytes[..len]);
            assert_eq!(text.len() % 4, 0);
            assert_eq!(text.len(), 4 * ((len + 2) / 3));
            assert_eq!(decode_text_to_binary(&text).unwrap(), &bytes[..len]);
        }
    }

    #[test]
    fn test_base64_rejects_malformed_text() {
        assert!(matches!(decode_text_to_binary("SGVsbG8"), Err(DecodeError::Base64(_))));
        assert!(matches!(decode_text_to_binary("SGV$bG8="), Err(DecodeError::Base64(_))));
    }

    #[test]
    fn test_pcm_scale_law() {
        let original = [0.5f32, -0.5, 1.0];
        let bytes = float_frame_to_pcm16(&original);
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[0..2], &16384i16.to_le_bytes());
        assert_eq!(&bytes[2..4], &(-16384i16).to_le_bytes());
        assert_eq!(&bytes[4..6], &32767i16.to_le_bytes());

        let buffer = pcm16_to_float_frame(&bytes, INPUT_SAMPLE_RATE, 1).unwrap();
        for (decoded, expected) in buffer.channels[0].iter().zip(original.iter()) {
            assert!((decoded - expected).abs() <= 1.0 / 32768.0, "{} vs {}", decoded, expected);
        }
    }

    #[test]
    fn test_out_of_range_samples_saturate() {
        let bytes = float_frame_to_pcm16(&[2.0, -3.0]);
        assert_eq!(&bytes[0..2], &i16::MAX.to_le_bytes());
        assert_eq!(&bytes[2..4], &i16::MIN.to_le_bytes());
    }

    #[test]
    fn test_stereo_deinterleave() {
        let mut bytes = Vec::new();
        for sample in [100i16, -100, 200, -200] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        let buffer = pcm16_to_float_frame(&bytes, OUTPUT_SAMPLE_RATE, 2).unwrap();
        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.frame_count(), 2);
        assert_eq!(buffer.channels[0], vec![100.0 / 32768.0, 200.0 / 32768.0]);
        assert_eq!(buffer.channels[1], vec![-100.0 / 32768.0, -200.0 / 32768.0]);
    }

    #[test]
    fn test_misaligned_pcm_is_rejected() {
        assert!(matches!(
            pcm16_to_float_frame(&[0u8; 3], OUTPUT_SAMPLE_RATE, 1),
            Err(DecodeError::Misaligned { len: 3, channels: 1 })
        ));
        assert!(matches!(
            pcm16_to_float_frame(&[0u8; 6], OUTPUT_SAMPLE_RATE, 2),
            Err(DecodeError::Misaligned { .. })
        ));
        assert!(matches!(
            pcm16_to_float_frame(&[0u8; 4], OUTPUT_SAMPLE_RATE, 0),
            Err(DecodeError::NoChannels)
        ));
    }

    #[test]
    fn test_encode_frame_shape() {
        let frame = AudioFrame::new(vec![0.0; 4096], INPUT_SAMPLE_RATE);
        let chunk = encode_frame(&frame);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert_eq!(decode_text_to_binary(&chunk.data).unwrap().len(), 8192);

        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["mimeType"], "audio/pcm;rate=16000");
        assert!(json.get("data").is_some());
    }

    #[test]
    fn test_parse_pcm_rate() {
        assert_eq!(parse_pcm_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(parse_pcm_rate("audio/PCM; rate=16000"), Some(16000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=0"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=abc"), None);
        assert_eq!(parse_pcm_rate("image/png;rate=5"), None);
        assert!(is_pcm_mime("audio/pcm;rate=24000"));
        assert!(!is_pcm_mime("image/png"));
    }
}
