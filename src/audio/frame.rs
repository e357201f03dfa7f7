//! # Audio Frames
//!
//! Typed wrappers around the raw byte buffers that travel through the relay.
//! A frame carries its encoding and sample rate, so every transform can refuse
//! input that does not match what it expects instead of silently producing
//! noise.
//!
//! ## Formats in this system:
//! - **Telephony**: µ-law (`Companded8`), 8 kHz, mono
//! - **AI endpoint input**: `LinearPcm16`, 16 kHz, mono, little-endian
//! - **AI endpoint output**: `LinearPcm16`, 24 kHz, mono, little-endian

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample rate of the telephony media path
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// Sample rate the AI voice endpoint expects on its input
pub const ENDPOINT_INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate the AI voice endpoint produces on its output
pub const ENDPOINT_OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Sample encoding of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// G.711 µ-law, one byte per sample
    Companded8,
    /// Signed 16-bit little-endian linear PCM, two bytes per sample
    LinearPcm16,
}

impl Encoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Encoding::Companded8 => 1,
            Encoding::LinearPcm16 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Companded8 => "companded8",
            Encoding::LinearPcm16 => "linear_pcm16",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk of mono audio.
///
/// Frames are immutable once built: the codec and resampler always produce a
/// new frame. Construction does not validate alignment; the transforms do,
/// each with its own error variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    encoding: Encoding,
    sample_rate: u32,
    data: Vec<u8>,
}

impl AudioFrame {
    /// µ-law bytes from the telephony side. Always 8 kHz.
    pub fn companded(data: Vec<u8>) -> Self {
        Self {
            encoding: Encoding::Companded8,
            sample_rate: TELEPHONY_SAMPLE_RATE,
            data,
        }
    }

    /// Little-endian signed 16-bit samples at `sample_rate`.
    pub fn linear(data: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            encoding: Encoding::LinearPcm16,
            sample_rate,
            data,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when the byte length is a whole number of samples.
    ///
    /// A `LinearPcm16` frame with an odd byte count is corrupt.
    pub fn is_aligned(&self) -> bool {
        self.data.len() % self.encoding.bytes_per_sample() == 0
    }

    /// Number of whole samples in the frame.
    pub fn sample_count(&self) -> usize {
        self.data.len() / self.encoding.bytes_per_sample()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_geometry() {
        let frame = AudioFrame::companded(vec![0xFF; 160]);
        assert_eq!(frame.sample_count(), 160);
        assert_eq!(frame.sample_rate(), TELEPHONY_SAMPLE_RATE);

        let frame = AudioFrame::linear(vec![0; 960], ENDPOINT_OUTPUT_SAMPLE_RATE);
        assert_eq!(frame.sample_count(), 480);
        assert!(frame.is_aligned());
    }

    #[test]
    fn test_odd_linear_frame_is_misaligned() {
        let frame = AudioFrame::linear(vec![0; 15], ENDPOINT_INPUT_SAMPLE_RATE);
        assert!(!frame.is_aligned());
        // Companded frames are always aligned
        assert!(AudioFrame::companded(vec![0; 15]).is_aligned());
    }
}
