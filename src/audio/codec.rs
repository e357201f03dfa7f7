//! # G.711 µ-law Codec
//!
//! Converts between the 8-bit companded samples of the telephony path and
//! 16-bit linear PCM. The arithmetic follows the ITU-T G.711 reference (STL)
//! bit for bit, with one exception at the code-point level:
//!
//! ## Negative zero
//! µ-law has two codes for silence, `0xFF` (+0) and `0x7F` (-0). The
//! reference expands both to `0`, which makes `0x7F` impossible to get back.
//! Here `0x7F` expands to `-1`, the smallest negative sample, which the
//! compressor maps back to `0x7F`. Every one of the 256 code points therefore
//! survives `encode(decode(b))` unchanged.
//!
//! Both directions are pure functions over byte slices and are safe to call
//! from any number of calls at once.

use crate::audio::frame::{AudioFrame, Encoding, TELEPHONY_SAMPLE_RATE};
use crate::error::AudioError;
use byteorder::{ByteOrder, LittleEndian};

/// Bias added to the magnitude before segment search (33 in 14-bit units).
const ULAW_BIAS: i32 = 33;

/// Largest biased magnitude representable in 13 bits.
const ULAW_MAX: i32 = 0x1FFF;

/// The "negative zero" code.
const ULAW_NEGATIVE_ZERO: u8 = 0x7F;

static ULAW_DECODE_TABLE: [i16; 256] = build_decode_table();

const fn expand_code(code: u8) -> i16 {
    if code == ULAW_NEGATIVE_ZERO {
        return -1;
    }

    let inverted = !code;
    let exponent = ((inverted >> 4) & 0x07) as i32;
    let mantissa = (inverted & 0x0F) as i32;
    let step = 4 << (exponent + 1);
    let magnitude = (0x80 << exponent) + step * mantissa + step / 2 - 4 * ULAW_BIAS;

    if code < 0x80 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut code = 0;
    while code < 256 {
        table[code] = expand_code(code as u8);
        code += 1;
    }
    table
}

/// Expand one µ-law code to a linear sample.
#[inline]
pub fn ulaw_expand(code: u8) -> i16 {
    ULAW_DECODE_TABLE[code as usize]
}

/// Compress one linear sample to a µ-law code.
pub fn ulaw_compress(sample: i16) -> u8 {
    // One's complement for negatives keeps -1 in the lowest segment
    let magnitude = if sample < 0 {
        (((!sample) as u16) >> 2) as i32
    } else {
        (sample >> 2) as i32
    };
    let biased = (magnitude + ULAW_BIAS).min(ULAW_MAX);

    let mut segment = 1;
    let mut rest = biased >> 6;
    while rest != 0 {
        segment += 1;
        rest >>= 1;
    }

    let high_nibble = 0x08 - segment;
    let low_nibble = 0x0F - ((biased >> segment) & 0x0F);
    let mut code = (high_nibble << 4) | low_nibble;
    if sample >= 0 {
        code |= 0x80;
    }
    code as u8
}

/// Expand a companded telephony frame to linear PCM at the same rate.
///
/// ## Errors:
/// `AudioError::Decode` when the frame is not a `Companded8` frame at 8 kHz.
/// Every byte value is a legal code point, so content never fails.
pub fn decode_companded(frame: &AudioFrame) -> Result<AudioFrame, AudioError> {
    if frame.encoding() != Encoding::Companded8 {
        return Err(AudioError::decode(format!(
            "expected {} input, got {}",
            Encoding::Companded8,
            frame.encoding()
        )));
    }
    if frame.sample_rate() != TELEPHONY_SAMPLE_RATE {
        return Err(AudioError::decode(format!(
            "companded audio must be {}Hz, got {}Hz",
            TELEPHONY_SAMPLE_RATE,
            frame.sample_rate()
        )));
    }

    let codes = frame.as_bytes();
    let mut pcm = vec![0u8; codes.len() * 2];
    for (code, out) in codes.iter().zip(pcm.chunks_exact_mut(2)) {
        LittleEndian::write_i16(out, ulaw_expand(*code));
    }

    Ok(AudioFrame::linear(pcm, frame.sample_rate()))
}

/// Compress an 8 kHz linear PCM frame to µ-law.
///
/// ## Errors:
/// `AudioError::Encode` for non-PCM input, a rate other than 8 kHz, or an odd
/// byte length. Input is never truncated to make it fit.
pub fn encode_linear(frame: &AudioFrame) -> Result<AudioFrame, AudioError> {
    if frame.encoding() != Encoding::LinearPcm16 {
        return Err(AudioError::encode(format!(
            "expected {} input, got {}",
            Encoding::LinearPcm16,
            frame.encoding()
        )));
    }
    if !frame.is_aligned() {
        return Err(AudioError::encode(format!(
            "PCM data length must be even, got {} bytes",
            frame.len_bytes()
        )));
    }
    if frame.sample_rate() != TELEPHONY_SAMPLE_RATE {
        return Err(AudioError::encode(format!(
            "µ-law output requires {}Hz input, got {}Hz",
            TELEPHONY_SAMPLE_RATE,
            frame.sample_rate()
        )));
    }

    let codes = frame
        .as_bytes()
        .chunks_exact(2)
        .map(|pair| ulaw_compress(LittleEndian::read_i16(pair)))
        .collect();

    Ok(AudioFrame::companded(codes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_code_point_round_trips() {
        for code in 0..=255u8 {
            let sample = ulaw_expand(code);
            assert_eq!(ulaw_compress(sample), code, "code {:#04x} -> {}", code, sample);
        }
    }

    #[test]
    fn test_reference_values() {
        assert_eq!(ulaw_expand(0xFF), 0);
        assert_eq!(ulaw_expand(0x7F), -1);
        assert_eq!(ulaw_expand(0x80), 32124);
        assert_eq!(ulaw_expand(0x00), -32124);
        assert_eq!(ulaw_compress(0), 0xFF);
        assert_eq!(ulaw_compress(i16::MAX), 0x80);
        assert_eq!(ulaw_compress(i16::MIN), 0x00);
    }

    #[test]
    fn test_frame_round_trip() {
        let codes: Vec<u8> = (0..=255u8).collect();
        let decoded = decode_companded(&AudioFrame::companded(codes.clone())).unwrap();
        assert_eq!(decoded.encoding(), Encoding::LinearPcm16);
        assert_eq!(decoded.len_bytes(), 512);

        let encoded = encode_linear(&decoded).unwrap();
        assert_eq!(encoded.as_bytes(), codes.as_slice());
    }

    #[test]
    fn test_decode_rejects_linear_input() {
        let odd = AudioFrame::linear(vec![0; 15], TELEPHONY_SAMPLE_RATE);
        assert!(matches!(decode_companded(&odd), Err(AudioError::Decode { .. })));
    }

    #[test]
    fn test_encode_rejects_bad_input() {
        let odd = AudioFrame::linear(vec![0; 15], TELEPHONY_SAMPLE_RATE);
        assert!(matches!(encode_linear(&odd), Err(AudioError::Encode { .. })));

        let wideband = AudioFrame::linear(vec![0; 16], 16000);
        assert!(matches!(encode_linear(&wideband), Err(AudioError::Encode { .. })));

        let companded = AudioFrame::companded(vec![0xFF; 8]);
        assert!(matches!(encode_linear(&companded), Err(AudioError::Encode { .. })));
    }

    #[test]
    fn test_compression_is_monotonic_in_magnitude() {
        // Louder positive samples never map to a quieter segment
        let mut previous = ulaw_expand(ulaw_compress(0));
        for sample in (0..=i16::MAX).step_by(97) {
            let quantized = ulaw_expand(ulaw_compress(sample));
            assert!(quantized >= previous);
            previous = quantized;
        }
    }
}
