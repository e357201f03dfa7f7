//! # Sample Rate Conversion
//!
//! Linear-interpolation resampler for mono 16-bit PCM.
//!
//! ## Algorithm:
//! 1. Output length is `round(n * target / source)` samples
//! 2. Output sample `i` sits at source position `i * source / target`
//! 3. The value is interpolated between the sample at `floor(pos)` and the
//!    next one, then clamped to the `i16` range
//! 4. When the next sample would lie past the end of the input, the last
//!    source sample is copied unchanged
//!
//! Positions are computed with integer arithmetic, so 8k→16k and 24k→8k land
//! exactly on the source grid with no floating point drift.

use crate::audio::frame::{AudioFrame, Encoding};
use crate::error::AudioError;
use byteorder::{ByteOrder, LittleEndian};

/// Number of output samples for `input_samples` converted from `source_rate`
/// to `target_rate`, rounded half up.
pub fn output_sample_count(input_samples: usize, source_rate: u32, target_rate: u32) -> usize {
    if source_rate == 0 {
        return 0;
    }
    let numerator = input_samples as u128 * target_rate as u128 * 2 + source_rate as u128;
    (numerator / (source_rate as u128 * 2)) as usize
}

/// Resample raw `i16` samples. Rates must be non-zero.
pub fn resample_samples(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate {
        return samples.to_vec();
    }

    let target_len = output_sample_count(samples.len(), source_rate, target_rate);
    let mut output = Vec::with_capacity(target_len);
    let source = source_rate as u64;
    let target = target_rate as u64;

    for i in 0..target_len as u64 {
        let scaled = i * source;
        let index = (scaled / target) as usize;

        if index + 1 < samples.len() {
            let fraction = (scaled % target) as f64 / target as f64;
            let first = samples[index] as f64;
            let second = samples[index + 1] as f64;
            // Truncate toward zero after interpolating
            let value = (first + (second - first) * fraction) as i64;
            output.push(value.clamp(i16::MIN as i64, i16::MAX as i64) as i16);
        } else if let Some(&last) = samples.last() {
            output.push(last);
        }
    }

    output
}

/// Convert a linear PCM frame to `target_rate`.
///
/// Equal rates return the input byte for byte without an interpolation pass.
///
/// ## Errors:
/// `AudioError::Resample` for non-PCM input, an odd byte length, or a zero
/// source/target rate.
pub fn resample(frame: &AudioFrame, target_rate: u32) -> Result<AudioFrame, AudioError> {
    if frame.encoding() != Encoding::LinearPcm16 {
        return Err(AudioError::resample(format!(
            "only {} can be resampled, got {}",
            Encoding::LinearPcm16,
            frame.encoding()
        )));
    }
    if !frame.is_aligned() {
        return Err(AudioError::resample(format!(
            "misaligned sample buffer: {} bytes is not a multiple of 2",
            frame.len_bytes()
        )));
    }
    if frame.sample_rate() == 0 || target_rate == 0 {
        return Err(AudioError::resample(format!(
            "sample rates must be positive (source {}Hz, target {}Hz)",
            frame.sample_rate(),
            target_rate
        )));
    }

    if frame.sample_rate() == target_rate {
        return Ok(frame.clone());
    }

    let mut samples = vec![0i16; frame.sample_count()];
    LittleEndian::read_i16_into(frame.as_bytes(), &mut samples);

    let converted = resample_samples(&samples, frame.sample_rate(), target_rate);
    let mut bytes = vec![0u8; converted.len() * 2];
    LittleEndian::write_i16_into(&converted, &mut bytes);

    Ok(AudioFrame::linear(bytes, target_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16], rate: u32) -> AudioFrame {
        let mut bytes = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut bytes);
        AudioFrame::linear(bytes, rate)
    }

    fn samples_of(frame: &AudioFrame) -> Vec<i16> {
        let mut out = vec![0i16; frame.sample_count()];
        LittleEndian::read_i16_into(frame.as_bytes(), &mut out);
        out
    }

    #[test]
    fn test_equal_rates_are_identity() {
        let frame = pcm(&[1, -2, 300, i16::MIN, i16::MAX], 16000);
        let out = resample(&frame, 16000).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn test_output_length_follows_rounding_rule() {
        let cases = [
            (160, 8000, 16000, 320),
            (480, 24000, 8000, 160),
            (7, 24000, 8000, 2),  // 2.33 rounds down
            (5, 24000, 8000, 2),  // 1.67 rounds up
            (3, 16000, 24000, 5), // 4.5 rounds half up
            (0, 8000, 16000, 0),
        ];
        for (input, source, target, expected) in cases {
            let frame = pcm(&vec![0; input], source);
            let out = resample(&frame, target).unwrap();
            assert_eq!(out.sample_count(), expected, "{} samples {}->{}", input, source, target);
        }
    }

    #[test]
    fn test_upsampling_interpolates_midpoints() {
        let out = resample(&pcm(&[0, 100, -100], 8000), 16000).unwrap();
        // Last two outputs reference past the end and copy the last sample
        assert_eq!(samples_of(&out), vec![0, 50, 100, 0, -100, -100]);
    }

    #[test]
    fn test_downsampling_picks_grid_samples() {
        let input: Vec<i16> = (0..9).map(|s| s * 10).collect();
        let out = resample(&pcm(&input, 24000), 8000).unwrap();
        assert_eq!(samples_of(&out), vec![0, 30, 60]);
    }

    #[test]
    fn test_extremes_stay_in_range() {
        let out = resample(&pcm(&[i16::MIN, i16::MAX, i16::MIN], 8000), 16000).unwrap();
        let samples = samples_of(&out);
        assert_eq!(samples[0], i16::MIN);
        assert_eq!(samples[2], i16::MAX);
    }

    #[test]
    fn test_rejects_odd_length_without_truncating() {
        let frame = AudioFrame::linear(vec![0; 961], 24000);
        assert!(matches!(resample(&frame, 8000), Err(AudioError::Resample { .. })));
        // Even the identity path validates first
        assert!(matches!(resample(&frame, 24000), Err(AudioError::Resample { .. })));
    }

    #[test]
    fn test_rejects_zero_rates() {
        assert!(resample(&pcm(&[1, 2], 0), 8000).is_err());
        assert!(resample(&pcm(&[1, 2], 8000), 0).is_err());
    }

    #[test]
    fn test_rejects_companded_input() {
        let frame = AudioFrame::companded(vec![0xFF; 4]);
        assert!(matches!(resample(&frame, 16000), Err(AudioError::Resample { .. })));
    }
}
