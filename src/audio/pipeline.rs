//! # Transcoding Pipelines
//!
//! The two fixed compositions of codec and resampler used by every call:
//!
//! - **Ingress** (telephony → AI endpoint): µ-law @ 8 kHz → PCM16 @ 8 kHz →
//!   PCM16 @ 16 kHz
//! - **Egress** (AI endpoint → telephony): PCM16 @ 24 kHz → PCM16 @ 8 kHz →
//!   µ-law @ 8 kHz
//!
//! Both are synchronous and allocation-only; the orchestrator calls them
//! inline on its async tasks.

use crate::audio::codec::{decode_companded, encode_linear};
use crate::audio::frame::{
    AudioFrame, ENDPOINT_INPUT_SAMPLE_RATE, ENDPOINT_OUTPUT_SAMPLE_RATE, TELEPHONY_SAMPLE_RATE,
};
use crate::audio::resample::resample;
use crate::error::AudioError;
use tracing::debug;

/// 20 ms of µ-law audio at 8 kHz
pub const DEFAULT_CHUNK_BYTES: usize = 160;

/// Telephony µ-law frame to endpoint input PCM.
pub fn ingress(frame: &AudioFrame) -> Result<AudioFrame, AudioError> {
    let linear = decode_companded(frame)?;
    let wideband = resample(&linear, ENDPOINT_INPUT_SAMPLE_RATE)?;

    debug!(
        companded_bytes = frame.len_bytes(),
        pcm_bytes = wideband.len_bytes(),
        "ingress frame transcoded"
    );
    Ok(wideband)
}

/// Endpoint output PCM to telephony µ-law.
///
/// The input must be PCM16 at the endpoint output rate; anything else is a
/// corrupted stream.
pub fn egress(frame: &AudioFrame) -> Result<AudioFrame, AudioError> {
    if frame.sample_rate() != ENDPOINT_OUTPUT_SAMPLE_RATE {
        return Err(AudioError::resample(format!(
            "endpoint output must be {}Hz, got {}Hz",
            ENDPOINT_OUTPUT_SAMPLE_RATE,
            frame.sample_rate()
        )));
    }

    let narrowband = resample(frame, TELEPHONY_SAMPLE_RATE)?;
    let companded = encode_linear(&narrowband)?;

    debug!(
        pcm_bytes = frame.len_bytes(),
        companded_bytes = companded.len_bytes(),
        "egress frame transcoded"
    );
    Ok(companded)
}

/// Split a buffer into fixed-size chunks. The last chunk may be shorter.
///
/// A `chunk_bytes` of zero returns the whole buffer as one chunk.
pub fn chunk_audio(data: &[u8], chunk_bytes: usize) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }
    if chunk_bytes == 0 {
        return vec![data.to_vec()];
    }
    data.chunks(chunk_bytes).map(<[u8]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::ulaw_expand;
    use crate::audio::frame::Encoding;

    #[test]
    fn test_ingress_telephony_chunk() {
        // 20 ms of µ-law: 160 B -> 320 B PCM @8k -> 640 B PCM @16k
        let frame = AudioFrame::companded(vec![0xFF; 160]);
        let out = ingress(&frame).unwrap();

        assert_eq!(out.encoding(), Encoding::LinearPcm16);
        assert_eq!(out.sample_rate(), ENDPOINT_INPUT_SAMPLE_RATE);
        assert_eq!(out.len_bytes(), 640);
        assert!(out.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_egress_endpoint_chunk() {
        // 20 ms of PCM @24k: 960 B -> 320 B PCM @8k -> 160 B µ-law
        let frame = AudioFrame::linear(vec![0; 960], ENDPOINT_OUTPUT_SAMPLE_RATE);
        let out = egress(&frame).unwrap();

        assert_eq!(out.encoding(), Encoding::Companded8);
        assert_eq!(out.sample_rate(), TELEPHONY_SAMPLE_RATE);
        assert_eq!(out.len_bytes(), 160);
        assert!(out.as_bytes().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_egress_preserves_signal_level() {
        // A constant tone survives both resampling and companding
        let mut pcm = Vec::new();
        for _ in 0..480 {
            pcm.extend_from_slice(&ulaw_expand(0xA0).to_le_bytes());
        }
        let out = egress(&AudioFrame::linear(pcm, ENDPOINT_OUTPUT_SAMPLE_RATE)).unwrap();
        assert!(out.as_bytes().iter().all(|&b| b == 0xA0));
    }

    #[test]
    fn test_egress_rejects_wrong_rate_and_odd_length() {
        let wrong_rate = AudioFrame::linear(vec![0; 320], ENDPOINT_INPUT_SAMPLE_RATE);
        assert!(egress(&wrong_rate).is_err());

        let odd = AudioFrame::linear(vec![0; 961], ENDPOINT_OUTPUT_SAMPLE_RATE);
        assert!(matches!(egress(&odd), Err(AudioError::Resample { .. })));
    }

    #[test]
    fn test_chunk_audio() {
        let chunks = chunk_audio(&[1u8; 400], DEFAULT_CHUNK_BYTES);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 160);
        assert_eq!(chunks[2].len(), 80);

        assert!(chunk_audio(&[], DEFAULT_CHUNK_BYTES).is_empty());
        assert_eq!(chunk_audio(&[1, 2, 3], 0), vec![vec![1, 2, 3]]);
    }
}
