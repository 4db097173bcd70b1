//! Opus codec support for voice tracks.
//!
//! Remote tracks are decoded to 48kHz mono f32 PCM; the local microphone is
//! encoded the same way before it is written to the shared outgoing track.

use opus::{Application, Channels, Decoder, Encoder};
use thiserror::Error;

use crate::config::{FRAME_MS, SAMPLE_RATE};

/// Largest Opus packet we expect for one voice frame
const MAX_ENCODED_FRAME_SIZE: usize = 1275;

/// Longest frame a remote peer may send (120ms at 48kHz)
const MAX_DECODED_FRAME: usize = 5760;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to create Opus {kind}: {message}")]
    Create { kind: &'static str, message: String },

    #[error("Expected {expected} samples, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Opus encode error: {0}")]
    Encode(String),

    #[error("Opus decode error: {0}")]
    Decode(String),
}

/// Audio format parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u8,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u8) -> Self {
        Self { sample_rate, channels }
    }

    /// Voice format: 48kHz mono
    pub fn voice() -> Self {
        Self::new(SAMPLE_RATE, 1)
    }

    /// Samples per millisecond (per channel)
    pub fn samples_per_ms(&self) -> usize {
        (self.sample_rate as usize) / 1000
    }

    /// Samples per channel per frame for given duration
    pub fn samples_per_channel(&self, duration_ms: usize) -> usize {
        self.samples_per_ms() * duration_ms
    }

    /// Total samples per frame for given duration (samples * channels)
    pub fn total_samples_per_frame(&self, duration_ms: usize) -> usize {
        self.samples_per_channel(duration_ms) * self.channels as usize
    }

    fn opus_channels(&self) -> Channels {
        if self.channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::voice()
    }
}

/// Opus encoder for the local microphone
pub struct VoiceEncoder {
    encoder: Encoder,
    frame_samples: usize,
    output: Vec<u8>,
}

impl VoiceEncoder {
    pub fn new(format: AudioFormat) -> Result<Self, CodecError> {
        let encoder = Encoder::new(format.sample_rate, format.opus_channels(), Application::Voip)
            .map_err(|e| CodecError::Create {
                kind: "encoder",
                message: e.to_string(),
            })?;

        Ok(Self {
            encoder,
            frame_samples: format.total_samples_per_frame(FRAME_MS),
            output: vec![0u8; MAX_ENCODED_FRAME_SIZE],
        })
    }

    /// Samples expected by [`VoiceEncoder::encode`]
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Encode exactly one frame of audio
    pub fn encode(&mut self, samples: &[f32]) -> Result<&[u8], CodecError> {
        if samples.len() != self.frame_samples {
            return Err(CodecError::FrameSize {
                expected: self.frame_samples,
                actual: samples.len(),
            });
        }

        let len = self
            .encoder
            .encode_float(samples, &mut self.output)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(&self.output[..len])
    }
}

/// Opus decoder for one remote track
pub struct VoiceDecoder {
    decoder: Decoder,
    channels: usize,
    output: Vec<f32>,
}

impl VoiceDecoder {
    pub fn new(format: AudioFormat) -> Result<Self, CodecError> {
        let decoder = Decoder::new(format.sample_rate, format.opus_channels()).map_err(|e| {
            CodecError::Create {
                kind: "decoder",
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            decoder,
            channels: format.channels as usize,
            output: vec![0f32; MAX_DECODED_FRAME * format.channels as usize],
        })
    }

    /// Decode one packet; an empty packet runs packet loss concealment
    pub fn decode(&mut self, packet: &[u8]) -> Result<&[f32], CodecError> {
        let samples_per_channel = self
            .decoder
            .decode_float(packet, &mut self.output, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(&self.output[..samples_per_channel * self.channels])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frame(format: AudioFormat) -> Vec<f32> {
        (0..format.total_samples_per_frame(FRAME_MS))
            .map(|i| {
                let t = i as f32 / format.sample_rate as f32;
                (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5
            })
            .collect()
    }

    #[test]
    fn test_voice_format() {
        let format = AudioFormat::voice();
        assert_eq!(format.samples_per_channel(FRAME_MS), 960);
        assert_eq!(AudioFormat::new(48000, 2).total_samples_per_frame(FRAME_MS), 1920);
    }

    #[test]
    fn test_encoder_rejects_wrong_frame_size() {
        let mut encoder = VoiceEncoder::new(AudioFormat::voice()).unwrap();
        assert!(matches!(
            encoder.encode(&[0.0; 100]),
            Err(CodecError::FrameSize { expected: 960, actual: 100 })
        ));
    }

    #[test]
    fn test_encode_decode_voice_frame() {
        let format = AudioFormat::voice();
        let mut encoder = VoiceEncoder::new(format).unwrap();
        let mut decoder = VoiceDecoder::new(format).unwrap();

        let packet = encoder.encode(&sine_frame(format)).unwrap().to_vec();
        assert!(!packet.is_empty());

        let decoded = decoder.decode(&packet).unwrap();
        assert_eq!(decoded.len(), 960);
    }
}
