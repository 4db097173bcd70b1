//! Two-pole filter behind the muffle insert (transposed direct form II).

use std::f32::consts::PI;

/// Stereo biquad with independent state for left and right.
#[derive(Clone, Debug)]
pub struct Biquad {
    // Divided through by a0
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    // Delay line, one slot per channel
    z1: [f32; 2],
    z2: [f32; 2],
}

impl Biquad {
    /// Create a lowpass filter with resonance given in dB, the way
    /// WebAudio's `BiquadFilterNode` interprets `Q` for lowpass filters.
    ///
    /// # Arguments
    /// * `freq` - Cutoff frequency in Hz
    /// * `q_db` - Resonance peak in dB
    /// * `sample_rate` - Sample rate in Hz
    pub fn lowpass_resonant(freq: f32, q_db: f32, sample_rate: f32) -> Self {
        let mut filter = Self::from_coefficients(1.0, 0.0, 0.0, 0.0, 0.0);
        filter.set_lowpass_resonant(freq, q_db, sample_rate);
        filter
    }

    /// Retune as a resonant lowpass, keeping the filter state
    pub fn set_lowpass_resonant(&mut self, freq: f32, q_db: f32, sample_rate: f32) {
        let nyquist = sample_rate / 2.0;
        let freq = freq.clamp(1.0, nyquist * 0.999);
        let omega = 2.0 * PI * freq / sample_rate;
        let cos_omega = omega.cos();
        let sin_omega = omega.sin();
        let alpha = sin_omega / (2.0 * 10.0f32.powf(q_db / 20.0));

        let b0 = (1.0 - cos_omega) / 2.0;
        let b1 = 1.0 - cos_omega;
        let b2 = (1.0 - cos_omega) / 2.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
    }

    /// Build from coefficients already divided by a0
    pub fn from_coefficients(b0: f32, b1: f32, b2: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0,
            b1,
            b2,
            a1,
            a2,
            z1: [0.0; 2],
            z2: [0.0; 2],
        }
    }

    /// Filter one sample on channel 0 (left) or 1 (right)
    #[inline]
    pub fn process(&mut self, input: f32, channel: usize) -> f32 {
        let output = self.b0 * input + self.z1[channel];
        self.z1[channel] = self.b1 * input - self.a1 * output + self.z2[channel];
        self.z2[channel] = self.b2 * input - self.a2 * output;
        output
    }

    /// Process an interleaved stereo buffer in place.
    pub fn process_stereo(&mut self, buffer: &mut [f32]) {
        for frame in buffer.chunks_exact_mut(2) {
            frame[0] = self.process(frame[0], 0);
            frame[1] = self.process(frame[1], 1);
        }
    }

    /// Clear the delay line
    pub fn reset(&mut self) {
        self.z1 = [0.0; 2];
        self.z2 = [0.0; 2];
    }
}
