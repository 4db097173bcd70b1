//! Gain utilities and click-free gain changes.

/// Apply gain to a buffer of samples in-place.
#[inline]
pub fn apply_gain(buffer: &mut [f32], gain_linear: f32) {
    for sample in buffer.iter_mut() {
        *sample *= gain_linear;
    }
}

/// Calculate peak level from buffer.
pub fn peak_level(buffer: &[f32]) -> f32 {
    buffer.iter().fold(0.0f32, |max, &s| max.max(s.abs()))
}

/// Gain stage that moves linearly to a new target over a fixed ramp
/// instead of jumping, so parameter changes between ticks do not click.
#[derive(Clone, Debug)]
pub struct GainRamp {
    current: f32,
    target: f32,
    step: f32,
    ramp_frames: u32,
    remaining: u32,
}

impl GainRamp {
    /// # Arguments
    /// * `initial` - Starting gain
    /// * `ramp_ms` - Ramp duration in milliseconds
    /// * `sample_rate` - Audio sample rate
    pub fn new(initial: f32, ramp_ms: f32, sample_rate: u32) -> Self {
        let ramp_frames = ((ramp_ms / 1000.0) * sample_rate as f32).round().max(1.0) as u32;
        Self {
            current: initial,
            target: initial,
            step: 0.0,
            ramp_frames,
            remaining: 0,
        }
    }

    /// Gain the ramp is heading to
    pub fn target(&self) -> f32 {
        self.target
    }

    /// Gain applied to the next frame
    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn set_target(&mut self, target: f32) {
        if target == self.target {
            return;
        }
        self.target = target;
        self.remaining = self.ramp_frames;
        self.step = (target - self.current) / self.ramp_frames as f32;
    }

    /// Jump straight to a gain without ramping
    pub fn set_immediate(&mut self, gain: f32) {
        self.current = gain;
        self.target = gain;
        self.remaining = 0;
        self.step = 0.0;
    }

    #[inline]
    fn next_gain(&mut self) -> f32 {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.current = if self.remaining == 0 {
                self.target
            } else {
                self.current + self.step
            };
        }
        self.current
    }

    /// Apply the ramped gain to an interleaved stereo buffer in place.
    pub fn process_stereo(&mut self, buffer: &mut [f32]) {
        if self.remaining == 0 {
            apply_gain(buffer, self.current);
            return;
        }
        for frame in buffer.chunks_exact_mut(2) {
            let g = self.next_gain();
            frame[0] *= g;
            frame[1] *= g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_gain_and_peak() {
        let mut buf = [0.5, -1.0, 0.25];
        apply_gain(&mut buf, 0.5);
        assert_eq!(buf, [0.25, -0.5, 0.125]);
        assert_eq!(peak_level(&buf), 0.5);
    }

    #[test]
    fn test_ramp_reaches_target_after_ramp_time() {
        // 10ms at 48kHz = 480 frames
        let mut ramp = GainRamp::new(0.0, 10.0, 48000);
        ramp.set_target(1.0);

        let mut buf = vec![1.0f32; 480 * 2];
        ramp.process_stereo(&mut buf);
        assert!(buf[0] > 0.0 && buf[0] < 0.01);
        assert!(buf[479 * 2] == 1.0);
        assert!(buf.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(ramp.current(), 1.0);
    }

    #[test]
    fn test_immediate_gain() {
        let mut ramp = GainRamp::new(1.0, 10.0, 48000);
        ramp.set_immediate(0.0);
        let mut buf = [1.0f32; 4];
        ramp.process_stereo(&mut buf);
        assert_eq!(buf, [0.0; 4]);
        assert_eq!(ramp.target(), 0.0);
    }
}
