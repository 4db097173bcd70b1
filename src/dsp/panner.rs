//! Equal-power stereo panner with linear distance attenuation.
//!
//! The listener sits at the origin facing -z with +y up. Sources are placed
//! relative to it; azimuth and distance gain follow the WebAudio
//! `PannerNode` "equalpower" and "linear" models so remote voices sit where
//! players used to hear them.

use std::f32::consts::FRAC_PI_2;

/// Source position relative to the listener
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Mono to stereo panner
#[derive(Debug, Clone)]
pub struct EqualPowerPanner {
    position: Position,
    ref_distance: f32,
    max_distance: f32,
    rolloff: f32,
    gain_l: f32,
    gain_r: f32,
}

impl EqualPowerPanner {
    pub fn new(ref_distance: f32, max_distance: f32, rolloff: f32) -> Self {
        let mut panner = Self {
            position: Position::default(),
            ref_distance,
            max_distance,
            rolloff,
            gain_l: 0.0,
            gain_r: 0.0,
        };
        panner.update_gains();
        panner
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn set_position(&mut self, position: Position) {
        if position != self.position {
            self.position = position;
            self.update_gains();
        }
    }

    pub fn max_distance(&self) -> f32 {
        self.max_distance
    }

    pub fn set_max_distance(&mut self, max_distance: f32) {
        if max_distance != self.max_distance {
            self.max_distance = max_distance;
            self.update_gains();
        }
    }

    /// Left/right gains for the current position
    pub fn gains(&self) -> (f32, f32) {
        (self.gain_l, self.gain_r)
    }

    /// Azimuth in degrees, 0 = straight ahead, positive to the right
    fn azimuth(&self) -> f32 {
        let len = self.position.length();
        if len == 0.0 {
            return 0.0;
        }
        let (x, z) = (self.position.x / len, self.position.z / len);

        // Project onto the horizontal plane (remove the up component)
        let plen = (x * x + z * z).sqrt();
        if plen == 0.0 {
            return 0.0;
        }
        let (px, pz) = (x / plen, z / plen);

        let mut azimuth = px.clamp(-1.0, 1.0).acos().to_degrees();
        // Behind the listener
        if -pz < 0.0 {
            azimuth = 360.0 - azimuth;
        }
        // Relative to forward instead of right
        if (0.0..=270.0).contains(&azimuth) {
            azimuth = 90.0 - azimuth;
        } else {
            azimuth = 450.0 - azimuth;
        }
        azimuth
    }

    fn distance_gain(&self) -> f32 {
        let span = self.max_distance - self.ref_distance;
        if span <= 0.0 {
            return 1.0;
        }
        let d = self.position.length().clamp(self.ref_distance, self.max_distance);
        (1.0 - self.rolloff * (d - self.ref_distance) / span).max(0.0)
    }

    fn update_gains(&mut self) {
        let mut azimuth = self.azimuth().clamp(-180.0, 180.0);
        // Fold rear positions onto the front half
        if azimuth < -90.0 {
            azimuth = -180.0 - azimuth;
        } else if azimuth > 90.0 {
            azimuth = 180.0 - azimuth;
        }
        let x = (azimuth + 90.0) / 180.0;
        let distance = self.distance_gain();
        self.gain_l = (x * FRAC_PI_2).cos() * distance;
        self.gain_r = (x * FRAC_PI_2).sin() * distance;
    }

    /// Pan a mono block into an interleaved stereo buffer.
    /// `output` must hold twice as many samples as `input`.
    pub fn process(&self, input: &[f32], output: &mut [f32]) {
        for (sample, frame) in input.iter().zip(output.chunks_exact_mut(2)) {
            frame[0] = sample * self.gain_l;
            frame[1] = sample * self.gain_r;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panner() -> EqualPowerPanner {
        EqualPowerPanner::new(0.1, 5.32, 1.0)
    }

    #[test]
    fn test_centered_source_is_balanced() {
        let mut p = panner();
        p.set_position(Position::new(0.0, 0.0, -0.5));
        let (l, r) = p.gains();
        assert!((l - r).abs() < 1e-6);
    }

    #[test]
    fn test_source_on_the_right() {
        let mut p = panner();
        p.set_position(Position::new(1.0, 0.0, -0.5));
        let (l, r) = p.gains();
        assert!(r > l);

        p.set_position(Position::new(-1.0, 0.0, -0.5));
        let (l, r) = p.gains();
        assert!(l > r);
    }

    #[test]
    fn test_linear_rolloff_reaches_zero_at_max_distance() {
        let mut p = panner();
        p.set_position(Position::new(10.0, 0.0, -0.5));
        assert_eq!(p.gains(), (0.0, 0.0));

        p.set_max_distance(20.0);
        let (l, r) = p.gains();
        assert!(l + r > 0.0);
    }

    #[test]
    fn test_equal_power() {
        let mut p = EqualPowerPanner::new(0.1, 1000.0, 0.0);
        for x in [-3.0, -0.5, 0.0, 0.7, 4.0] {
            p.set_position(Position::new(x, 1.0, -0.5));
            let (l, r) = p.gains();
            assert!((l * l + r * r - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_process_writes_stereo() {
        let mut p = panner();
        p.set_position(Position::new(0.0, 0.0, -0.5));
        let input = [1.0f32; 4];
        let mut out = [0.0f32; 8];
        p.process(&input, &mut out);
        assert!(out.iter().all(|&s| s > 0.0));
        assert_eq!(out[0], out[1]);
    }
}
