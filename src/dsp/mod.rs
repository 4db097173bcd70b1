//! Signal processing blocks used by the per-peer audio graph.

pub mod biquad;
pub mod convolver;
pub mod gain;
pub mod panner;

pub use biquad::Biquad;
pub use convolver::{Convolver, ImpulseResponse};
pub use gain::GainRamp;
pub use panner::{EqualPowerPanner, Position};
