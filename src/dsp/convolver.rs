//! Convolution reverb and impulse responses.
//!
//! Impulse responses are decoded from Ogg Vorbis assets with `lewton`. Until
//! an asset is loaded a short synthetic tail is used instead. Long responses
//! are applied with partitioned FFT convolution (`rustfft`).

use std::io::Cursor;
use std::sync::Arc;

use lewton::inside_ogg::OggStreamReader;
use log::debug;
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;
use rustfft::{Fft, FftPlanner};

use crate::error::SettingsError;

/// Longest impulse response applied, in frames
pub const MAX_IMPULSE_FRAMES: usize = 4096;

/// Stereo impulse response at the graph sample rate
#[derive(Debug, Clone, PartialEq)]
pub struct ImpulseResponse {
    left: Vec<f32>,
    right: Vec<f32>,
}

impl ImpulseResponse {
    /// Build from per-channel samples; mono input is used for both channels
    pub fn from_channels(left: Vec<f32>, right: Option<Vec<f32>>) -> Self {
        let right = right.unwrap_or_else(|| left.clone());
        let mut ir = Self { left, right };
        ir.left.truncate(MAX_IMPULSE_FRAMES);
        ir.right.truncate(MAX_IMPULSE_FRAMES);
        ir.normalize();
        ir
    }

    /// Decaying noise tail
    pub fn synthetic(sample_rate: u32) -> Self {
        let frames = sample_rate as usize * 80 / 1000;
        let mut seed: u32 = 0x2545_f491;
        let mut noise = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed as f32 / u32::MAX as f32) * 2.0 - 1.0
        };
        let decay = -6.9 / frames as f32;
        let mut left = Vec::with_capacity(frames);
        let mut right = Vec::with_capacity(frames);
        for i in 0..frames {
            let env = (decay * i as f32).exp();
            left.push(noise() * env);
            right.push(noise() * env);
        }
        Self::from_channels(left, Some(right))
    }

    /// Decode an Ogg Vorbis impulse response, resampling to `sample_rate`
    pub fn from_ogg_vorbis(data: &[u8], sample_rate: u32) -> Result<Self, SettingsError> {
        let mut reader = OggStreamReader::new(Cursor::new(data))
            .map_err(|e| SettingsError::ImpulseDecode(e.to_string()))?;

        let channels = reader.ident_hdr.audio_channels.max(1) as usize;
        let source_rate = reader.ident_hdr.audio_sample_rate;
        let mut per_channel: Vec<Vec<f32>> = vec![Vec::new(); channels];

        while let Some(packet) = reader
            .read_dec_packet_itl()
            .map_err(|e| SettingsError::ImpulseDecode(e.to_string()))?
        {
            for frame in packet.chunks_exact(channels) {
                for (ch, &s) in frame.iter().enumerate() {
                    per_channel[ch].push(s as f32 / 32768.0);
                }
            }
        }

        if per_channel[0].is_empty() {
            return Err(SettingsError::ImpulseDecode("impulse response is empty".to_string()));
        }

        let mut resampled = per_channel
            .into_iter()
            .take(2)
            .map(|ch| resample_linear(&ch, source_rate, sample_rate));
        let left = resampled.next().unwrap_or_default();
        let right = resampled.next();
        debug!(
            "[Convolver] Loaded impulse response: {} channel(s), {} Hz, {} frames",
            channels,
            source_rate,
            left.len()
        );
        Ok(Self::from_channels(left, right))
    }

    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    /// Scale so the response carries unit energy per channel
    fn normalize(&mut self) {
        let power: f32 = self
            .left
            .iter()
            .chain(self.right.iter())
            .map(|s| s * s)
            .sum::<f32>()
            / 2.0;
        if power > f32::EPSILON {
            let scale = 1.0 / power.sqrt();
            self.left.iter_mut().chain(self.right.iter_mut()).for_each(|s| *s *= scale);
        }
    }
}

fn resample_linear(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from as f64 / to as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = input[idx];
            let b = input.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

/// Frames per partition; the head of the response is applied directly
const BLOCK: usize = 128;
const FFT_SIZE: usize = BLOCK * 2;

/// One channel of the partitioned convolver.
///
/// The first `BLOCK` taps run as a direct FIR so there is no added latency.
/// The rest of the response is split into `BLOCK` sized partitions applied
/// by uniform overlap-save in the frequency domain. The one block delay of
/// the FFT path lines up with the partitions starting `BLOCK` taps in.
#[derive(Clone)]
struct ChannelConvolver {
    head: Vec<f32>,
    history: Vec<f32>,
    pos: usize,
    /// Spectra of the tail partitions
    partitions: Vec<Vec<Complex<f32>>>,
    /// Spectra of past input frames, newest at `newest`
    spectra: Vec<Vec<Complex<f32>>>,
    newest: usize,
    /// Previous block then the block being filled
    input: Vec<f32>,
    /// Tail contribution for the block being filled
    tail_out: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl ChannelConvolver {
    fn new(taps: &[f32], forward: &dyn Fft<f32>) -> Self {
        let head = taps[..taps.len().min(BLOCK)].to_vec();
        let partitions: Vec<Vec<Complex<f32>>> = taps
            .get(BLOCK..)
            .unwrap_or(&[])
            .chunks(BLOCK)
            .map(|part| {
                let mut spectrum = vec![Complex::zero(); FFT_SIZE];
                for (bin, &tap) in spectrum.iter_mut().zip(part) {
                    *bin = Complex::new(tap, 0.0);
                }
                forward.process(&mut spectrum);
                spectrum
            })
            .collect();
        let spectra = vec![vec![Complex::zero(); FFT_SIZE]; partitions.len()];

        Self {
            head,
            history: vec![0.0; BLOCK],
            pos: 0,
            partitions,
            spectra,
            newest: 0,
            input: vec![0.0; FFT_SIZE],
            tail_out: vec![0.0; BLOCK],
            scratch: vec![Complex::zero(); FFT_SIZE],
        }
    }

    fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.input.iter_mut().for_each(|s| *s = 0.0);
        self.tail_out.iter_mut().for_each(|s| *s = 0.0);
        for spectrum in &mut self.spectra {
            spectrum.iter_mut().for_each(|bin| *bin = Complex::zero());
        }
        self.pos = 0;
        self.newest = 0;
    }

    /// Filter one sample at offset `fill` of the current block
    #[inline]
    fn process(&mut self, x: f32, fill: usize) -> f32 {
        self.history[self.pos] = x;
        let mut acc = 0.0;
        let mut idx = self.pos;
        for &tap in &self.head {
            acc += tap * self.history[idx];
            idx = if idx == 0 { BLOCK - 1 } else { idx - 1 };
        }
        self.pos = (self.pos + 1) % BLOCK;

        self.input[BLOCK + fill] = x;
        acc + self.tail_out[fill]
    }

    /// A block is complete: compute the tail for the next one
    fn flush(&mut self, forward: &dyn Fft<f32>, inverse: &dyn Fft<f32>) {
        let count = self.partitions.len();
        if count == 0 {
            return;
        }

        self.newest = (self.newest + 1) % count;
        let frame = &mut self.spectra[self.newest];
        for (bin, &s) in frame.iter_mut().zip(&self.input) {
            *bin = Complex::new(s, 0.0);
        }
        forward.process(frame);

        self.scratch.iter_mut().for_each(|bin| *bin = Complex::zero());
        for (k, partition) in self.partitions.iter().enumerate() {
            let frame = &self.spectra[(self.newest + count - k) % count];
            for ((acc, x), h) in self.scratch.iter_mut().zip(frame).zip(partition) {
                *acc += x * h;
            }
        }
        inverse.process(&mut self.scratch);

        let scale = 1.0 / FFT_SIZE as f32;
        for (out, bin) in self.tail_out.iter_mut().zip(&self.scratch[BLOCK..]) {
            *out = bin.re * scale;
        }
        self.input.copy_within(BLOCK.., 0);
    }
}

/// Zero-latency stereo convolver
#[derive(Clone)]
pub struct Convolver {
    impulse: ImpulseResponse,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    left: ChannelConvolver,
    right: ChannelConvolver,
    fill: usize,
}

impl std::fmt::Debug for Convolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Convolver")
            .field("frames", &self.impulse.len())
            .field("partitions", &self.left.partitions.len())
            .finish()
    }
}

impl Convolver {
    pub fn new(impulse: ImpulseResponse) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(FFT_SIZE);
        let inverse = planner.plan_fft_inverse(FFT_SIZE);
        let left = ChannelConvolver::new(&impulse.left, forward.as_ref());
        let right = ChannelConvolver::new(&impulse.right, forward.as_ref());
        Self {
            impulse,
            forward,
            inverse,
            left,
            right,
            fill: 0,
        }
    }

    /// Swap in a new impulse response, clearing the tail
    pub fn set_impulse(&mut self, impulse: ImpulseResponse) {
        *self = Self::new(impulse);
    }

    pub fn impulse(&self) -> &ImpulseResponse {
        &self.impulse
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
        self.fill = 0;
    }

    /// Convolve an interleaved stereo buffer in place
    pub fn process_stereo(&mut self, buffer: &mut [f32]) {
        if self.impulse.is_empty() {
            return;
        }
        for frame in buffer.chunks_exact_mut(2) {
            frame[0] = self.left.process(frame[0], self.fill);
            frame[1] = self.right.process(frame[1], self.fill);

            self.fill += 1;
            if self.fill == BLOCK {
                self.left.flush(self.forward.as_ref(), self.inverse.as_ref());
                self.right.flush(self.forward.as_ref(), self.inverse.as_ref());
                self.fill = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_impulse_passes_signal() {
        let mut conv = Convolver::new(ImpulseResponse::from_channels(vec![1.0], None));
        let mut buf = [0.5, -0.5, 0.25, 0.125];
        conv.process_stereo(&mut buf);
        assert_eq!(buf, [0.5, -0.5, 0.25, 0.125]);
    }

    #[test]
    fn test_delayed_impulse_delays_signal() {
        let mut conv = Convolver::new(ImpulseResponse::from_channels(vec![0.0, 1.0], None));
        let mut buf = [1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        conv.process_stereo(&mut buf);
        assert_eq!(buf, [0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    fn direct_convolution(taps: &[f32], input: &[f32]) -> Vec<f32> {
        (0..input.len())
            .map(|n| {
                taps.iter()
                    .enumerate()
                    .take(n + 1)
                    .map(|(k, h)| h * input[n - k])
                    .sum()
            })
            .collect()
    }

    #[test]
    fn test_long_impulse_matches_direct_convolution() {
        let ir = ImpulseResponse::synthetic(12000);
        assert!(ir.len() > BLOCK * 3);
        let mut conv = Convolver::new(ir.clone());

        let frames = BLOCK * 5 + 37;
        let left: Vec<f32> = (0..frames).map(|i| ((i * 7919) % 97) as f32 / 97.0 - 0.5).collect();
        let right: Vec<f32> = (0..frames).map(|i| if i % 50 == 0 { 1.0 } else { 0.0 }).collect();
        let mut buf: Vec<f32> = left.iter().zip(&right).flat_map(|(l, r)| [*l, *r]).collect();

        // Uneven chunk sizes cross block boundaries mid-buffer
        for chunk in buf.chunks_mut(2 * 45) {
            conv.process_stereo(chunk);
        }

        let want_l = direct_convolution(&ir.left, &left);
        let want_r = direct_convolution(&ir.right, &right);
        for (i, frame) in buf.chunks_exact(2).enumerate() {
            assert!((frame[0] - want_l[i]).abs() < 1e-3, "left frame {}: {} vs {}", i, frame[0], want_l[i]);
            assert!((frame[1] - want_r[i]).abs() < 1e-3, "right frame {}: {} vs {}", i, frame[1], want_r[i]);
        }
    }

    #[test]
    fn test_reset_clears_tail() {
        let mut conv = Convolver::new(ImpulseResponse::synthetic(12000));
        let mut impulse = vec![0.0; BLOCK * 4];
        impulse[0] = 1.0;
        impulse[1] = 1.0;
        conv.process_stereo(&mut impulse);
        conv.reset();

        let mut silence = vec![0.0; BLOCK * 4];
        conv.process_stereo(&mut silence);
        assert!(silence.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_synthetic_impulse() {
        let ir = ImpulseResponse::synthetic(48000);
        assert_eq!(ir.len(), 3840);
        let ir_again = ImpulseResponse::synthetic(48000);
        assert_eq!(ir, ir_again);
    }

    #[test]
    fn test_long_impulse_truncated() {
        let ir = ImpulseResponse::from_channels(vec![0.01; MAX_IMPULSE_FRAMES * 2], None);
        assert_eq!(ir.len(), MAX_IMPULSE_FRAMES);
    }

    #[test]
    fn test_invalid_ogg_rejected() {
        assert!(matches!(
            ImpulseResponse::from_ogg_vorbis(b"not an ogg file", 48000),
            Err(SettingsError::ImpulseDecode(_))
        ));
    }

    #[test]
    fn test_resample_halves_length() {
        let out = resample_linear(&[0.0, 1.0, 2.0, 3.0], 96000, 48000);
        assert_eq!(out, vec![0.0, 2.0]);
    }
}
