use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;

use crate::features::FeatureFrame;

const PREEMPH_COEFF: f32 = 0.97;
const LOW_FREQ: f32 = 20.0;
const WINDOW_POWER: f32 = 0.85;

/// Turns waveform samples into fixed-size feature frames.
///
/// Implementations must frame with snip edges: `1 + (n - frame_length) /
/// frame_shift` frames for `n >= frame_length` samples, none otherwise. The
/// pipeline relies on this to carry the unconsumed tail over to the next call.
pub trait FeatureExtractor: Send {
    fn dim(&self) -> usize;

    fn compute(&mut self, wave: &[f32]) -> Vec<FeatureFrame>;
}

/// Kaldi-compatible log mel filterbank.
pub struct Fbank {
    num_bins: usize,
    frame_length: usize,
    frame_shift: usize,
    window: Vec<f32>,
    mel_banks: Vec<MelBank>,
    fft: Arc<dyn RealToComplex<f32>>,
    fft_input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    power: Vec<f32>,
}

/// Triangular filter stored as a dense run of weights starting at `offset`.
struct MelBank {
    offset: usize,
    weights: Vec<f32>,
}

impl Fbank {
    pub fn new(num_bins: usize, sample_rate: u32, frame_length: usize, frame_shift: usize) -> Self {
        let padded_length = frame_length.next_power_of_two();
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(padded_length);
        let fft_input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();

        Self {
            num_bins,
            frame_length,
            frame_shift,
            window: povey_window(frame_length),
            mel_banks: mel_banks(num_bins, sample_rate as f32, padded_length),
            fft,
            fft_input,
            spectrum,
            power: vec![0.0; padded_length / 2 + 1],
        }
    }

    pub fn num_frames(&self, num_samples: usize) -> usize {
        if num_samples < self.frame_length {
            0
        } else {
            1 + (num_samples - self.frame_length) / self.frame_shift
        }
    }

    fn compute_frame(&mut self, samples: &[f32]) -> FeatureFrame {
        let frame = &mut self.fft_input[..self.frame_length];
        frame.copy_from_slice(samples);

        let mean = frame.iter().sum::<f32>() / frame.len() as f32;
        frame.iter_mut().for_each(|s| *s -= mean);

        for i in (1..frame.len()).rev() {
            frame[i] -= PREEMPH_COEFF * frame[i - 1];
        }
        frame[0] -= PREEMPH_COEFF * frame[0];

        for (s, w) in frame.iter_mut().zip(&self.window) {
            *s *= w;
        }
        self.fft_input[self.frame_length..].fill(0.0);

        // Buffer lengths come from the planner, so process cannot fail.
        if self
            .fft
            .process(&mut self.fft_input, &mut self.spectrum)
            .is_err()
        {
            return vec![f32::EPSILON.ln(); self.num_bins];
        }
        for (p, c) in self.power.iter_mut().zip(&self.spectrum) {
            *p = c.norm_sqr();
        }

        self.mel_banks
            .iter()
            .map(|bank| {
                let energy: f32 = bank
                    .weights
                    .iter()
                    .zip(&self.power[bank.offset..])
                    .map(|(w, p)| w * p)
                    .sum();
                energy.max(f32::EPSILON).ln()
            })
            .collect()
    }
}

impl FeatureExtractor for Fbank {
    fn dim(&self) -> usize {
        self.num_bins
    }

    fn compute(&mut self, wave: &[f32]) -> Vec<FeatureFrame> {
        let num_frames = self.num_frames(wave.len());
        let mut feats = Vec::with_capacity(num_frames);
        for i in 0..num_frames {
            let start = i * self.frame_shift;
            feats.push(self.compute_frame(&wave[start..start + self.frame_length]));
        }
        feats
    }
}

fn povey_window(length: usize) -> Vec<f32> {
    let denom = length.saturating_sub(1).max(1) as f32;
    (0..length)
        .map(|i| {
            let hann = 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / denom).cos();
            hann.powf(WINDOW_POWER)
        })
        .collect()
}

fn mel_scale(freq: f32) -> f32 {
    1127.0 * (1.0 + freq / 700.0).ln()
}

fn mel_banks(num_bins: usize, sample_rate: f32, padded_length: usize) -> Vec<MelBank> {
    let num_fft_bins = padded_length / 2;
    let nyquist = 0.5 * sample_rate;
    let fft_bin_width = sample_rate / padded_length as f32;

    let mel_low = mel_scale(LOW_FREQ);
    let mel_high = mel_scale(nyquist);
    let mel_delta = (mel_high - mel_low) / (num_bins + 1) as f32;

    (0..num_bins)
        .map(|bin| {
            let left = mel_low + bin as f32 * mel_delta;
            let center = left + mel_delta;
            let right = center + mel_delta;

            let mut offset = None;
            let mut weights = Vec::new();
            for i in 0..num_fft_bins {
                let mel = mel_scale(fft_bin_width * i as f32);
                if mel > left && mel < right {
                    let weight = if mel <= center {
                        (mel - left) / (center - left)
                    } else {
                        (right - mel) / (right - center)
                    };
                    offset.get_or_insert(i);
                    weights.push(weight);
                }
            }
            MelBank {
                offset: offset.unwrap_or(0),
                weights,
            }
        })
        .collect()
}
