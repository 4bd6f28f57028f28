//! Short-time Fourier and constant-Q transforms.

use std::f32::consts::PI;
use std::sync::Arc;

use ndarray::Array2;
use rayon::prelude::*;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use super::{PipelineError, Result, SpectralStage};

/// Periodic Hann window.
pub fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / size as f32).cos()))
        .collect()
}

/// Number of centred frames for a signal of `len` samples.
pub fn frame_count(len: usize, hop_length: usize) -> usize {
    1 + len / hop_length
}

/// Copy the `size`-sample window centred on `center` into `out`, zero-padding
/// outside the signal.
fn centered_frame(samples: &[f32], center: usize, size: usize, out: &mut [Complex32]) {
    let half = size / 2;
    for (i, slot) in out.iter_mut().enumerate().take(size) {
        let idx = (center + i).checked_sub(half);
        let value = idx.and_then(|j| samples.get(j)).copied().unwrap_or(0.0);
        *slot = Complex32::new(value, 0.0);
    }
}

/// Centred STFT with a Hann window, shape (n_fft / 2 + 1, 1 + len / hop).
pub fn stft(samples: &[f32], n_fft: usize, hop_length: usize) -> Array2<Complex32> {
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n_fft);
    let window = hann_window(n_fft);
    let n_frames = frame_count(samples.len(), hop_length);
    let n_bins = n_fft / 2 + 1;

    let mut spec = Array2::<Complex32>::zeros((n_bins, n_frames));
    let mut frame = vec![Complex32::new(0.0, 0.0); n_fft];
    for t in 0..n_frames {
        centered_frame(samples, t * hop_length, n_fft, &mut frame);
        for (x, w) in frame.iter_mut().zip(&window) {
            *x *= *w;
        }
        fft.process(&mut frame);
        for (f, value) in frame[..n_bins].iter().enumerate() {
            spec[[f, t]] = *value;
        }
    }
    spec
}

/// Inverse of [`stft`] by weighted overlap-add, trimmed to `length` samples.
pub fn istft(spec: &Array2<Complex32>, n_fft: usize, hop_length: usize, length: usize) -> Vec<f32> {
    let mut planner = FftPlanner::new();
    let ifft = planner.plan_fft_inverse(n_fft);
    let window = hann_window(n_fft);
    let half = n_fft / 2;
    let n_frames = spec.ncols();

    let padded_len = (n_frames.saturating_sub(1)) * hop_length + n_fft;
    let mut out = vec![0.0f32; padded_len];
    let mut norm = vec![0.0f32; padded_len];
    let mut frame = vec![Complex32::new(0.0, 0.0); n_fft];

    for t in 0..n_frames {
        for (f, value) in spec.column(t).iter().enumerate() {
            frame[f] = *value;
        }
        // rebuild the negative frequencies from conjugate symmetry
        for f in 1..half {
            frame[n_fft - f] = frame[f].conj();
        }
        ifft.process(&mut frame);

        let start = t * hop_length;
        for i in 0..n_fft {
            out[start + i] += frame[i].re / n_fft as f32 * window[i];
            norm[start + i] += window[i] * window[i];
        }
    }

    (0..length)
        .map(|i| {
            let j = i + half;
            match (out.get(j), norm.get(j)) {
                (Some(&y), Some(&w)) if w > 1e-8 => y / w,
                _ => 0.0,
            }
        })
        .collect()
}

/// Constant-Q transform parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CqtParams {
    pub sample_rate: u32,
    pub hop_length: usize,
    pub min_freq: f64,
    pub bins_per_octave: usize,
    pub n_bins: usize,
}

impl CqtParams {
    /// Centre frequency of bin `k`.
    pub fn frequency(&self, k: usize) -> f64 {
        self.min_freq * 2f64.powf(k as f64 / self.bins_per_octave as f64)
    }

    /// Quality factor shared by all bins.
    pub fn q(&self) -> f64 {
        1.0 / (2f64.powf(1.0 / self.bins_per_octave as f64) - 1.0)
    }

    /// Kernel length in samples for bin `k`.
    pub fn kernel_length(&self, k: usize) -> usize {
        (self.q() * self.sample_rate as f64 / self.frequency(k)).ceil() as usize
    }
}

/// Spectral kernel entries below this fraction of the kernel peak are dropped.
const SPARSITY_THRESHOLD: f32 = 0.0054;

/// Non-zero spectral kernel coefficients for one CQT bin.
#[derive(Debug, Clone)]
struct SparseKernel {
    indices: Vec<usize>,
    weights: Vec<Complex32>,
}

/// Constant-Q magnitude spectrogram using precomputed spectral kernels.
pub struct ConstantQ {
    params: CqtParams,
    fft_len: usize,
    fft: Arc<dyn Fft<f32>>,
    kernels: Vec<SparseKernel>,
}

impl ConstantQ {
    pub fn new(params: CqtParams) -> Result<Self> {
        if params.sample_rate == 0 || params.hop_length == 0 || params.n_bins == 0 {
            return Err(PipelineError::Shape(
                "constant-Q needs a positive sample rate, hop and bin count".into(),
            ));
        }
        if params.bins_per_octave == 0 || params.min_freq.is_nan() || params.min_freq <= 0.0 {
            return Err(PipelineError::Shape(format!(
                "invalid constant-Q frequency grid: min_freq={} bins_per_octave={}",
                params.min_freq, params.bins_per_octave
            )));
        }
        let nyquist = params.sample_rate as f64 / 2.0;
        let top = params.frequency(params.n_bins - 1);
        if top >= nyquist {
            return Err(PipelineError::Shape(format!(
                "highest constant-Q bin {:.1} Hz is above Nyquist ({:.1} Hz)",
                top, nyquist
            )));
        }

        let fft_len = params.kernel_length(0).next_power_of_two();
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_len);
        let q = params.q() as f32;

        let kernels = (0..params.n_bins)
            .map(|k| {
                let len = params.kernel_length(k).min(fft_len);
                let window = hann_window(len);
                let offset = (fft_len - len) / 2;
                let mut buf = vec![Complex32::new(0.0, 0.0); fft_len];
                for (n, w) in window.iter().enumerate() {
                    let phase = 2.0 * PI * q * n as f32 / len as f32;
                    buf[offset + n] = Complex32::from_polar(w / len as f32, phase);
                }
                fft.process(&mut buf);

                let peak = buf.iter().map(|c| c.norm()).fold(0.0f32, f32::max);
                let cutoff = peak * SPARSITY_THRESHOLD;
                let (indices, weights): (Vec<usize>, Vec<Complex32>) = buf
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.norm() > cutoff)
                    .map(|(i, c)| (i, c.conj() / fft_len as f32))
                    .unzip();
                SparseKernel { indices, weights }
            })
            .collect();

        log::debug!(
            "Constant-Q: {} bins from {:.1} Hz, fft length {}",
            params.n_bins,
            params.min_freq,
            fft_len
        );

        Ok(Self {
            params,
            fft_len,
            fft,
            kernels,
        })
    }

    pub fn params(&self) -> &CqtParams {
        &self.params
    }

    pub fn fft_len(&self) -> usize {
        self.fft_len
    }
}

impl SpectralStage for ConstantQ {
    fn transform(&self, samples: &[f32]) -> Result<Array2<f32>> {
        if samples.is_empty() {
            return Err(PipelineError::Shape("no samples to transform".into()));
        }
        let n_frames = frame_count(samples.len(), self.params.hop_length);

        let columns: Vec<Vec<f32>> = (0..n_frames)
            .into_par_iter()
            .map(|t| {
                let mut frame = vec![Complex32::new(0.0, 0.0); self.fft_len];
                centered_frame(samples, t * self.params.hop_length, self.fft_len, &mut frame);
                self.fft.process(&mut frame);
                self.kernels
                    .iter()
                    .map(|kernel| {
                        kernel
                            .indices
                            .iter()
                            .zip(&kernel.weights)
                            .map(|(&i, &w)| frame[i] * w)
                            .sum::<Complex32>()
                            .norm()
                    })
                    .collect()
            })
            .collect();

        let mut spectrum = Array2::<f32>::zeros((self.params.n_bins, n_frames));
        for (t, column) in columns.into_iter().enumerate() {
            for (k, value) in column.into_iter().enumerate() {
                spectrum[[k, t]] = value;
            }
        }
        Ok(spectrum)
    }
}
