//! Streaming short-time Fourier transform and its overlap-add inverse.
//!
//! Both directions keep at most one window of samples buffered, so memory
//! stays bounded by the window size no matter how long the stream runs.

use rustfft::{Fft, FftPlanner, num_complex::Complex};
use std::{f32::consts::PI, sync::Arc};

use crate::config::Profile;
use crate::error::{Error, Result};

/// Floor applied before converting magnitudes to decibels, about -120 dB.
const MIN_MAGNITUDE: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    /// Periodic Hann. Windows overlapped by half sum to exactly one, which
    /// makes forward + inverse an identity away from the stream edges.
    Hann,
    Hamming,
}

impl WindowType {
    pub fn coefficients(self, window_size: usize) -> Vec<f32> {
        match self {
            WindowType::Hann => (0..window_size)
                .map(|n| 0.5 * (1.0 - (2.0 * PI * n as f32 / window_size as f32).cos()))
                .collect(),
            WindowType::Hamming => hamming_window(window_size),
        }
    }
}

pub fn hamming_window(window_size: usize) -> Vec<f32> {
    let mut window = Vec::with_capacity(window_size);
    for n in 0..window_size {
        // 0.54 - 0.46 * cos(2 * pi * n / (N - 1))
        let value = 2.0 * PI * (n as f32) / (window_size as f32 - 1.0);
        window.push(0.54 - 0.46 * value.cos());
    }
    window
}

/// How the forward transform scales the bins of a spectral frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumScale {
    Magnitude,
    Power,
    Decibel,
}

impl SpectrumScale {
    fn apply(self, bin: Complex<f32>) -> f32 {
        match self {
            SpectrumScale::Magnitude => bin.norm(),
            SpectrumScale::Power => bin.norm_sqr(),
            SpectrumScale::Decibel => 20.0 * bin.norm().max(MIN_MAGNITUDE).log10(),
        }
    }
}

/// One hop's spectrum: `window_size / 2` bins.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralFrame {
    pub index: usize,
    pub bins: Vec<f32>,
}

/// One hop's unscaled transform in packed half-complex layout:
/// `[re(0), re(N/2), re(1), im(1), ..., re(N/2-1), im(N/2-1)]`, `N` values.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub index: usize,
    pub coefficients: Vec<f32>,
}

/// Forward transform: samples in, one frame out per hop.
pub struct Stft {
    window_size: usize,
    hop_size: usize,
    scale: SpectrumScale,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    next_index: usize,
}

impl Stft {
    pub fn new(
        window_size: usize,
        hop_size: usize,
        window_type: WindowType,
        scale: SpectrumScale,
    ) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(window_size);

        Self {
            window_size,
            hop_size,
            scale,
            window: window_type.coefficients(window_size),
            fft,
            buffer: Vec::with_capacity(window_size + hop_size),
            spectrum: vec![Complex::new(0.0, 0.0); window_size],
            next_index: 0,
        }
    }

    pub fn from_profile(profile: &Profile) -> Self {
        Self::new(
            profile.window_size,
            profile.hop_size,
            profile.window_type,
            profile.spectrum_scale,
        )
    }

    /// Appends samples to the input buffer. Drain the available frames
    /// between pushes to keep the buffer at one window.
    pub fn push(&mut self, samples: &[f32]) {
        self.buffer.extend_from_slice(samples);
    }

    pub fn frames_emitted(&self) -> usize {
        self.next_index
    }

    /// Samples buffered but not yet consumed by a hop.
    pub fn pending_samples(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_frame(&mut self) -> Option<SpectralFrame> {
        let index = self.transform_next()?;
        let bins = self.spectrum[..self.window_size / 2]
            .iter()
            .map(|&bin| self.scale.apply(bin))
            .collect();

        Some(SpectralFrame { index, bins })
    }

    pub fn next_raw_frame(&mut self) -> Option<RawFrame> {
        let index = self.transform_next()?;
        let half = self.window_size / 2;

        let mut coefficients = Vec::with_capacity(self.window_size);
        coefficients.push(self.spectrum[0].re);
        coefficients.push(self.spectrum[half].re);
        for bin in &self.spectrum[1..half] {
            coefficients.push(bin.re);
            coefficients.push(bin.im);
        }

        Some(RawFrame {
            index,
            coefficients,
        })
    }

    fn transform_next(&mut self) -> Option<usize> {
        if self.buffer.len() < self.window_size {
            return None;
        }

        for (slot, (sample, coeff)) in self
            .spectrum
            .iter_mut()
            .zip(self.buffer.iter().zip(self.window.iter()))
        {
            *slot = Complex::new(sample * coeff, 0.0);
        }
        self.fft.process(&mut self.spectrum);
        self.buffer.drain(..self.hop_size);

        let index = self.next_index;
        self.next_index += 1;
        Some(index)
    }
}

/// Inverse transform with overlap-add. Each written frame releases the
/// `hop_size` samples no later frame can contribute to.
pub struct InverseStft {
    window_size: usize,
    hop_size: usize,
    ifft: Arc<dyn Fft<f32>>,
    spectrum: Vec<Complex<f32>>,
    overlap: Vec<f32>,
}

impl InverseStft {
    pub fn new(window_size: usize, hop_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let ifft = planner.plan_fft_inverse(window_size);

        Self {
            window_size,
            hop_size,
            ifft,
            spectrum: vec![Complex::new(0.0, 0.0); window_size],
            overlap: vec![0.0; window_size],
        }
    }

    pub fn from_profile(profile: &Profile) -> Self {
        Self::new(profile.window_size, profile.hop_size)
    }

    /// Takes one packed frame as produced by [`Stft::next_raw_frame`].
    pub fn write_frame(&mut self, coefficients: &[f32]) -> Result<Vec<f32>> {
        if coefficients.len() != self.window_size {
            return Err(Error::InvalidFrame {
                expected: self.window_size,
                actual: coefficients.len(),
            });
        }

        let n = self.window_size;
        let half = n / 2;
        self.spectrum[0] = Complex::new(coefficients[0], 0.0);
        self.spectrum[half] = Complex::new(coefficients[1], 0.0);
        for k in 1..half {
            let bin = Complex::new(coefficients[2 * k], coefficients[2 * k + 1]);
            self.spectrum[k] = bin;
            self.spectrum[n - k] = bin.conj();
        }
        self.ifft.process(&mut self.spectrum);

        let norm = 1.0 / n as f32;
        for (acc, bin) in self.overlap.iter_mut().zip(self.spectrum.iter()) {
            *acc += bin.re * norm;
        }

        let output = self.overlap[..self.hop_size].to_vec();
        self.overlap.copy_within(self.hop_size.., 0);
        let tail = self.window_size - self.hop_size;
        self.overlap[tail..].fill(0.0);

        Ok(output)
    }

    /// Releases the overlap tail once no further frames will arrive.
    pub fn flush(&mut self) -> Vec<f32> {
        let tail = self.window_size - self.hop_size;
        let output = self.overlap[..tail].to_vec();
        self.overlap.fill(0.0);
        output
    }
}
