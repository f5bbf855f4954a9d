use std::{fmt, sync::Arc};

use crate::error::{Error, Result};
use crate::stft::{SpectrumScale, WindowType};

// Audio Processing Parameters
pub const SAMPLING_RATE: u32 = 11025;
pub const WINDOW_SIZE: usize = 512;
pub const HOP_SIZE: usize = 256;

// Residual Spectrum Parameters
pub const TEMPORAL_SMOOTHING_COEFFICIENT: f32 = 0.05;
pub const SPECTRUM_SMOOTHING_LENGTH: usize = 0;

// Peak Finding Parameters
pub const PEAKS_PER_FRAME: usize = 3;

// Hashing Parameters
pub const PEAK_FANOUT: usize = 5;
pub const TARGET_ZONE_DISTANCE: usize = 2;
pub const TARGET_ZONE_LENGTH: usize = 30;
pub const TARGET_ZONE_WIDTH: usize = 63;

// Matching Parameters
pub const MATCHING_MIN_FRAMES: usize = 10;
pub const MATCHING_MAX_SECONDS: f64 = 30.0;
pub const THRESHOLD_BASE: f64 = 0.5;
pub const THRESHOLD_WIDTH_SCALE: f64 = 2.0;
pub const THRESHOLD_ACCEPT_HEIGHT: f64 = 0.3;
pub const THRESHOLD_REJECT_HEIGHT: f64 = THRESHOLD_ACCEPT_HEIGHT / 6.0;

// Hash Bit Layout
// anchor bin (9) | partner bin (9) | frame delta (14) -> u32
pub const HASH_BIN_BITS: u32 = 9;
pub const HASH_DELTA_BITS: u32 = 14;

/// A match-rate bound as a function of the time a candidate has been
/// observed, in seconds. Values are expected in `[0, 1]`.
#[derive(Clone)]
pub enum Threshold {
    /// `height * base^(x / width_scale)`
    ExponentialDecay {
        base: f64,
        width_scale: f64,
        height: f64,
    },
    /// `max(height - slope * x, floor)`
    Linear { height: f64, slope: f64, floor: f64 },
    Constant(f64),
    Custom(Arc<dyn Fn(f64) -> f64 + Send + Sync>),
}

impl Threshold {
    pub fn exponential_decay(base: f64, width_scale: f64, height: f64) -> Self {
        Threshold::ExponentialDecay {
            base,
            width_scale,
            height,
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        Threshold::Custom(Arc::new(f))
    }

    pub fn calculate(&self, x: f64) -> f64 {
        match self {
            Threshold::ExponentialDecay {
                base,
                width_scale,
                height,
            } => base.powf(x / width_scale) * height,
            Threshold::Linear {
                height,
                slope,
                floor,
            } => (height - slope * x).max(*floor),
            Threshold::Constant(value) => *value,
            Threshold::Custom(f) => f(x),
        }
    }
}

impl fmt::Debug for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::ExponentialDecay {
                base,
                width_scale,
                height,
            } => f
                .debug_struct("ExponentialDecay")
                .field("base", base)
                .field("width_scale", width_scale)
                .field("height", height)
                .finish(),
            Threshold::Linear {
                height,
                slope,
                floor,
            } => f
                .debug_struct("Linear")
                .field("height", height)
                .field("slope", slope)
                .field("floor", floor)
                .finish(),
            Threshold::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Threshold::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Configuration for one fingerprinting run, shared read-only by generation
/// and matching.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Rate in Hz the sample source delivers.
    pub sampling_rate: u32,
    /// STFT window in samples; a spectral frame holds `window_size / 2` bins.
    pub window_size: usize,
    /// Samples between consecutive windows. Windows overlap when smaller
    /// than `window_size`.
    pub hop_size: usize,
    pub window_type: WindowType,
    pub spectrum_scale: SpectrumScale,
    /// Alpha of the exponential moving average subtracted from every frame
    /// to form the residual spectrum.
    pub temporal_smoothing_coefficient: f32,
    /// Length in bins of the moving-average low pass applied to each
    /// residual frame. Zero disables it.
    pub spectrum_smoothing_length: usize,
    pub peaks_per_frame: usize,
    /// Maximum number of partner peaks paired with one anchor.
    pub peak_fanout: usize,
    /// Frames between an anchor and the start of its target zone.
    pub target_zone_distance: usize,
    /// Frames covered by the target zone.
    pub target_zone_length: usize,
    /// Bins covered by the target zone, centered on the anchor bin.
    pub target_zone_width: usize,
    pub matching_min_frames: usize,
    pub matching_max_frames: usize,
    pub threshold_accept: Threshold,
    pub threshold_reject: Threshold,
}

/// Points at which `validate` samples the matching thresholds.
const THRESHOLD_CHECKPOINTS: usize = 1024;

impl Default for Profile {
    fn default() -> Self {
        let frames_per_second = SAMPLING_RATE as f64 / HOP_SIZE as f64;

        Self {
            sampling_rate: SAMPLING_RATE,
            window_size: WINDOW_SIZE,
            hop_size: HOP_SIZE,
            window_type: WindowType::Hann,
            spectrum_scale: SpectrumScale::Magnitude,
            temporal_smoothing_coefficient: TEMPORAL_SMOOTHING_COEFFICIENT,
            spectrum_smoothing_length: SPECTRUM_SMOOTHING_LENGTH,
            peaks_per_frame: PEAKS_PER_FRAME,
            peak_fanout: PEAK_FANOUT,
            target_zone_distance: TARGET_ZONE_DISTANCE,
            target_zone_length: TARGET_ZONE_LENGTH,
            target_zone_width: TARGET_ZONE_WIDTH,
            matching_min_frames: MATCHING_MIN_FRAMES,
            matching_max_frames: (frames_per_second * MATCHING_MAX_SECONDS) as usize,
            threshold_accept: Threshold::exponential_decay(
                THRESHOLD_BASE,
                THRESHOLD_WIDTH_SCALE,
                THRESHOLD_ACCEPT_HEIGHT,
            ),
            threshold_reject: Threshold::exponential_decay(
                THRESHOLD_BASE,
                THRESHOLD_WIDTH_SCALE,
                THRESHOLD_REJECT_HEIGHT,
            ),
        }
    }
}

impl Profile {
    /// Number of magnitude bins per spectral frame.
    pub fn frame_bins(&self) -> usize {
        self.window_size / 2
    }

    pub fn frames_per_second(&self) -> f64 {
        self.sampling_rate as f64 / self.hop_size as f64
    }

    /// Duration of one hop in seconds, the time scale of frame indices and
    /// hash deltas.
    pub fn hash_time_scale(&self) -> f64 {
        self.hop_size as f64 / self.sampling_rate as f64
    }

    pub fn frames_to_seconds(&self, frames: f64) -> f64 {
        frames * self.hash_time_scale()
    }

    /// Frames an anchor must wait until its whole target zone has been seen.
    pub fn target_zone_span(&self) -> usize {
        self.target_zone_distance + self.target_zone_length
    }

    /// Number of frames the forward transform emits for `samples` input
    /// samples.
    pub fn frame_count(&self, samples: u64) -> u64 {
        let window = self.window_size as u64;
        if samples < window {
            0
        } else {
            (samples - window) / self.hop_size as u64 + 1
        }
    }

    pub fn accept_threshold(&self, frames_elapsed: usize) -> f64 {
        self.threshold_accept
            .calculate(self.frames_to_seconds(frames_elapsed as f64))
    }

    pub fn reject_threshold(&self, frames_elapsed: usize) -> f64 {
        self.threshold_reject
            .calculate(self.frames_to_seconds(frames_elapsed as f64))
    }

    /// Checks every invariant the pipeline relies on. Violations are
    /// programmer errors and are reported, never corrected.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidProfile(msg));

        if self.sampling_rate == 0 {
            return invalid("sampling rate must be > 0".into());
        }
        if self.hop_size == 0 {
            return invalid("hop size must be > 0".into());
        }
        if self.window_size <= self.hop_size {
            return invalid(format!(
                "window size ({}) must be greater than hop size ({})",
                self.window_size, self.hop_size
            ));
        }
        if self.window_size % 2 != 0 {
            return invalid(format!("window size ({}) must be even", self.window_size));
        }
        if self.frame_bins() > 1 << HASH_BIN_BITS {
            return invalid(format!(
                "window size {} yields {} bins, hashes hold at most {}",
                self.window_size,
                self.frame_bins(),
                1 << HASH_BIN_BITS
            ));
        }
        let alpha = self.temporal_smoothing_coefficient;
        if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
            return invalid(format!("smoothing coefficient {alpha} outside [0, 1]"));
        }

        let counts = [
            ("peaks per frame", self.peaks_per_frame),
            ("peak fanout", self.peak_fanout),
            ("target zone distance", self.target_zone_distance),
            ("target zone length", self.target_zone_length),
            ("target zone width", self.target_zone_width),
            ("matching min frames", self.matching_min_frames),
            ("matching max frames", self.matching_max_frames),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return invalid(format!("{name} must be > 0"));
        }

        if self.target_zone_span() >= 1 << HASH_DELTA_BITS {
            return invalid(format!(
                "target zone reaches {} frames, hashes hold deltas below {}",
                self.target_zone_span(),
                1 << HASH_DELTA_BITS
            ));
        }
        if self.matching_min_frames >= self.matching_max_frames {
            return invalid(format!(
                "matching min frames ({}) must be below max frames ({})",
                self.matching_min_frames, self.matching_max_frames
            ));
        }

        // evenly spaced checkpoints keep huge frame limits cheap to check
        let max_frames = self.matching_max_frames;
        let step = max_frames.div_ceil(THRESHOLD_CHECKPOINTS).max(1);
        let checkpoints = (0..=max_frames)
            .step_by(step)
            .chain([self.matching_min_frames + 1, max_frames]);
        for frames in checkpoints {
            let accept = self.accept_threshold(frames);
            let reject = self.reject_threshold(frames);
            if !accept.is_finite() || !reject.is_finite() {
                return invalid(format!("threshold is not finite at {frames} frames"));
            }
            if accept < reject {
                return invalid(format!(
                    "accept threshold {accept:.4} below reject threshold {reject:.4} at {frames} frames"
                ));
            }
        }

        Ok(())
    }
}
