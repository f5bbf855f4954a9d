use crate::config::Profile;
use crate::stft::SpectralFrame;

/// A spectral frame with the running average spectrum subtracted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualFrame {
    pub index: usize,
    pub bins: Vec<f32>,
}

/// Subtracts an exponential moving average from every frame so that
/// stationary energy cancels out and onsets stand out.
///
/// The average starts at the first observed frame and is updated after the
/// residual is taken, so it always lags the signal by one frame.
#[derive(Debug, Clone)]
pub struct ResidualFilter {
    alpha: f32,
    smoothing_length: usize,
    average: Option<Vec<f32>>,
}

impl ResidualFilter {
    pub fn new(alpha: f32, smoothing_length: usize) -> Self {
        Self {
            alpha,
            smoothing_length,
            average: None,
        }
    }

    pub fn from_profile(profile: &Profile) -> Self {
        Self::new(
            profile.temporal_smoothing_coefficient,
            profile.spectrum_smoothing_length,
        )
    }

    pub fn average(&self) -> Option<&[f32]> {
        self.average.as_deref()
    }

    pub fn process(&mut self, frame: &SpectralFrame) -> ResidualFrame {
        let alpha = self.alpha;
        let average = self
            .average
            .get_or_insert_with(|| frame.bins.clone());

        let mut residual = Vec::with_capacity(frame.bins.len());
        for (avg, &observed) in average.iter_mut().zip(frame.bins.iter()) {
            residual.push(observed - *avg);
            *avg = *avg * (1.0 - alpha) + observed * alpha;
        }

        if self.smoothing_length > 0 {
            residual = moving_average(&residual, self.smoothing_length);
        }

        ResidualFrame {
            index: frame.index,
            bins: residual,
        }
    }
}

/// Centered simple moving average across bins. Near the edges the window
/// shrinks to the bins that exist.
pub fn moving_average(bins: &[f32], length: usize) -> Vec<f32> {
    if length <= 1 || bins.is_empty() {
        return bins.to_vec();
    }

    let before = (length - 1) / 2;
    let after = length - 1 - before;

    let mut prefix = Vec::with_capacity(bins.len() + 1);
    prefix.push(0.0f64);
    for &value in bins {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + value as f64);
    }

    (0..bins.len())
        .map(|i| {
            let start = i.saturating_sub(before);
            let end = (i + after + 1).min(bins.len());
            ((prefix[end] - prefix[start]) / (end - start) as f64) as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(index: usize, bins: Vec<f32>) -> SpectralFrame {
        SpectralFrame { index, bins }
    }

    #[test]
    fn first_frame_has_zero_residual() {
        let mut filter = ResidualFilter::new(0.05, 0);
        let residual = filter.process(&frame(0, vec![1.0, 5.0, -3.0]));
        assert_eq!(residual.bins, vec![0.0, 0.0, 0.0]);
        assert_eq!(residual.index, 0);
    }

    #[test]
    fn average_follows_recursive_formula() {
        let alpha = 0.25f32;
        let mut filter = ResidualFilter::new(alpha, 0);
        let inputs = [2.0f32, 6.0, -1.0, 4.0, 4.0, 10.0];

        let mut expected_avg = inputs[0];
        for (k, &value) in inputs.iter().enumerate() {
            let residual = filter.process(&frame(k, vec![value]));
            assert!((residual.bins[0] - (value - expected_avg)).abs() < 1e-6);
            expected_avg = expected_avg * (1.0 - alpha) + value * alpha;
            assert!((filter.average().unwrap()[0] - expected_avg).abs() < 1e-6);
        }
    }

    #[test]
    fn constant_spectrum_converges_to_zero_residual() {
        let mut filter = ResidualFilter::new(0.05, 0);
        filter.process(&frame(0, vec![-80.0; 8]));

        let mut last = Vec::new();
        for k in 1..400 {
            last = filter.process(&frame(k, vec![-20.0; 8])).bins;
        }
        assert!(last.iter().all(|r| r.abs() < 1e-3), "{last:?}");
    }

    #[test]
    fn moving_average_shrinks_at_edges() {
        let smoothed = moving_average(&[3.0, 0.0, 0.0, 0.0, 6.0], 3);
        assert_eq!(smoothed, vec![1.5, 1.0, 0.0, 2.0, 3.0]);
    }

    #[test]
    fn smoothing_applies_to_residual() {
        let mut filter = ResidualFilter::new(0.5, 3);
        filter.process(&frame(0, vec![0.0; 5]));
        let residual = filter.process(&frame(1, vec![0.0, 0.0, 9.0, 0.0, 0.0]));
        assert_eq!(residual.bins, vec![0.0, 3.0, 3.0, 3.0, 0.0]);
    }
}
