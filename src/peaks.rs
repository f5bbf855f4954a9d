use crate::residual::ResidualFrame;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub bin: usize,
    pub frame: usize,
    pub magnitude: f32,
}

/// Returns at most `max_peaks` local maxima of `frame`, strongest first.
///
/// A bin is a local maximum when it is strictly greater than both of its
/// neighbours; the first and last bin only have one neighbour to beat. Equal
/// magnitudes are ordered by the lower bin.
pub fn extract_peaks(frame: &ResidualFrame, max_peaks: usize) -> Vec<Peak> {
    let bins = &frame.bins;
    if bins.is_empty() || max_peaks == 0 {
        return Vec::new();
    }

    let last = bins.len() - 1;
    let mut candidates: Vec<Peak> = Vec::new();

    for (i, &value) in bins.iter().enumerate() {
        let above_left = i == 0 || value > bins[i - 1];
        let above_right = i == last || value > bins[i + 1];
        // a single-bin frame has no neighbour to exceed
        if above_left && above_right && last > 0 {
            candidates.push(Peak {
                bin: i,
                frame: frame.index,
                magnitude: value,
            });
        }
    }

    candidates.sort_by(|a, b| {
        b.magnitude
            .total_cmp(&a.magnitude)
            .then(a.bin.cmp(&b.bin))
    });
    candidates.truncate(max_peaks);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn residual(bins: Vec<f32>) -> ResidualFrame {
        ResidualFrame { index: 7, bins }
    }

    #[test]
    fn global_maximum_is_top_peak() {
        let frame = residual(vec![0.0, 1.0, 0.0, 9.0, 2.0, 3.0, 0.5]);
        let peaks = extract_peaks(&frame, 3);
        assert_eq!(peaks[0].bin, 3);
        assert_eq!(peaks[0].frame, 7);
        assert_eq!(
            peaks.iter().map(|p| p.bin).collect::<Vec<_>>(),
            vec![3, 5, 1]
        );
    }

    #[test]
    fn edge_bins_compare_to_one_neighbour() {
        let frame = residual(vec![5.0, 1.0, 2.0, 1.0, 4.0]);
        let bins: Vec<usize> = extract_peaks(&frame, 10).iter().map(|p| p.bin).collect();
        assert_eq!(bins, vec![0, 4, 2]);
    }

    #[test]
    fn plateaus_are_not_peaks() {
        let frame = residual(vec![0.0; 16]);
        assert!(extract_peaks(&frame, 3).is_empty());

        let frame = residual(vec![0.0, 2.0, 2.0, 0.0]);
        assert!(extract_peaks(&frame, 3).is_empty());
    }

    #[test]
    fn ties_prefer_lower_bin() {
        let frame = residual(vec![0.0, 4.0, 0.0, 4.0, 0.0, 4.0, 0.0]);
        let bins: Vec<usize> = extract_peaks(&frame, 2).iter().map(|p| p.bin).collect();
        assert_eq!(bins, vec![1, 3]);
    }

    #[test]
    fn extraction_is_idempotent() {
        let frame = residual(
            (0..256)
                .map(|i| ((i * 37 % 101) as f32).sin() * (i % 13) as f32)
                .collect(),
        );
        let first = extract_peaks(&frame, 3);
        let second = extract_peaks(&frame, 3);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn fewer_candidates_than_cap_returns_all() {
        let frame = residual(vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(extract_peaks(&frame, 3).len(), 1);
    }

    #[test]
    fn non_finite_bins_keep_a_total_order() {
        let frame = residual(vec![0.0, f32::NAN, 0.0, 3.0, 0.0, f32::INFINITY, 0.0, 5.0, 0.0]);
        let bins: Vec<usize> = extract_peaks(&frame, 10).iter().map(|p| p.bin).collect();
        assert_eq!(bins, vec![5, 7, 3]);
    }
}
