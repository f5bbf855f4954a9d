use image::{Rgb, RgbImage};
use log::info;
use std::path::Path;

use crate::error::Result;
use crate::generator::{FrameEvent, FrameObserver};

const PEAK_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layer {
    Spectrum,
    #[default]
    Residual,
}

/// Records the frames of one generation pass and renders them as a
/// spectrogram image with the extracted peaks marked in red.
#[derive(Debug, Default)]
pub struct SpectrogramRecorder {
    layer: Layer,
    columns: Vec<Vec<f32>>,
    peaks: Vec<(usize, usize)>,
}

impl SpectrogramRecorder {
    pub fn new(layer: Layer) -> Self {
        Self {
            layer,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> usize {
        self.columns.len()
    }

    pub fn render(&self) -> Option<RgbImage> {
        let width = self.columns.len();
        let height = self.columns.first().map_or(0, |c| c.len());
        if width == 0 || height == 0 {
            return None;
        }

        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for value in self.columns.iter().flatten().filter(|v| v.is_finite()) {
            min = min.min(*value);
            max = max.max(*value);
        }
        let range = if max - min < 1e-6 { 1.0 } else { max - min };

        let mut imgbuf = RgbImage::new(width as u32, height as u32);
        for (t, column) in self.columns.iter().enumerate() {
            for (f, &value) in column.iter().enumerate() {
                let scaled = (value - min) / range;
                let intensity = (scaled.clamp(0.0, 1.0) * 255.0).round() as u8;
                let y = (height - 1 - f) as u32;
                imgbuf.put_pixel(t as u32, y, Rgb([intensity, intensity, intensity]));
            }
        }

        for &(t, f) in &self.peaks {
            if t < width && f < height {
                imgbuf.put_pixel(t as u32, (height - 1 - f) as u32, PEAK_COLOR);
            }
        }

        Some(imgbuf)
    }

    /// Writes the rendered image. An empty recording writes nothing.
    pub fn save(&self, output_path: impl AsRef<Path>) -> Result<bool> {
        let Some(imgbuf) = self.render() else {
            return Ok(false);
        };
        imgbuf.save(output_path.as_ref())?;
        info!("spectrogram saved to {}", output_path.as_ref().display());
        Ok(true)
    }
}

impl FrameObserver for SpectrogramRecorder {
    fn frame_processed(&mut self, event: &FrameEvent<'_>) {
        let bins = match self.layer {
            Layer::Spectrum => &event.spectrum.bins,
            Layer::Residual => &event.residual.bins,
        };
        self.columns.push(bins.clone());
        self.peaks
            .extend(event.peaks.iter().map(|p| (p.frame, p.bin)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Profile;
    use crate::generator::{FingerprintGenerator, Noop};
    use crate::audio::SliceSource;

    #[test]
    fn empty_recording_renders_nothing() {
        assert!(SpectrogramRecorder::default().render().is_none());
    }

    #[test]
    fn peaks_are_marked() {
        let profile = Profile::default();
        let samples: Vec<f32> = (0..11025)
            .map(|n| (n as f32 * 0.3).sin() * (n as f32 * 0.001).cos())
            .collect();

        let mut recorder = SpectrogramRecorder::new(Layer::Residual);
        let summary = FingerprintGenerator::generate_observed(
            &profile,
            SliceSource::new(&samples),
            Noop,
            &mut recorder,
        )
        .unwrap();
        assert_eq!(recorder.frames(), summary.frames);

        let img = recorder.render().unwrap();
        assert_eq!(img.width() as usize, summary.frames);
        assert_eq!(img.height() as usize, profile.frame_bins());
        let &(t, f) = recorder.peaks.first().unwrap();
        assert_eq!(
            *img.get_pixel(t as u32, (profile.frame_bins() - 1 - f) as u32),
            PEAK_COLOR
        );
    }
}
