use std::{fs::File, io::BufReader, path::Path};

use hound::{SampleFormat, WavIntoSamples, WavReader};
use log::{info, warn};

use crate::error::{Error, Result};

/// Pull-based mono sample stream at the analysis rate.
pub trait SampleSource {
    /// Fills the front of `buf` and returns how many samples were written.
    /// Zero means end of stream.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize>;

    /// Total number of samples the stream will yield, when known up front.
    fn total_samples(&self) -> Option<u64> {
        None
    }
}

impl<S: SampleSource + ?Sized> SampleSource for &mut S {
    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        (**self).read(buf)
    }

    fn total_samples(&self) -> Option<u64> {
        (**self).total_samples()
    }
}

/// Streams samples out of an in-memory buffer.
#[derive(Debug, Clone)]
pub struct SliceSource<'a> {
    samples: &'a [f32],
    position: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(samples: &'a [f32]) -> Self {
        Self {
            samples,
            position: 0,
        }
    }
}

impl SampleSource for SliceSource<'_> {
    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        let remaining = &self.samples[self.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    fn total_samples(&self) -> Option<u64> {
        Some(self.samples.len() as u64)
    }
}

enum WavSamples {
    Int {
        samples: WavIntoSamples<BufReader<File>, i32>,
        scale: f32,
    },
    Float(WavIntoSamples<BufReader<File>, f32>),
}

impl WavSamples {
    fn next_sample(&mut self) -> Option<Result<f32>> {
        match self {
            WavSamples::Int { samples, scale } => samples
                .next()
                .map(|s| s.map(|v| v as f32 * *scale).map_err(Error::from)),
            WavSamples::Float(samples) => samples.next().map(|s| s.map_err(Error::from)),
        }
    }
}

/// Reads a mono or stereo WAV file, mixing stereo down to mono and
/// decimating to the analysis rate by keeping every n-th sample.
pub struct WavSource {
    samples: WavSamples,
    channels: usize,
    step: usize,
    total: u64,
}

impl WavSource {
    pub fn open(path: impl AsRef<Path>, target_sample_rate: u32) -> Result<Self> {
        let path = path.as_ref();
        let reader = WavReader::open(path)?;
        let spec = reader.spec();

        info!(
            "{}: {} Hz, {} channels, {} bits {:?}, {} samples",
            path.display(),
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format,
            reader.len()
        );

        if spec.channels == 0 || spec.channels > 2 {
            return Err(Error::UnsupportedAudio(format!(
                "{} channels, only mono and stereo are supported",
                spec.channels
            )));
        }
        if target_sample_rate == 0 || spec.sample_rate < target_sample_rate {
            return Err(Error::UnsupportedAudio(format!(
                "upsampling {} Hz to {} Hz is not supported",
                spec.sample_rate, target_sample_rate
            )));
        }

        let step = (spec.sample_rate / target_sample_rate) as usize;
        if spec.sample_rate % target_sample_rate != 0 {
            warn!(
                "{} Hz is not a multiple of {} Hz, decimating by {}",
                spec.sample_rate, target_sample_rate, step
            );
        }
        let total = (reader.duration() as u64).div_ceil(step as u64);

        let samples = match spec.sample_format {
            SampleFormat::Int => WavSamples::Int {
                scale: 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32,
                samples: reader.into_samples::<i32>(),
            },
            SampleFormat::Float => WavSamples::Float(reader.into_samples::<f32>()),
        };

        Ok(Self {
            samples,
            channels: spec.channels as usize,
            step,
            total,
        })
    }

    fn next_mono(&mut self) -> Result<Option<f32>> {
        let mut sum = 0.0;
        for _ in 0..self.channels {
            // a truncated last frame is dropped
            let Some(sample) = self.samples.next_sample() else {
                return Ok(None);
            };
            sum += sample?;
        }
        Ok(Some(sum / self.channels as f32))
    }
}

impl SampleSource for WavSource {
    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let Some(sample) = self.next_mono()? else {
                break;
            };
            for _ in 1..self.step {
                if self.next_mono()?.is_none() {
                    break;
                }
            }
            buf[written] = sample;
            written += 1;
        }
        Ok(written)
    }

    fn total_samples(&self) -> Option<u64> {
        Some(self.total)
    }
}

/// Drains a source into memory.
pub fn read_all<S: SampleSource>(mut source: S) -> Result<Vec<f32>> {
    let mut samples = Vec::new();
    if let Some(total) = source.total_samples() {
        samples.reserve(total as usize);
    }
    let mut block = vec![0.0; 4096];
    loop {
        let n = source.read(&mut block)?;
        if n == 0 {
            break;
        }
        samples.extend_from_slice(&block[..n]);
    }
    Ok(samples)
}
