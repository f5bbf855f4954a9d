//! Per-track fingerprint generation.
//!
//! `FingerprintGenerator` drives one track through the whole pipeline:
//! spectral transform, residual filter, peak extraction and hashing. It owns
//! all of its buffers, so independent tracks can be generated on separate
//! threads. Output leaves through a [`HashSink`]; a [`FrameObserver`] can
//! watch intermediate frames without affecting the hashes.

use crossbeam_channel::Sender;
use log::debug;

use crate::audio::SampleSource;
use crate::config::Profile;
use crate::error::{Error, Result};
use crate::hashing::{AnchorHashes, FingerprintHash, HashGenerator};
use crate::peaks::{Peak, extract_peaks};
use crate::residual::{ResidualFilter, ResidualFrame};
use crate::stft::{SpectralFrame, Stft};

/// Samples requested from the source per read.
const BLOCK_SIZE: usize = 4096;

/// Hashes anchored in one frame, plus progress counters.
#[derive(Debug, Clone, PartialEq)]
pub struct HashBatch {
    /// Anchor frame shared by every hash in the batch.
    pub frame: usize,
    pub hashes: Vec<FingerprintHash>,
    /// Spectral frames processed so far.
    pub current_frame: usize,
    /// Spectral frames the track will produce, when the source knows its
    /// length.
    pub total_frames: Option<usize>,
}

/// Receives hash batches in anchor-frame order.
pub trait HashSink {
    fn hashes_generated(&mut self, batch: HashBatch) -> Result<()>;
}

impl HashSink for Vec<HashBatch> {
    fn hashes_generated(&mut self, batch: HashBatch) -> Result<()> {
        self.push(batch);
        Ok(())
    }
}

impl<K: HashSink + ?Sized> HashSink for &mut K {
    fn hashes_generated(&mut self, batch: HashBatch) -> Result<()> {
        (**self).hashes_generated(batch)
    }
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F: FnMut(HashBatch)> HashSink for FnSink<F> {
    fn hashes_generated(&mut self, batch: HashBatch) -> Result<()> {
        (self.0)(batch);
        Ok(())
    }
}

/// Forwards batches over a channel. With a bounded channel the generator
/// blocks until the consumer catches up; a dropped receiver stops
/// generation with [`Error::SinkClosed`].
pub struct ChannelSink {
    sender: Sender<HashBatch>,
}

impl ChannelSink {
    pub fn new(sender: Sender<HashBatch>) -> Self {
        Self { sender }
    }
}

impl HashSink for ChannelSink {
    fn hashes_generated(&mut self, batch: HashBatch) -> Result<()> {
        self.sender.send(batch).map_err(|_| Error::SinkClosed)
    }
}

/// Everything the pipeline knows about one spectral frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameEvent<'a> {
    pub index: usize,
    pub total_frames: Option<usize>,
    pub spectrum: &'a SpectralFrame,
    pub residual: &'a ResidualFrame,
    pub peaks: &'a [Peak],
}

pub trait FrameObserver {
    fn frame_processed(&mut self, _event: &FrameEvent<'_>) {}
}

impl<O: FrameObserver + ?Sized> FrameObserver for &mut O {
    fn frame_processed(&mut self, event: &FrameEvent<'_>) {
        (**self).frame_processed(event)
    }
}

/// Discards everything. Valid wherever a sink or observer is required.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

impl HashSink for Noop {
    fn hashes_generated(&mut self, _batch: HashBatch) -> Result<()> {
        Ok(())
    }
}

impl FrameObserver for Noop {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    pub frames: usize,
    pub hashes: usize,
}

pub struct FingerprintGenerator {
    peaks_per_frame: usize,
    stft: Stft,
    residual: ResidualFilter,
    hashing: HashGenerator,
    total_frames: Option<usize>,
    hashes: usize,
}

impl FingerprintGenerator {
    pub fn new(profile: &Profile) -> Result<Self> {
        profile.validate()?;

        Ok(Self {
            peaks_per_frame: profile.peaks_per_frame,
            stft: Stft::from_profile(profile),
            residual: ResidualFilter::from_profile(profile),
            hashing: HashGenerator::from_profile(profile),
            total_frames: None,
            hashes: 0,
        })
    }

    /// Announces the track length so batches carry a frame total.
    pub fn set_total_frames(&mut self, total_frames: Option<usize>) {
        self.total_frames = total_frames;
    }

    /// Runs a whole track from `source` into `sink`.
    pub fn generate<S, K>(
        profile: &Profile,
        source: S,
        sink: K,
    ) -> Result<GenerationSummary>
    where
        S: SampleSource,
        K: HashSink,
    {
        Self::generate_observed(profile, source, sink, Noop)
    }

    pub fn generate_observed<S, K, O>(
        profile: &Profile,
        mut source: S,
        mut sink: K,
        mut observer: O,
    ) -> Result<GenerationSummary>
    where
        S: SampleSource,
        K: HashSink,
        O: FrameObserver,
    {
        let mut generator = Self::new(profile)?;
        generator.set_total_frames(
            source
                .total_samples()
                .map(|samples| profile.frame_count(samples) as usize),
        );

        let mut block = vec![0.0; BLOCK_SIZE];
        loop {
            let n = source.read(&mut block)?;
            if n == 0 {
                break;
            }
            generator.process(&block[..n], &mut sink, &mut observer)?;
        }
        generator.finish(&mut sink)
    }

    /// Pushes samples through the pipeline, emitting every batch that
    /// becomes complete.
    pub fn process<K, O>(&mut self, samples: &[f32], sink: &mut K, observer: &mut O) -> Result<()>
    where
        K: HashSink,
        O: FrameObserver,
    {
        self.stft.push(samples);

        while let Some(spectrum) = self.stft.next_frame() {
            let residual = self.residual.process(&spectrum);
            let peaks = extract_peaks(&residual, self.peaks_per_frame);

            observer.frame_processed(&FrameEvent {
                index: spectrum.index,
                total_frames: self.total_frames,
                spectrum: &spectrum,
                residual: &residual,
                peaks: &peaks,
            });

            let completed = self.hashing.push(spectrum.index, peaks);
            self.emit(completed, sink)?;
        }
        Ok(())
    }

    /// Flushes the anchors still waiting for their target zone.
    pub fn finish<K: HashSink>(&mut self, sink: &mut K) -> Result<GenerationSummary> {
        let completed = self.hashing.flush();
        self.emit(completed, sink)?;

        let summary = GenerationSummary {
            frames: self.stft.frames_emitted(),
            hashes: self.hashes,
        };
        debug!(
            "generated {} hashes from {} frames",
            summary.hashes, summary.frames
        );
        Ok(summary)
    }

    fn emit<K: HashSink>(&mut self, completed: Vec<AnchorHashes>, sink: &mut K) -> Result<()> {
        let current_frame = self.stft.frames_emitted();
        for anchors in completed {
            self.hashes += anchors.hashes.len();
            sink.hashes_generated(HashBatch {
                frame: anchors.frame,
                hashes: anchors.hashes,
                current_frame,
                total_frames: self.total_frames,
            })?;
        }
        Ok(())
    }
}

/// Fingerprints an in-memory track and returns its hash batches.
pub fn fingerprint_samples(profile: &Profile, samples: &[f32]) -> Result<Vec<HashBatch>> {
    let mut batches = Vec::new();
    FingerprintGenerator::generate(
        profile,
        crate::audio::SliceSource::new(samples),
        &mut batches,
    )?;
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SliceSource;
    use std::f32::consts::PI;

    fn chirp(seconds: f32, sample_rate: f32) -> Vec<f32> {
        let len = (seconds * sample_rate) as usize;
        (0..len)
            .map(|n| {
                let t = n as f32 / sample_rate;
                let phase = 2.0 * PI * (300.0 * t + 150.0 * t * t);
                0.5 * phase.sin() + 0.3 * (2.0 * PI * 97.0 * t).sin() * (7.0 * t).sin()
            })
            .collect()
    }

    #[derive(Default)]
    struct Counter {
        frames: usize,
        peaks: usize,
    }

    impl FrameObserver for Counter {
        fn frame_processed(&mut self, event: &FrameEvent<'_>) {
            assert_eq!(event.spectrum.bins.len(), event.residual.bins.len());
            self.frames += 1;
            self.peaks += event.peaks.len();
        }
    }

    #[test]
    fn short_track_produces_nothing() {
        let profile = Profile::default();
        let batches = fingerprint_samples(&profile, &[0.3; 400]).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn batches_arrive_in_frame_order_with_counters() {
        let profile = Profile::default();
        let samples = chirp(3.0, profile.sampling_rate as f32);
        let batches = fingerprint_samples(&profile, &samples).unwrap();

        let total = profile.frame_count(samples.len() as u64) as usize;
        assert_eq!(batches.len(), total);
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.frame, i);
            assert_eq!(batch.total_frames, Some(total));
            assert!(batch.current_frame <= total);
            assert!(batch.hashes.iter().all(|h| h.frame == i));
            assert!(batch.hashes.len() <= profile.peaks_per_frame * profile.peak_fanout);
        }
        assert!(batches.iter().map(|b| b.hashes.len()).sum::<usize>() > 0);
    }

    #[test]
    fn identical_input_yields_identical_hashes() {
        let profile = Profile::default();
        let samples = chirp(2.0, profile.sampling_rate as f32);

        let collect = |batches: Vec<HashBatch>| {
            let mut hashes: Vec<_> = batches.into_iter().flat_map(|b| b.hashes).collect();
            hashes.sort();
            hashes
        };
        let a = collect(fingerprint_samples(&profile, &samples).unwrap());
        let b = collect(fingerprint_samples(&profile, &samples).unwrap());
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn block_size_does_not_change_output() {
        let profile = Profile::default();
        let samples = chirp(2.0, profile.sampling_rate as f32);
        let expected = fingerprint_samples(&profile, &samples).unwrap();

        let mut generator = FingerprintGenerator::new(&profile).unwrap();
        let mut actual: Vec<HashBatch> = Vec::new();
        for chunk in samples.chunks(333) {
            generator.process(chunk, &mut actual, &mut Noop).unwrap();
        }
        generator.finish(&mut actual).unwrap();

        let strip = |batches: &[HashBatch]| -> Vec<(usize, Vec<FingerprintHash>)> {
            batches.iter().map(|b| (b.frame, b.hashes.clone())).collect()
        };
        assert_eq!(strip(&expected), strip(&actual));
    }

    #[test]
    fn observer_sees_every_frame() {
        let profile = Profile::default();
        let samples = chirp(1.0, profile.sampling_rate as f32);
        let mut counter = Counter::default();

        let summary = FingerprintGenerator::generate_observed(
            &profile,
            SliceSource::new(&samples),
            Noop,
            &mut counter,
        )
        .unwrap();

        assert_eq!(counter.frames, summary.frames);
        assert!(counter.peaks <= summary.frames * profile.peaks_per_frame);
    }

    #[test]
    fn closed_channel_stops_generation() {
        let profile = Profile::default();
        let samples = chirp(2.0, profile.sampling_rate as f32);
        let (sender, receiver) = crossbeam_channel::bounded(4);
        drop(receiver);

        let result = FingerprintGenerator::generate(
            &profile,
            SliceSource::new(&samples),
            ChannelSink::new(sender),
        );
        assert!(matches!(result, Err(Error::SinkClosed)));
    }

    #[test]
    fn invalid_profile_is_rejected_up_front() {
        let profile = Profile {
            hop_size: 0,
            ..Profile::default()
        };
        assert!(FingerprintGenerator::new(&profile).is_err());
    }
}
