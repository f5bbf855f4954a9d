//! Landmark audio fingerprinting and streaming alignment.
//!
//! Samples are turned into spectra, residual spectra, peaks and finally
//! peak-pair hashes. Hashes of reference tracks go into a
//! [`FingerprintStore`]; hashes of a query track are streamed through a
//! [`Matcher`] that decides per (track, offset) bucket whether the query
//! shares content with an indexed track and at which frame offset.

pub mod audio;
pub mod config;
pub mod db;
pub mod error;
pub mod generator;
pub mod hashing;
pub mod matching;
pub mod peaks;
pub mod residual;
pub mod stft;
pub mod store;
pub mod visualize;

pub use audio::{SampleSource, SliceSource, WavSource};
pub use config::{Profile, Threshold};
pub use error::{Error, Result};
pub use generator::{
    ChannelSink, FingerprintGenerator, FnSink, FrameEvent, FrameObserver, HashBatch, HashSink,
    Noop, fingerprint_samples,
};
pub use hashing::FingerprintHash;
pub use matching::{MatchResult, Matcher, Verdict, align_all, best_match, find_matches};
pub use store::{FingerprintEntry, FingerprintStore, StoreSink, TrackId};
