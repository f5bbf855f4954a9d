use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::RwLock;

use crate::error::Result;
use crate::generator::{HashBatch, HashSink};
use crate::hashing::FingerprintHash;

const DEFAULT_SHARDS: usize = 64;

/// Opaque track reference. The store never looks behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One occurrence of a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FingerprintEntry {
    pub track: TrackId,
    pub frame: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Distinct hash keys.
    pub hashes: usize,
    pub entries: usize,
    pub variations: usize,
    /// Distinct tracks with at least one entry.
    pub tracks: usize,
}

type Shard = HashMap<u32, Vec<FingerprintEntry>>;

/// Append-only inverted index from hash to every (track, frame) it occurred
/// at.
///
/// Keys are spread over independently locked shards, so generation workers
/// for different tracks only contend when their hashes land in the same
/// shard. Lookups take a shard read lock and see every entry whose insert
/// finished before the lock was acquired.
pub struct FingerprintStore {
    shards: Vec<RwLock<Shard>>,
    entries: AtomicUsize,
    variations: AtomicUsize,
}

impl Default for FingerprintStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            entries: AtomicUsize::new(0),
            variations: AtomicUsize::new(0),
        }
    }

    fn shard_index(&self, hash: u32) -> usize {
        // the low bits only carry the frame delta, mix before picking a shard
        (hash.wrapping_mul(0x9E37_79B9).rotate_right(16) as usize) % self.shards.len()
    }

    pub fn add(&self, track: TrackId, hash: u32, frame: usize, is_variation: bool) {
        let shard = &self.shards[self.shard_index(hash)];
        shard
            .write()
            .entry(hash)
            .or_default()
            .push(FingerprintEntry { track, frame });

        self.entries.fetch_add(1, Ordering::Relaxed);
        if is_variation {
            self.variations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Inserts a run of hashes for one track, taking each shard lock once.
    pub fn add_batch(&self, track: TrackId, hashes: &[FingerprintHash]) {
        if hashes.is_empty() {
            return;
        }

        let mut by_shard: Vec<(usize, &FingerprintHash)> = hashes
            .iter()
            .map(|h| (self.shard_index(h.hash), h))
            .collect();
        by_shard.sort_by_key(|(shard, _)| *shard);

        for group in by_shard.chunk_by(|a, b| a.0 == b.0) {
            let mut shard = self.shards[group[0].0].write();
            for (_, h) in group {
                shard.entry(h.hash).or_default().push(FingerprintEntry {
                    track,
                    frame: h.frame,
                });
            }
        }

        let variations = hashes.iter().filter(|h| h.is_variation).count();
        self.entries.fetch_add(hashes.len(), Ordering::Relaxed);
        self.variations.fetch_add(variations, Ordering::Relaxed);
    }

    /// Every occurrence of `hash` indexed so far.
    pub fn lookup(&self, hash: u32) -> Vec<FingerprintEntry> {
        self.shards[self.shard_index(hash)]
            .read()
            .get(&hash)
            .cloned()
            .unwrap_or_default()
    }

    /// Calls `f` with the occurrences of `hash` without copying them out.
    pub fn for_each_match<F: FnMut(&FingerprintEntry)>(&self, hash: u32, mut f: F) {
        if let Some(entries) = self.shards[self.shard_index(hash)].read().get(&hash) {
            entries.iter().for_each(|e| f(e));
        }
    }

    /// Counts every part of the index. Takes each shard read lock in turn.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hashes: self.shards.iter().map(|s| s.read().len()).sum(),
            entries: self.entries.load(Ordering::Relaxed),
            variations: self.variations.load(Ordering::Relaxed),
            tracks: self.tracks().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load(Ordering::Relaxed) == 0
    }

    /// Tracks with at least one indexed hash. Scans the whole index.
    pub fn tracks(&self) -> Vec<TrackId> {
        let mut tracks = BTreeSet::new();
        for shard in &self.shards {
            for entries in shard.read().values() {
                tracks.extend(entries.iter().map(|e| e.track));
            }
        }
        tracks.into_iter().collect()
    }

    /// Copies out the full multimap, sorted by hash then entry, for
    /// persistence.
    pub fn export(&self) -> Vec<(u32, FingerprintEntry)> {
        let mut all = Vec::with_capacity(self.entries.load(Ordering::Relaxed));
        for shard in &self.shards {
            for (&hash, entries) in shard.read().iter() {
                all.extend(entries.iter().map(|&e| (hash, e)));
            }
        }
        all.sort_unstable();
        all
    }
}

/// Indexes a track's hash batches as they are generated.
pub struct StoreSink<'a> {
    store: &'a FingerprintStore,
    track: TrackId,
}

impl<'a> StoreSink<'a> {
    pub fn new(store: &'a FingerprintStore, track: TrackId) -> Self {
        Self { store, track }
    }
}

impl HashSink for StoreSink<'_> {
    fn hashes_generated(&mut self, batch: HashBatch) -> Result<()> {
        self.store.add_batch(self.track, &batch.hashes);
        Ok(())
    }
}
