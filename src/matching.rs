//! Streaming match decisions against a [`FingerprintStore`].
//!
//! Every hash of the query that is found in the store votes for the bucket
//! `(track, query frame - stored frame)`. A true match keeps hitting one
//! bucket with most of the query's hashes while coincidental collisions
//! scatter over many buckets with a small share each. Each bucket runs its
//! own sequential test: once it has been observed for `matching_min_frames`,
//! the share of query hashes that hit it is compared to the accept and
//! reject thresholds of the profile, which both decay with the observed time.

use std::collections::{BTreeMap, HashSet};

use log::debug;
use rayon::prelude::*;

use crate::config::Profile;
use crate::error::Result;
use crate::generator::HashBatch;
use crate::hashing::FingerprintHash;
use crate::store::{FingerprintStore, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accepted,
    Rejected,
    /// Undecided when the stream ended or `matching_max_frames` ran out.
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub track: TrackId,
    /// Query frame minus stored frame.
    pub offset: i64,
    /// Query frame of the first vote.
    pub first_frame: usize,
    pub frames_evaluated: usize,
    /// Query frames that voted for the bucket.
    pub votes: usize,
    /// Query hashes that hit the bucket.
    pub hash_hits: usize,
    /// Query hashes looked up from `first_frame` to the decision.
    pub hashes_looked_up: usize,
    /// `hash_hits / hashes_looked_up`.
    pub rate: f64,
    pub verdict: Verdict,
}

impl MatchResult {
    /// Offset in seconds; positive when the content starts later in the
    /// query than in the stored track.
    pub fn offset_seconds(&self, profile: &Profile) -> f64 {
        profile.frames_to_seconds(self.offset as f64)
    }
}

#[derive(Debug, Clone)]
struct MatchCandidate {
    first_frame: usize,
    last_vote: usize,
    /// Sequence number of the last query hash that hit, one hit per hash.
    last_hash: Option<usize>,
    votes: usize,
    hash_hits: usize,
    /// Query hashes seen before `first_frame`.
    hashes_before: usize,
}

impl MatchCandidate {
    fn rate(&self, hashes_looked_up: usize) -> f64 {
        self.hash_hits as f64 / hashes_looked_up.max(1) as f64
    }

    fn result(
        &self,
        key: (TrackId, i64),
        frames_evaluated: usize,
        hashes_looked_up: usize,
        verdict: Verdict,
    ) -> MatchResult {
        MatchResult {
            track: key.0,
            offset: key.1,
            first_frame: self.first_frame,
            frames_evaluated,
            votes: self.votes,
            hash_hits: self.hash_hits,
            hashes_looked_up,
            rate: self.rate(hashes_looked_up),
            verdict,
        }
    }
}

/// Matching state for one query track. Feed hash batches in frame order.
pub struct Matcher<'a> {
    store: &'a FingerprintStore,
    profile: &'a Profile,
    exclude: Option<TrackId>,
    active: BTreeMap<(TrackId, i64), MatchCandidate>,
    finished: HashSet<(TrackId, i64)>,
    current_frame: Option<usize>,
    hashes_seen: usize,
}

impl<'a> Matcher<'a> {
    pub fn new(store: &'a FingerprintStore, profile: &'a Profile) -> Result<Self> {
        profile.validate()?;

        Ok(Self {
            store,
            profile,
            exclude: None,
            active: BTreeMap::new(),
            finished: HashSet::new(),
            current_frame: None,
            hashes_seen: 0,
        })
    }

    /// Ignores hits on `track`, for queries that are themselves indexed.
    pub fn excluding(mut self, track: TrackId) -> Self {
        self.exclude = Some(track);
        self
    }

    pub fn active_candidates(&self) -> usize {
        self.active.len()
    }

    pub fn push_batch(&mut self, batch: &HashBatch) -> Vec<MatchResult> {
        self.push_frame(batch.frame, &batch.hashes)
    }

    /// Votes with the hashes anchored at query frame `frame` and returns the
    /// buckets that reached a verdict.
    pub fn push_frame(&mut self, frame: usize, hashes: &[FingerprintHash]) -> Vec<MatchResult> {
        self.current_frame = Some(self.current_frame.map_or(frame, |f| f.max(frame)));

        let store = self.store;
        let exclude = self.exclude;
        let hashes_before = self.hashes_seen;
        let active = &mut self.active;
        let finished = &self.finished;
        let mut voted = false;

        for (i, hash) in hashes.iter().enumerate() {
            let seq = hashes_before + i;
            store.for_each_match(hash.hash, |entry| {
                if exclude == Some(entry.track) {
                    return;
                }
                let key = (entry.track, frame as i64 - entry.frame as i64);
                if finished.contains(&key) {
                    return;
                }

                let candidate = active.entry(key).or_insert_with(|| MatchCandidate {
                    first_frame: frame,
                    last_vote: frame,
                    last_hash: None,
                    votes: 0,
                    hash_hits: 0,
                    hashes_before,
                });
                if candidate.last_hash == Some(seq) {
                    return;
                }
                voted = true;
                candidate.last_hash = Some(seq);
                candidate.hash_hits += 1;
                if candidate.votes == 0 || candidate.last_vote != frame {
                    candidate.votes += 1;
                    candidate.last_vote = frame;
                }
            });
        }
        self.hashes_seen += hashes.len();

        if voted {
            self.decide(frame)
        } else {
            Vec::new()
        }
    }

    fn decide(&mut self, frame: usize) -> Vec<MatchResult> {
        let profile = self.profile;
        let max_frames = profile.matching_max_frames;
        let mut decided = Vec::new();

        for (&key, candidate) in &self.active {
            let span = frame.saturating_sub(candidate.first_frame);
            if span < profile.matching_min_frames {
                continue;
            }

            let elapsed = span + 1;
            let looked_up = self.hashes_seen - candidate.hashes_before;
            if elapsed > max_frames {
                // ran out while no vote triggered a test
                decided.push(candidate.result(key, max_frames, looked_up, Verdict::Inconclusive));
                continue;
            }

            let rate = candidate.rate(looked_up);
            let verdict = if rate >= profile.accept_threshold(elapsed) {
                Verdict::Accepted
            } else if rate < profile.reject_threshold(elapsed) {
                Verdict::Rejected
            } else if elapsed == max_frames {
                Verdict::Inconclusive
            } else {
                continue;
            };

            if verdict == Verdict::Accepted {
                debug!(
                    "accepted track {} at offset {} after {} frames ({} of {} hashes)",
                    key.0, key.1, elapsed, candidate.hash_hits, looked_up
                );
            }
            decided.push(candidate.result(key, elapsed, looked_up, verdict));
        }

        for result in &decided {
            let key = (result.track, result.offset);
            self.active.remove(&key);
            self.finished.insert(key);
        }
        decided
    }

    /// Ends the query. Every bucket still undecided is reported
    /// inconclusive.
    pub fn finish(self) -> Vec<MatchResult> {
        let Some(frame) = self.current_frame else {
            return Vec::new();
        };

        let max_frames = self.profile.matching_max_frames;
        self.active
            .iter()
            .map(|(&key, candidate)| {
                let elapsed = (frame.saturating_sub(candidate.first_frame) + 1).min(max_frames);
                let looked_up = self.hashes_seen - candidate.hashes_before;
                candidate.result(key, elapsed, looked_up, Verdict::Inconclusive)
            })
            .collect()
    }
}

/// Runs a whole query hash stream and returns every verdict: the ones
/// reached while streaming, then the inconclusive leftovers.
pub fn find_matches<I>(
    store: &FingerprintStore,
    profile: &Profile,
    query: I,
) -> Result<Vec<MatchResult>>
where
    I: IntoIterator<Item = HashBatch>,
{
    run(Matcher::new(store, profile)?, query)
}

/// Like [`find_matches`] but ignores hits on the query's own track.
pub fn find_matches_excluding<I>(
    store: &FingerprintStore,
    profile: &Profile,
    track: TrackId,
    query: I,
) -> Result<Vec<MatchResult>>
where
    I: IntoIterator<Item = HashBatch>,
{
    run(Matcher::new(store, profile)?.excluding(track), query)
}

fn run<I>(mut matcher: Matcher<'_>, query: I) -> Result<Vec<MatchResult>>
where
    I: IntoIterator<Item = HashBatch>,
{
    let mut results = Vec::new();
    for batch in query {
        results.extend(matcher.push_batch(&batch));
    }
    results.extend(matcher.finish());
    Ok(results)
}

/// Matches every indexed query against the store in parallel, skipping each
/// query's own entries.
pub fn align_all(
    store: &FingerprintStore,
    profile: &Profile,
    queries: &[(TrackId, Vec<HashBatch>)],
) -> Result<Vec<(TrackId, Vec<MatchResult>)>> {
    queries
        .par_iter()
        .map(|(track, batches)| {
            let results =
                find_matches_excluding(store, profile, *track, batches.iter().cloned())?;
            Ok((*track, results))
        })
        .collect()
}

/// The accepted result with the highest rate, earliest first on ties.
pub fn best_match(results: &[MatchResult]) -> Option<&MatchResult> {
    results
        .iter()
        .filter(|r| r.verdict == Verdict::Accepted)
        .max_by(|a, b| {
            a.rate
                .total_cmp(&b.rate)
                .then(b.first_frame.cmp(&a.first_frame))
        })
}
