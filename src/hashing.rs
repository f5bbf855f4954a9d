use std::collections::VecDeque;

use crate::config::{HASH_BIN_BITS, HASH_DELTA_BITS, Profile};
use crate::peaks::Peak;

const BIN_MASK: u32 = (1 << HASH_BIN_BITS) - 1;
const DELTA_MASK: u32 = (1 << HASH_DELTA_BITS) - 1;

/// A landmark: one anchor/partner peak pair packed into a lookup key, tagged
/// with the anchor's absolute frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FingerprintHash {
    pub hash: u32,
    pub frame: usize,
    /// Alternate encoding of a peak pair that is already hashed.
    pub is_variation: bool,
}

/// All hashes anchored in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorHashes {
    pub frame: usize,
    pub hashes: Vec<FingerprintHash>,
}

pub fn encode_hash(anchor_bin: usize, partner_bin: usize, frame_delta: usize) -> u32 {
    let anchor = anchor_bin as u32 & BIN_MASK;
    let partner = partner_bin as u32 & BIN_MASK;
    let delta = frame_delta as u32 & DELTA_MASK;

    (anchor << (HASH_BIN_BITS + HASH_DELTA_BITS)) | (partner << HASH_DELTA_BITS) | delta
}

/// Splits a hash back into `(anchor_bin, partner_bin, frame_delta)`.
pub fn decode_hash(hash: u32) -> (usize, usize, usize) {
    let anchor = (hash >> (HASH_BIN_BITS + HASH_DELTA_BITS)) & BIN_MASK;
    let partner = (hash >> HASH_DELTA_BITS) & BIN_MASK;
    let delta = hash & DELTA_MASK;
    (anchor as usize, partner as usize, delta as usize)
}

/// Pairs every anchor peak with the closest peaks of its target zone.
///
/// Target zone of an anchor at frame `f` and bin `b`: frames
/// `[f + distance, f + distance + length)`, bins `[b - width/2, b + width/2]`.
/// Partners are taken nearest first, by frame delta, then bin distance, then
/// lower bin, up to `fanout` per anchor.
///
/// Frames are held until their whole target zone has been pushed, so the
/// buffer never exceeds `distance + length` frames.
#[derive(Debug, Clone)]
pub struct HashGenerator {
    distance: usize,
    length: usize,
    half_width: usize,
    fanout: usize,
    frames: VecDeque<(usize, Vec<Peak>)>,
}

impl HashGenerator {
    pub fn new(distance: usize, length: usize, width: usize, fanout: usize) -> Self {
        Self {
            distance,
            length,
            half_width: width / 2,
            fanout,
            frames: VecDeque::with_capacity(distance + length),
        }
    }

    pub fn from_profile(profile: &Profile) -> Self {
        Self::new(
            profile.target_zone_distance,
            profile.target_zone_length,
            profile.target_zone_width,
            profile.peak_fanout,
        )
    }

    pub fn buffered_frames(&self) -> usize {
        self.frames.len()
    }

    /// Adds the peaks of the next frame and returns the hashes of every
    /// anchor frame whose target zone is now complete.
    pub fn push(&mut self, frame: usize, peaks: Vec<Peak>) -> Vec<AnchorHashes> {
        self.frames.push_back((frame, peaks));

        let span = self.distance + self.length;
        let mut completed = Vec::new();
        while let Some(&(anchor_frame, _)) = self.frames.front() {
            if anchor_frame + span > frame + 1 {
                break;
            }
            completed.push(self.retire_front());
        }
        completed
    }

    /// Hashes the anchors still waiting for their zone at end of stream,
    /// using whatever part of the zone was observed.
    pub fn flush(&mut self) -> Vec<AnchorHashes> {
        let mut completed = Vec::with_capacity(self.frames.len());
        while !self.frames.is_empty() {
            completed.push(self.retire_front());
        }
        completed
    }

    fn retire_front(&mut self) -> AnchorHashes {
        let hashes = match self.frames.front() {
            Some((anchor_frame, anchors)) => self.hash_anchors(*anchor_frame, anchors),
            None => Vec::new(),
        };
        let frame = self.frames.pop_front().map(|(f, _)| f).unwrap_or_default();
        AnchorHashes { frame, hashes }
    }

    fn hash_anchors(&self, anchor_frame: usize, anchors: &[Peak]) -> Vec<FingerprintHash> {
        let zone_start = anchor_frame + self.distance;
        let zone_end = zone_start + self.length;

        let mut hashes = Vec::with_capacity(anchors.len() * self.fanout);
        let mut partners: Vec<&Peak> = Vec::new();

        for anchor in anchors {
            partners.clear();
            partners.extend(
                self.frames
                    .iter()
                    .filter(|(f, _)| (zone_start..zone_end).contains(f))
                    .flat_map(|(_, peaks)| peaks.iter())
                    .filter(|p| p.bin.abs_diff(anchor.bin) <= self.half_width),
            );
            partners.sort_by(|a, b| {
                a.frame
                    .cmp(&b.frame)
                    .then(a.bin.abs_diff(anchor.bin).cmp(&b.bin.abs_diff(anchor.bin)))
                    .then(a.bin.cmp(&b.bin))
            });

            for partner in partners.iter().take(self.fanout) {
                hashes.push(FingerprintHash {
                    hash: encode_hash(anchor.bin, partner.bin, partner.frame - anchor_frame),
                    frame: anchor_frame,
                    is_variation: false,
                });
            }
        }

        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peak(frame: usize, bin: usize) -> Peak {
        Peak {
            bin,
            frame,
            magnitude: 1.0,
        }
    }

    fn run(generator: &mut HashGenerator, frames: Vec<Vec<Peak>>) -> Vec<AnchorHashes> {
        let mut out = Vec::new();
        for (index, peaks) in frames.into_iter().enumerate() {
            out.extend(generator.push(index, peaks));
        }
        out.extend(generator.flush());
        out
    }

    #[test]
    fn hash_fields_survive_packing() {
        let hash = encode_hash(255, 17, 31);
        assert_eq!(decode_hash(hash), (255, 17, 31));
        assert_ne!(encode_hash(17, 255, 31), hash);
    }

    #[test]
    fn partners_come_from_target_zone_only() {
        // distance 2, length 3, width 10 -> frames [f+2, f+5), bins +-5
        let mut generator = HashGenerator::new(2, 3, 10, 10);
        let frames = vec![
            vec![peak(0, 100)],
            vec![peak(1, 100)],
            vec![peak(2, 104)],
            vec![peak(3, 106)],
            vec![peak(4, 95)],
            vec![peak(5, 100)],
        ];
        let out = run(&mut generator, frames);

        let first = &out[0];
        assert_eq!(first.frame, 0);
        let decoded: Vec<_> = first.hashes.iter().map(|h| decode_hash(h.hash)).collect();
        assert_eq!(decoded, vec![(100, 104, 2), (100, 95, 4)]);
        assert!(first.hashes.iter().all(|h| h.frame == 0 && !h.is_variation));
    }

    #[test]
    fn fanout_caps_pairs_per_anchor() {
        let mut generator = HashGenerator::new(1, 4, 63, 2);
        let frames: Vec<Vec<Peak>> = (0..8)
            .map(|f| vec![peak(f, 50), peak(f, 60), peak(f, 40)])
            .collect();
        let out = run(&mut generator, frames);

        for anchors in &out {
            assert!(anchors.hashes.len() <= 3 * 2);
        }
        // nearest frame first, then smallest bin distance
        let decoded: Vec<_> = out[0].hashes.iter().map(|h| decode_hash(h.hash)).collect();
        assert_eq!(decoded[0], (50, 50, 1));
        assert_eq!(decoded[1], (50, 40, 1));
    }

    #[test]
    fn anchors_wait_for_complete_zone() {
        let mut generator = HashGenerator::new(2, 3, 63, 5);
        for f in 0..4 {
            assert!(generator.push(f, vec![peak(f, 10)]).is_empty());
        }
        let done = generator.push(4, vec![peak(4, 10)]);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].frame, 0);
        assert_eq!(done[0].hashes.len(), 3);
        assert_eq!(generator.buffered_frames(), 4);

        let rest = generator.flush();
        assert_eq!(
            rest.iter().map(|a| a.frame).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(generator.buffered_frames(), 0);
    }

    #[test]
    fn generation_is_deterministic() {
        let frames: Vec<Vec<Peak>> = (0..40)
            .map(|f| {
                (0..3)
                    .map(|k| peak(f, (f * 7 + k * 31) % 256))
                    .collect()
            })
            .collect();

        let a = run(&mut HashGenerator::new(2, 30, 63, 5), frames.clone());
        let b = run(&mut HashGenerator::new(2, 30, 63, 5), frames);
        assert_eq!(a, b);
    }
}
