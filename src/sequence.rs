// ============================================================================
// SLICE/INTERPOLANT SEQUENCE — depth-sorted alternation with staleness rules
// ============================================================================

use crate::interval::Interval3;
use crate::label::ForegroundPredicate;
use crate::mask::{Slice, SliceSnapshot};
use crate::ops::interpolate::Interpolant;

/// Depth comparisons treat anything closer than this as the same plane.
pub const DEPTH_EPS: f64 = 1e-6;

/// One entry of the sequence. Exhaustive matching over this enum is what
/// keeps the alternation rule enforceable: an interpolant is only ever
/// legal directly between the two slices whose depths bound its span.
pub enum SequenceEntry {
    Slice { depth: f64, slice: Slice },
    Interpolant(Interpolant),
}

impl SequenceEntry {
    /// Sort key: a slice sits at its depth, an interpolant strictly between
    /// its two endpoints.
    fn key(&self) -> f64 {
        match self {
            SequenceEntry::Slice { depth, .. } => *depth,
            SequenceEntry::Interpolant(ip) => {
                let (lo, hi) = ip.span();
                (lo + hi) * 0.5
            }
        }
    }
}

/// Ordered alternation of (depth, Slice) and Interpolant entries, sorted
/// ascending by depth.
///
/// Invariant: an Interpolant exists only directly between two Slice
/// entries; inserting, removing or mutating a Slice invalidates (removes)
/// its adjacent Interpolant(s). All mutations happen under the session
/// lock.
#[derive(Default)]
pub struct SliceSequence {
    entries: Vec<SequenceEntry>,
}

impl SliceSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn slice_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, SequenceEntry::Slice { .. }))
            .count()
    }

    pub fn interpolant_count(&self) -> usize {
        self.entries.len() - self.slice_count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Ascending depths of all slice entries.
    pub fn slice_depths(&self) -> Vec<f64> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                SequenceEntry::Slice { depth, .. } => Some(*depth),
                SequenceEntry::Interpolant(_) => None,
            })
            .collect()
    }

    fn slice_index(&self, depth: f64, eps: f64) -> Option<usize> {
        self.entries.iter().position(|e| {
            matches!(e, SequenceEntry::Slice { depth: d, .. } if (d - depth).abs() <= eps)
        })
    }

    /// Exact-depth lookup (within `eps`).
    pub fn slice_at(&self, depth: f64, eps: f64) -> Option<&Slice> {
        self.slice_index(depth, eps).map(|i| match &self.entries[i] {
            SequenceEntry::Slice { slice, .. } => slice,
            SequenceEntry::Interpolant(_) => unreachable!(),
        })
    }

    pub fn slice_at_mut(&mut self, depth: f64, eps: f64) -> Option<&mut Slice> {
        let i = self.slice_index(depth, eps)?;
        match &mut self.entries[i] {
            SequenceEntry::Slice { slice, .. } => Some(slice),
            SequenceEntry::Interpolant(_) => unreachable!(),
        }
    }

    /// Closest slice strictly below `depth`.
    pub fn previous_slice(&self, depth: f64) -> Option<(f64, &Slice)> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                SequenceEntry::Slice { depth: d, slice } if *d < depth - DEPTH_EPS => {
                    Some((*d, slice))
                }
                _ => None,
            })
            .last()
    }

    /// Closest slice strictly above `depth`.
    pub fn next_slice(&self, depth: f64) -> Option<(f64, &Slice)> {
        self.entries.iter().find_map(|e| match e {
            SequenceEntry::Slice { depth: d, slice } if *d > depth + DEPTH_EPS => {
                Some((*d, slice))
            }
            _ => None,
        })
    }

    /// The interpolant whose span contains `depth` (endpoints included).
    pub fn interpolant_between(&self, depth: f64) -> Option<&Interpolant> {
        self.entries.iter().find_map(|e| match e {
            SequenceEntry::Interpolant(ip) => {
                let (lo, hi) = ip.span();
                (depth >= lo - DEPTH_EPS && depth <= hi + DEPTH_EPS).then_some(ip)
            }
            _ => None,
        })
    }

    pub fn interpolants(&self) -> impl Iterator<Item = &Interpolant> {
        self.entries.iter().filter_map(|e| match e {
            SequenceEntry::Interpolant(ip) => Some(ip),
            SequenceEntry::Slice { .. } => None,
        })
    }

    pub fn slices_mut(&mut self) -> impl Iterator<Item = (f64, &mut Slice)> {
        self.entries.iter_mut().filter_map(|e| match e {
            SequenceEntry::Slice { depth, slice } => Some((*depth, slice)),
            SequenceEntry::Interpolant(_) => None,
        })
    }

    /// Depth-ordered insert. Any interpolant spanning across the new depth
    /// is stale by definition and removed.
    pub fn insert_slice(&mut self, depth: f64, slice: Slice) {
        debug_assert!(depth.is_finite());
        debug_assert!(
            self.slice_index(depth, DEPTH_EPS).is_none(),
            "caller must merge into an existing slice at the same depth"
        );
        self.entries.retain(|e| match e {
            SequenceEntry::Interpolant(ip) => {
                let (lo, hi) = ip.span();
                !(lo < depth && depth < hi)
            }
            SequenceEntry::Slice { .. } => true,
        });
        let pos = self
            .entries
            .iter()
            .position(|e| e.key() > depth)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, SequenceEntry::Slice { depth, slice });
        self.debug_validate();
    }

    /// Insert a computed interpolant between its two defining slices.
    /// Refused (false) when either neighbor no longer exists or the gap
    /// contains another slice; an existing interpolant in the gap is
    /// replaced.
    pub fn insert_interpolant(&mut self, ip: Interpolant) -> bool {
        let (lo, hi) = ip.span();
        let Some(lo_idx) = self.slice_index(lo, DEPTH_EPS) else {
            log::debug!("dropping interpolant for vanished slice at depth {lo}");
            return false;
        };
        match self.entries.get(lo_idx + 1) {
            Some(SequenceEntry::Slice { depth, .. }) if (depth - hi).abs() <= DEPTH_EPS => {
                self.entries
                    .insert(lo_idx + 1, SequenceEntry::Interpolant(ip));
            }
            Some(SequenceEntry::Interpolant(old)) if (old.span().1 - hi).abs() <= DEPTH_EPS => {
                self.entries[lo_idx + 1] = SequenceEntry::Interpolant(ip);
            }
            _ => {
                log::debug!("dropping interpolant {lo}..{hi}: neighbors changed");
                return false;
            }
        }
        self.debug_validate();
        true
    }

    /// Remove the slice at `depth` together with both flanking interpolants.
    pub fn remove_slice_at(&mut self, depth: f64, eps: f64) -> Option<Slice> {
        let idx = self.slice_index(depth, eps)?;
        let mut start = idx;
        let mut end = idx + 1;
        if idx > 0 && matches!(self.entries[idx - 1], SequenceEntry::Interpolant(_)) {
            start -= 1;
        }
        if end < self.entries.len()
            && matches!(self.entries[end], SequenceEntry::Interpolant(_))
        {
            end += 1;
        }
        let mut removed = None;
        for entry in self.entries.drain(start..end) {
            if let SequenceEntry::Slice { slice, .. } = entry {
                removed = Some(slice);
            }
        }
        self.debug_validate();
        removed
    }

    /// Remove the interpolant whose span contains `depth`, if any.
    pub fn remove_interpolant_near(&mut self, depth: f64) -> Option<Interpolant> {
        let idx = self.entries.iter().position(|e| match e {
            SequenceEntry::Interpolant(ip) => {
                let (lo, hi) = ip.span();
                depth >= lo - DEPTH_EPS && depth <= hi + DEPTH_EPS
            }
            SequenceEntry::Slice { .. } => false,
        })?;
        match self.entries.remove(idx) {
            SequenceEntry::Interpolant(ip) => Some(ip),
            SequenceEntry::Slice { .. } => unreachable!(),
        }
    }

    /// Drop every interpolant flanking the slice at `depth`. Called after
    /// any mutation of that slice, before the next sweep runs.
    pub fn remove_interpolants_adjacent_to(&mut self, depth: f64) {
        self.entries.retain(|e| match e {
            SequenceEntry::Interpolant(ip) => {
                let (lo, hi) = ip.span();
                let flanks = (lo - depth).abs() <= DEPTH_EPS || (hi - depth).abs() <= DEPTH_EPS;
                let spans = lo < depth && depth < hi;
                !(flanks || spans)
            }
            SequenceEntry::Slice { .. } => true,
        });
    }

    pub fn clear_interpolants(&mut self) {
        self.entries
            .retain(|e| matches!(e, SequenceEntry::Slice { .. }));
    }

    /// Frozen, depth-ordered copies of every slice for a sweep.
    pub fn snapshots(&mut self, predicate: &ForegroundPredicate) -> Vec<SliceSnapshot> {
        self.entries
            .iter_mut()
            .filter_map(|e| match e {
                SequenceEntry::Slice { depth, slice } => {
                    Some(slice.snapshot(*depth, predicate))
                }
                SequenceEntry::Interpolant(_) => None,
            })
            .collect()
    }

    /// Union of all slices' supports in global/source coordinates.
    pub fn global_support(&mut self, predicate: &ForegroundPredicate) -> Option<Interval3> {
        let mut out = None;
        for (_, slice) in self.slices_mut() {
            out = Interval3::union_opt(out, slice.global_support(predicate));
        }
        out
    }

    /// Alternation + ordering walk, active in debug builds and tests.
    fn debug_validate(&self) {
        if cfg!(debug_assertions) {
            let mut prev_key = f64::NEG_INFINITY;
            for (i, entry) in self.entries.iter().enumerate() {
                let key = entry.key();
                assert!(key > prev_key, "sequence keys out of order at {i}");
                prev_key = key;
                if let SequenceEntry::Interpolant(ip) = entry {
                    let (lo, hi) = ip.span();
                    let before = i
                        .checked_sub(1)
                        .and_then(|j| self.entries.get(j));
                    let after = self.entries.get(i + 1);
                    assert!(
                        matches!(before, Some(SequenceEntry::Slice { depth, .. })
                            if (depth - lo).abs() <= DEPTH_EPS),
                        "interpolant at {i} lacks its lower slice"
                    );
                    assert!(
                        matches!(after, Some(SequenceEntry::Slice { depth, .. })
                            if (depth - hi).abs() <= DEPTH_EPS),
                        "interpolant at {i} lacks its upper slice"
                    );
                }
            }
        }
    }
}
