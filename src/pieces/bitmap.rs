//! Piece bitmap set
//!
//! A run-length encoded set of piece indices. Runs are kept in a `BTreeMap`
//! keyed by their first index, so range operations cost `O(log runs + touched runs)`
//! regardless of how many pieces the torrent has.

use std::collections::BTreeMap;
use std::fmt;

/// Ordered, compressed set of piece indices
///
/// Invariant: runs are non-empty, non-overlapping and never adjacent, so two
/// sets holding the same indices always have the same representation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PieceSet {
    /// run start -> run end (exclusive)
    runs: BTreeMap<u32, u32>,
}

impl PieceSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set holding `[start, end)`
    pub fn from_range(start: u32, end: u32) -> Self {
        let mut set = Self::new();
        set.add_range(start, end);
        set
    }

    /// Add a single piece
    pub fn add(&mut self, piece: u32) {
        self.add_range(piece, piece.saturating_add(1));
    }

    /// Add every piece in `[start, end)`
    pub fn add_range(&mut self, start: u32, end: u32) {
        if start >= end {
            return;
        }
        let mut start = start;
        let mut end = end;

        // Merge with a run starting before us that reaches our start.
        if let Some((&s, &e)) = self.runs.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.runs.remove(&s);
            }
        }

        // Swallow every run that starts inside (or right after) the new one.
        let swallowed: Vec<(u32, u32)> = self
            .runs
            .range(start..=end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in swallowed {
            end = end.max(e);
            self.runs.remove(&s);
        }

        self.runs.insert(start, end);
    }

    /// Remove a single piece
    pub fn remove(&mut self, piece: u32) {
        self.remove_range(piece, piece.saturating_add(1));
    }

    /// Remove every piece in `[start, end)`
    pub fn remove_range(&mut self, start: u32, end: u32) {
        if start >= end {
            return;
        }

        if let Some((&s, &e)) = self.runs.range(..start).next_back() {
            if e > start {
                self.runs.insert(s, start);
                if e > end {
                    self.runs.insert(end, e);
                    return;
                }
            }
        }

        let inside: Vec<(u32, u32)> = self
            .runs
            .range(start..end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in inside {
            self.runs.remove(&s);
            if e > end {
                self.runs.insert(end, e);
            }
        }
    }

    /// Remove every piece of `other` from this set
    pub fn subtract(&mut self, other: &PieceSet) -> &mut Self {
        for (start, end) in other.runs() {
            self.remove_range(start, end);
        }
        self
    }

    /// Keep only the pieces also present in `other`
    pub fn intersect(&mut self, other: &PieceSet) -> &mut Self {
        *self = self.intersection(other);
        self
    }

    /// Set difference as a new value
    pub fn difference(&self, other: &PieceSet) -> PieceSet {
        let mut out = self.clone();
        out.subtract(other);
        out
    }

    /// Set intersection as a new value
    pub fn intersection(&self, other: &PieceSet) -> PieceSet {
        let mut out = PieceSet::new();
        let mut a = self.runs().peekable();
        let mut b = other.runs().peekable();

        while let (Some(&(a_start, a_end)), Some(&(b_start, b_end))) = (a.peek(), b.peek()) {
            let start = a_start.max(b_start);
            let end = a_end.min(b_end);
            if start < end {
                out.runs.insert(start, end);
            }
            if a_end <= b_end {
                a.next();
            } else {
                b.next();
            }
        }

        out
    }

    /// Set union as a new value
    pub fn union(&self, other: &PieceSet) -> PieceSet {
        let mut out = self.clone();
        for (start, end) in other.runs() {
            out.add_range(start, end);
        }
        out
    }

    /// True if `piece` is in the set
    pub fn contains(&self, piece: u32) -> bool {
        self.runs
            .range(..=piece)
            .next_back()
            .map_or(false, |(_, &end)| piece < end)
    }

    /// True if the set shares at least one piece with `other`
    pub fn intersects(&self, other: &PieceSet) -> bool {
        other.runs().any(|(start, end)| self.intersects_range(start, end))
    }

    /// True if the set holds any piece of `[start, end)`
    pub fn intersects_range(&self, start: u32, end: u32) -> bool {
        if start >= end {
            return false;
        }
        if let Some((_, &e)) = self.runs.range(..=start).next_back() {
            if e > start {
                return true;
            }
        }
        self.runs.range(start..end).next().is_some()
    }

    /// True if every piece of this set is also in `other`
    pub fn is_subset(&self, other: &PieceSet) -> bool {
        self.difference(other).is_empty()
    }

    /// Number of pieces in the set
    pub fn len(&self) -> u64 {
        self.runs.iter().map(|(&s, &e)| u64::from(e - s)).sum()
    }

    /// True if the set holds no piece
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Smallest piece in the set
    pub fn first(&self) -> Option<u32> {
        self.runs.keys().next().copied()
    }

    /// Largest piece in the set
    pub fn last(&self) -> Option<u32> {
        self.runs.values().next_back().map(|&end| end - 1)
    }

    /// Remove every piece
    pub fn clear(&mut self) {
        self.runs.clear();
    }

    /// Ascending iterator over the contiguous runs as `(start, end)` pairs
    pub fn runs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.runs.iter().map(|(&s, &e)| (s, e))
    }

    /// Ascending iterator over the runs clipped to `[start, end)`
    pub fn runs_within(&self, start: u32, end: u32) -> impl Iterator<Item = (u32, u32)> + '_ {
        let first = self
            .runs
            .range(..=start)
            .next_back()
            .map_or(start, |(&s, _)| s);
        self.runs
            .range(first..end.max(first))
            .map(move |(&s, &e)| (s.max(start), e.min(end)))
            .filter(|(s, e)| s < e)
    }

    /// Ascending iterator over every piece
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.runs.iter().flat_map(|(&s, &e)| s..e)
    }
}

impl fmt::Debug for PieceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.runs().map(|(s, e)| s..e))
            .finish()
    }
}

impl FromIterator<u32> for PieceSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = PieceSet::new();
        for piece in iter {
            set.add(piece);
        }
        set
    }
}
