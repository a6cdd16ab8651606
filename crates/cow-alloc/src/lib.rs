#![forbid(unsafe_code)]
//! Free-space tracking.
//!
//! [`FreeSpaceMap`] is an ordered set of disjoint, half-open free ranges
//! `[start, end)` over a device's block address space.
//!
//! ## Invariants
//!
//! - Ranges never overlap and are never empty.
//! - Adjacent ranges are always merged: for any two stored ranges `a < b`,
//!   `a.end < b.start`.
//! - `free_blocks()` equals the sum of all range lengths.
//!
//! The map holds no persistence logic and no notion of transactions; the
//! managed device keeps separate committed and pending maps and decides
//! when frees become visible.

use cow_error::{CowError, Result};
use cow_types::BlockNumber;
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::trace;

/// Registry of free block ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeSpaceMap {
    /// start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
    free_blocks: u64,
}

impl FreeSpaceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A map with `[start, end)` free.
    #[must_use]
    pub fn with_free_range(start: u64, end: u64) -> Self {
        let mut map = Self::new();
        if start < end {
            map.ranges.insert(start, end);
            map.free_blocks = end - start;
        }
        map
    }

    /// Total free blocks.
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    /// Number of disjoint free ranges.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Free ranges in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(start, end)| *start..*end)
    }

    /// Length of the free range ending exactly at `end`, if any.
    ///
    /// Used to size device growth: a trailing free range merges with the
    /// newly added blocks.
    #[must_use]
    pub fn free_run_ending_at(&self, end: u64) -> u64 {
        self.ranges
            .range(..end)
            .next_back()
            .filter(|(_, e)| **e == end)
            .map_or(0, |(s, e)| e - s)
    }

    /// True iff `[index, index + count)` lies inside one free range.
    #[must_use]
    pub fn is_free(&self, index: u64, count: u64) -> bool {
        let Some(end) = index.checked_add(count) else {
            return false;
        };
        match self.ranges.range(..=index).next_back() {
            Some((_, range_end)) => end <= *range_end,
            None => false,
        }
    }

    /// True iff any block of `[index, index + count)` is free.
    #[must_use]
    pub fn intersects(&self, index: u64, count: u64) -> bool {
        if count == 0 {
            return false;
        }
        self.overlaps(index, index.saturating_add(count))
    }

    /// Start of the lowest free range that can hold `count` blocks.
    #[must_use]
    pub fn find_first_fit(&self, count: u64) -> Option<u64> {
        self.ranges
            .iter()
            .find(|(start, end)| *end - *start >= count)
            .map(|(start, _)| *start)
    }

    /// Carve `count` contiguous blocks from the first range large enough.
    ///
    /// Returns `OutOfSpace` when no single range fits; the caller decides
    /// whether to grow the device.
    pub fn allocate(&mut self, count: u64) -> Result<BlockNumber> {
        if count == 0 {
            return Err(CowError::InvalidArgument(
                "allocation count must be > 0".to_owned(),
            ));
        }
        let start = self
            .find_first_fit(count)
            .ok_or(CowError::OutOfSpace { requested: count })?;
        let end = self.ranges.remove(&start).unwrap_or(start);
        let new_start = start + count;
        if new_start < end {
            self.ranges.insert(new_start, end);
        }
        self.free_blocks -= count;
        trace!(
            target: "cow::alloc",
            event = "range_allocate",
            start,
            count,
            free_blocks = self.free_blocks
        );
        Ok(BlockNumber(start))
    }

    /// Return `[index, index + count)` to the map, merging with neighbours.
    ///
    /// Freeing a block that is already free is rejected.
    pub fn free(&mut self, index: u64, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let end = index.checked_add(count).ok_or_else(|| {
            CowError::InvalidArgument(format!("free range at {index} overflows u64"))
        })?;
        if self.overlaps(index, end) {
            return Err(CowError::InvalidArgument(format!(
                "double free: [{index}, {end}) overlaps a free range"
            )));
        }

        let mut start = index;
        let mut stop = end;
        if let Some((prev_start, prev_end)) = self
            .ranges
            .range(..index)
            .next_back()
            .map(|(s, e)| (*s, *e))
        {
            if prev_end == index {
                self.ranges.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_end) = self.ranges.remove(&end) {
            stop = next_end;
        }
        self.ranges.insert(start, stop);
        self.free_blocks += count;
        trace!(
            target: "cow::alloc",
            event = "range_free",
            index,
            count,
            merged_start = start,
            merged_end = stop
        );
        Ok(())
    }

    /// Free every range of `other` into `self`.
    pub fn merge_from(&mut self, other: &Self) -> Result<()> {
        for range in other.ranges() {
            self.free(range.start, range.end - range.start)?;
        }
        Ok(())
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        if let Some((_, prev_end)) = self.ranges.range(..=start).next_back() {
            if *prev_end > start {
                return true;
            }
        }
        self.ranges.range(start..end).next().is_some()
    }
}
