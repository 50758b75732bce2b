//! Single-series time-range search over a page
//!
//! The search narrows in three stages: the page bounding box rejects
//! non-overlapping queries outright, an interpolation search (with a
//! bounded binary-search fallback) positions the cursor inside the
//! sorted index prefix, and the unsorted index tail is scanned linearly
//! and merged into the output in direction-correct order. The tail is
//! expected to stay small between sorts.

use super::entry::{decode_entry, decode_key, EntryRef};
use super::offsets;
use super::{BoundingBox, INDEX_SLOT_SIZE};
use crate::{ParamId, ScanDirection, SearchQuery, TimeRange, Timestamp};
use bytes::Buf;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};

/// Below this window width interpolation stops paying for itself
const INTERPOLATION_CUTOFF: u32 = 16;

/// Probe counters collected by a single search
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStats {
    /// Interpolation probes performed
    pub interpolation_steps: u64,
    /// Probes that landed at or past the boundary
    pub interpolation_overshoots: u64,
    /// Probes that landed before the boundary
    pub interpolation_undershoots: u64,
    /// Binary-search probes performed
    pub binary_steps: u64,
    /// Entries emitted
    pub matches: u64,
}

/// Aggregated search counters, safe to update from concurrent readers
#[derive(Debug, Default)]
pub struct SearchStats {
    searches: AtomicU64,
    interpolation_steps: AtomicU64,
    interpolation_overshoots: AtomicU64,
    interpolation_undershoots: AtomicU64,
    binary_steps: AtomicU64,
    matches: AtomicU64,
}

impl SearchStats {
    /// Fold one search's probe counters into the aggregate
    pub fn record(&self, probe: &ProbeStats) {
        self.searches.fetch_add(1, Ordering::Relaxed);
        self.interpolation_steps
            .fetch_add(probe.interpolation_steps, Ordering::Relaxed);
        self.interpolation_overshoots
            .fetch_add(probe.interpolation_overshoots, Ordering::Relaxed);
        self.interpolation_undershoots
            .fetch_add(probe.interpolation_undershoots, Ordering::Relaxed);
        self.binary_steps.fetch_add(probe.binary_steps, Ordering::Relaxed);
        self.matches.fetch_add(probe.matches, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> SearchStatsSnapshot {
        SearchStatsSnapshot {
            searches: self.searches.load(Ordering::Relaxed),
            interpolation_steps: self.interpolation_steps.load(Ordering::Relaxed),
            interpolation_overshoots: self.interpolation_overshoots.load(Ordering::Relaxed),
            interpolation_undershoots: self.interpolation_undershoots.load(Ordering::Relaxed),
            binary_steps: self.binary_steps.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`SearchStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SearchStatsSnapshot {
    pub searches: u64,
    pub interpolation_steps: u64,
    pub interpolation_overshoots: u64,
    pub interpolation_undershoots: u64,
    pub binary_steps: u64,
    pub matches: u64,
}

/// Lazy cursor over the entries matching a [`SearchQuery`].
///
/// The cursor snapshots `count` and `sync_index` at creation; entries
/// appended afterwards are not observed. Back-pressure is supplied by
/// the caller reading from the iterator.
pub struct PageCursor<'a> {
    data: &'a [u8],
    query: SearchQuery,
    sync_snapshot: u32,
    /// Next sorted slot to consider: forward index, or backward
    /// one-past position
    sorted_pos: u32,
    /// Matching tail entries as (timestamp, offset), direction-ordered
    tail: Vec<(Timestamp, u32)>,
    tail_pos: usize,
    done: bool,
    stats: ProbeStats,
}

impl<'a> PageCursor<'a> {
    pub(crate) fn new(
        data: &'a [u8],
        count: u32,
        sync_index: u32,
        bbox: BoundingBox,
        query: SearchQuery,
    ) -> Self {
        let mut cursor = Self {
            data,
            query,
            sync_snapshot: sync_index,
            sorted_pos: 0,
            tail: Vec::new(),
            tail_pos: 0,
            done: false,
            stats: ProbeStats::default(),
        };

        let ts_box = TimeRange::new(bbox.min_timestamp, bbox.max_timestamp);
        if query.range.is_empty()
            || bbox.is_empty()
            || query.param < bbox.min_id
            || query.param > bbox.max_id
            || !query.range.overlaps(&ts_box)
        {
            cursor.done = true;
            return cursor;
        }

        cursor.sorted_pos = match query.direction {
            ScanDirection::Forward => boundary(
                data,
                sync_index,
                (query.param, query.range.start),
                false,
                &mut cursor.stats,
            ),
            ScanDirection::Backward => boundary(
                data,
                sync_index,
                (query.param, query.range.end),
                true,
                &mut cursor.stats,
            ),
        };

        cursor.collect_tail(count);
        cursor
    }

    /// Probe counters for this search
    pub fn probe_stats(&self) -> ProbeStats {
        self.stats
    }

    fn collect_tail(&mut self, count: u32) {
        let sync = self.sync_snapshot;
        let matches = |cursor: &Self, i: u32| -> Option<(Timestamp, u32)> {
            let offset = slot_offset(cursor.data, i)?;
            let (param, time) = decode_key(cursor.data, offset)?;
            if param == cursor.query.param && cursor.query.range.contains(time) {
                Some((time, offset))
            } else {
                None
            }
        };

        match self.query.direction {
            ScanDirection::Forward => {
                for i in sync..count {
                    if let Some(hit) = matches(self, i) {
                        self.tail.push(hit);
                    }
                }
                self.tail.sort_by_key(|&(time, _)| time);
            }
            ScanDirection::Backward => {
                for i in (sync..count).rev() {
                    if let Some(hit) = matches(self, i) {
                        self.tail.push(hit);
                    }
                }
                self.tail.sort_by_key(|&(time, _)| Reverse(time));
            }
        }
    }

    /// Key and offset of the next sorted-region entry still inside the
    /// window, if any
    fn peek_sorted(&self) -> Option<(Timestamp, u32)> {
        let slot = match self.query.direction {
            ScanDirection::Forward => {
                if self.sorted_pos >= self.sync_snapshot {
                    return None;
                }
                self.sorted_pos
            }
            ScanDirection::Backward => {
                if self.sorted_pos == 0 {
                    return None;
                }
                self.sorted_pos - 1
            }
        };

        let offset = slot_offset(self.data, slot)?;
        let (param, time) = decode_key(self.data, offset)?;
        if param != self.query.param {
            return None;
        }
        let in_window = match self.query.direction {
            ScanDirection::Forward => time <= self.query.range.end,
            ScanDirection::Backward => time >= self.query.range.start,
        };
        if !in_window {
            return None;
        }
        Some((time, offset))
    }

    fn advance_sorted(&mut self) {
        match self.query.direction {
            ScanDirection::Forward => self.sorted_pos += 1,
            ScanDirection::Backward => self.sorted_pos -= 1,
        }
    }
}

impl<'a> Iterator for PageCursor<'a> {
    type Item = EntryRef<'a>;

    fn next(&mut self) -> Option<EntryRef<'a>> {
        if self.done {
            return None;
        }

        let sorted = self.peek_sorted();
        let tail = self.tail.get(self.tail_pos).copied();

        let offset = match (sorted, tail) {
            (None, None) => {
                self.done = true;
                return None;
            }
            (Some((_, offset)), None) => {
                self.advance_sorted();
                offset
            }
            (None, Some((_, offset))) => {
                self.tail_pos += 1;
                offset
            }
            (Some((sorted_ts, sorted_off)), Some((tail_ts, tail_off))) => {
                let take_sorted = match self.query.direction {
                    // Ties go to the sorted region: those entries were
                    // inserted before the unsorted tail.
                    ScanDirection::Forward => sorted_ts <= tail_ts,
                    ScanDirection::Backward => sorted_ts > tail_ts,
                };
                if take_sorted {
                    self.advance_sorted();
                    sorted_off
                } else {
                    self.tail_pos += 1;
                    tail_off
                }
            }
        };

        match decode_entry(self.data, offset) {
            Ok(entry) => {
                self.stats.matches += 1;
                Some(entry)
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

fn slot_offset(data: &[u8], index: u32) -> Option<u32> {
    let off = offsets::INDEX + index as usize * INDEX_SLOT_SIZE;
    if off + INDEX_SLOT_SIZE > data.len() {
        return None;
    }
    Some((&data[off..off + 4]).get_u32_ne())
}

fn key_at(data: &[u8], index: u32) -> Option<(ParamId, Timestamp)> {
    decode_key(data, slot_offset(data, index)?)
}

/// Find the boundary slot in the sorted prefix `[0, n)`: the first index
/// whose key is `>= target` (`include_equal = false`) or `> target`
/// (`include_equal = true`).
///
/// Probes by interpolating over timestamps; the first probe landing at
/// or past the boundary falls back to a bounded binary search over the
/// remaining window. The interpolation widens to `i128` since timestamp
/// spans can cover almost the whole `i64` range.
fn boundary(
    data: &[u8],
    n: u32,
    target: (ParamId, Timestamp),
    include_equal: bool,
    stats: &mut ProbeStats,
) -> u32 {
    let before = |key: (ParamId, Timestamp)| -> bool {
        if include_equal {
            key <= target
        } else {
            key < target
        }
    };

    let mut lo = 0u32;
    let mut hi = n;
    let mut interpolating = true;

    while interpolating && hi - lo >= INTERPOLATION_CUTOFF {
        let first = match key_at(data, lo) {
            Some(key) => key,
            None => break,
        };
        let last = match key_at(data, hi - 1) {
            Some(key) => key,
            None => break,
        };

        if !before(first) {
            return lo;
        }
        if before(last) {
            return hi;
        }

        let span = last.1 as i128 - first.1 as i128;
        if span <= 0 {
            break;
        }
        let dist = (target.1 as i128 - first.1 as i128).clamp(0, span);
        let guess = lo + ((hi - 1 - lo) as i128 * dist / span) as u32;

        stats.interpolation_steps += 1;
        match key_at(data, guess) {
            Some(key) if before(key) => {
                stats.interpolation_undershoots += 1;
                lo = guess + 1;
            }
            _ => {
                stats.interpolation_overshoots += 1;
                hi = guess;
                interpolating = false;
            }
        }
    }

    while lo < hi {
        stats.binary_steps += 1;
        let mid = lo + (hi - lo) / 2;
        match key_at(data, mid) {
            Some(key) if before(key) => lo = mid + 1,
            _ => hi = mid,
        }
    }
    lo
}
