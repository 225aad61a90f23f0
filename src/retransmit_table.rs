// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sparse, row-indexed storage for seqno-keyed message slots.
//!
//! `RetransmitTable` is the data structure a [`crate::NakWindow`] stores
//! received messages in between arrival and delivery. It is addressed
//! by `seqno - offset`, split into `(row, column)` so that growth only
//! ever appends rows rather than reallocating a single flat array, and
//! so that `purge`/`compact` can drop whole dead rows from the front
//! without touching live entries.
//!
//! ```text
//! offset = 10, msgs_per_row = 4
//!
//! row 0: [10][11][12][13]
//! row 1: [14][15][16][17]
//! row 2: [18][19][  ][  ]   <- still growing
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tuning knobs for a [`RetransmitTable`].
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Initial number of rows to preallocate.
    pub num_rows: usize,
    /// Fixed width of every row.
    pub msgs_per_row: usize,
    /// Growth multiplier applied when more rows are needed.
    pub resize_factor: f64,
    /// Minimum time between automatic compactions.
    pub max_compaction_time: Duration,
    /// Whether `purge` triggers `compact` on its own once
    /// `max_compaction_time` has elapsed since the last compaction.
    pub automatic_purging: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            num_rows: 16,
            msgs_per_row: 64,
            resize_factor: 1.2,
            max_compaction_time: Duration::from_secs(30),
            automatic_purging: true,
        }
    }
}

/// A sparse, row-indexed buffer of message slots keyed by seqno.
pub struct RetransmitTable<M> {
    rows: VecDeque<Vec<Option<M>>>,
    /// Seqno represented by column 0 of the first live row.
    offset: u64,
    msgs_per_row: usize,
    resize_factor: f64,
    max_compaction_time: Duration,
    automatic_purging: bool,
    last_compaction: Instant,
    /// High-water mark of `purge()`; seqnos `<= purged_upto` read as
    /// absent even before `compact()` has physically released rows.
    purged_upto: Option<u64>,
    size: usize,
}

impl<M> RetransmitTable<M> {
    /// Creates a table whose first slot represents `offset`.
    pub fn new(config: TableConfig, offset: u64) -> Self {
        let num_rows = config.num_rows.max(1);
        let msgs_per_row = config.msgs_per_row.max(1);
        let mut rows = VecDeque::with_capacity(num_rows);
        for _ in 0..num_rows {
            rows.push_back(Self::empty_row(msgs_per_row));
        }
        Self {
            rows,
            offset,
            msgs_per_row,
            resize_factor: config.resize_factor.max(1.0),
            max_compaction_time: config.max_compaction_time,
            automatic_purging: config.automatic_purging,
            last_compaction: Instant::now(),
            purged_upto: None,
            size: 0,
        }
    }

    fn empty_row(width: usize) -> Vec<Option<M>> {
        let mut row = Vec::with_capacity(width);
        row.resize_with(width, || None);
        row
    }

    fn is_purged(&self, seqno: u64) -> bool {
        matches!(self.purged_upto, Some(p) if seqno <= p)
    }

    /// `(row, column)` for `seqno`, or `None` if `seqno < offset`.
    fn locate(&self, seqno: u64) -> Option<(usize, usize)> {
        if seqno < self.offset {
            return None;
        }
        let idx = (seqno - self.offset) as usize;
        Some((idx / self.msgs_per_row, idx % self.msgs_per_row))
    }

    fn ensure_capacity(&mut self, seqno: u64) {
        let (row, _) = match self.locate(seqno) {
            Some(rc) => rc,
            None => return,
        };
        if row < self.rows.len() {
            return;
        }
        let needed = row + 1;
        let grown = ((self.rows.len() as f64) * self.resize_factor).ceil() as usize;
        let target = needed.max(grown).max(self.rows.len() + 1);
        while self.rows.len() < target {
            self.rows.push_back(Self::empty_row(self.msgs_per_row));
        }
    }

    /// Inserts `msg` at `seqno`, overwriting any existing value. Grows
    /// the row array if `seqno` is beyond current capacity.
    pub fn put(&mut self, seqno: u64, msg: M) {
        if seqno < self.offset {
            return;
        }
        self.ensure_capacity(seqno);
        let (row, col) = self.locate(seqno).expect("capacity ensured above");
        let slot = &mut self.rows[row][col];
        if slot.is_none() {
            self.size += 1;
        }
        *slot = Some(msg);
    }

    /// Inserts `msg` at `seqno` only if that slot is currently null.
    /// Returns the slot's previous message if one was already present;
    /// the slot is left untouched in that case.
    pub fn put_if_absent(&mut self, seqno: u64, msg: M) -> Option<&M> {
        if seqno < self.offset || self.is_purged(seqno) {
            return None;
        }
        self.ensure_capacity(seqno);
        let (row, col) = self.locate(seqno).expect("capacity ensured above");
        if self.rows[row][col].is_some() {
            return self.rows[row][col].as_ref();
        }
        self.rows[row][col] = Some(msg);
        self.size += 1;
        None
    }

    /// Returns the message at `seqno`, or `None` for a gap, an
    /// unallocated seqno, or any seqno below `offset`.
    pub fn get(&self, seqno: u64) -> Option<&M> {
        if self.is_purged(seqno) {
            return None;
        }
        let (row, col) = self.locate(seqno)?;
        self.rows.get(row)?.get(col)?.as_ref()
    }

    /// Returns the non-null messages in `[from, to]`, in seqno order.
    pub fn get_range(&self, from: u64, to: u64) -> Vec<&M> {
        if to < from {
            return Vec::new();
        }
        (from..=to).filter_map(|s| self.get(s)).collect()
    }

    /// Removes and returns the message at `seqno`, if present.
    pub fn remove(&mut self, seqno: u64) -> Option<M> {
        if self.is_purged(seqno) {
            return None;
        }
        let (row, col) = self.locate(seqno)?;
        let slot = self.rows.get_mut(row)?.get_mut(col)?;
        let prev = slot.take();
        if prev.is_some() {
            self.size -= 1;
        }
        prev
    }

    /// Logically drops every seqno `<= seqno`. Rows are not physically
    /// released until [`Self::compact`] runs (manually, or
    /// automatically here if `automatic_purging` is set and
    /// `max_compaction_time` has elapsed since the last compaction).
    pub fn purge(&mut self, seqno: u64) {
        if seqno < self.offset {
            return;
        }
        let upto = seqno.min(self.offset + (self.rows.len() * self.msgs_per_row) as u64 - 1);
        for s in self.offset..=upto {
            if let Some((row, col)) = self.locate(s) {
                if let Some(slot) = self.rows.get_mut(row).and_then(|r| r.get_mut(col)) {
                    if slot.take().is_some() {
                        self.size -= 1;
                    }
                }
            }
        }
        self.purged_upto = Some(self.purged_upto.map_or(seqno, |p| p.max(seqno)));

        if self.automatic_purging && self.last_compaction.elapsed() >= self.max_compaction_time {
            self.compact();
        }
    }

    /// Physically releases any fully-purged leading rows and advances
    /// `offset` past them.
    pub fn compact(&mut self) {
        let Some(purged_upto) = self.purged_upto else {
            return;
        };
        let mut rows_released = 0usize;
        loop {
            let row_last_seqno = self.offset + (rows_released as u64 + 1) * self.msgs_per_row as u64 - 1;
            if row_last_seqno > purged_upto || self.rows.len() <= rows_released {
                break;
            }
            rows_released += 1;
        }
        for _ in 0..rows_released {
            self.rows.pop_front();
            self.rows.push_back(Self::empty_row(self.msgs_per_row));
            self.offset += self.msgs_per_row as u64;
        }
        self.last_compaction = Instant::now();
    }

    /// Number of present (non-null) slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total addressable slots currently allocated.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.rows.len() * self.msgs_per_row
    }

    /// `size() / capacity()`, or 0 if capacity is 0.
    #[must_use]
    pub fn fill_factor(&self) -> f64 {
        let cap = self.capacity();
        if cap == 0 {
            0.0
        } else {
            self.size as f64 / cap as f64
        }
    }

    /// Number of null (missing) slots in `[offset, upto]`.
    #[must_use]
    pub fn get_null_messages(&self, upto: u64) -> usize {
        if upto < self.offset {
            return 0;
        }
        (self.offset..=upto).filter(|s| self.get(*s).is_none()).count()
    }

    /// Current logical base: the seqno represented by column 0 of the
    /// first live row.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Clears every slot and resets to an empty table at `offset`.
    pub fn clear(&mut self, offset: u64) {
        let num_rows = self.rows.len().max(1);
        self.rows = VecDeque::with_capacity(num_rows);
        for _ in 0..num_rows {
            self.rows.push_back(Self::empty_row(self.msgs_per_row));
        }
        self.offset = offset;
        self.purged_upto = None;
        self.size = 0;
        self.last_compaction = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table(offset: u64) -> RetransmitTable<u32> {
        RetransmitTable::new(
            TableConfig {
                num_rows: 2,
                msgs_per_row: 4,
                resize_factor: 1.5,
                max_compaction_time: Duration::from_secs(3600),
                automatic_purging: false,
            },
            offset,
        )
    }

    #[test]
    fn put_and_get_round_trip() {
        let mut t = small_table(1);
        t.put(1, 100);
        t.put(2, 200);
        assert_eq!(t.get(1), Some(&100));
        assert_eq!(t.get(2), Some(&200));
        assert_eq!(t.get(3), None);
        assert_eq!(t.size(), 2);
    }

    #[test]
    fn get_below_offset_is_none() {
        let t = small_table(5);
        assert_eq!(t.get(1), None);
    }

    #[test]
    fn put_grows_rows_as_needed() {
        let mut t = small_table(1);
        t.put(20, 999);
        assert_eq!(t.get(20), Some(&999));
        assert!(t.capacity() >= 20);
    }

    #[test]
    fn put_if_absent_does_not_overwrite() {
        let mut t = small_table(1);
        t.put(1, 10);
        let prev = t.put_if_absent(1, 999);
        assert_eq!(prev, Some(&10));
        assert_eq!(t.get(1), Some(&10));

        let prev2 = t.put_if_absent(2, 20);
        assert_eq!(prev2, None);
        assert_eq!(t.get(2), Some(&20));
    }

    #[test]
    fn get_range_returns_only_present_in_order() {
        let mut t = small_table(1);
        t.put(1, 1);
        t.put(3, 3);
        let got = t.get_range(1, 4);
        assert_eq!(got, vec![&1, &3]);
    }

    #[test]
    fn remove_clears_slot_and_decrements_size() {
        let mut t = small_table(1);
        t.put(1, 7);
        assert_eq!(t.remove(1), Some(7));
        assert_eq!(t.get(1), None);
        assert_eq!(t.size(), 0);
        assert_eq!(t.remove(1), None);
    }

    #[test]
    fn purge_hides_seqnos_immediately() {
        let mut t = small_table(1);
        t.put(1, 1);
        t.put(2, 2);
        t.put(3, 3);
        t.purge(2);
        assert_eq!(t.get(1), None);
        assert_eq!(t.get(2), None);
        assert_eq!(t.get(3), Some(&3));
        assert_eq!(t.size(), 1);
    }

    #[test]
    fn compact_advances_offset_past_dead_rows() {
        let mut t = small_table(1);
        for s in 1..=8 {
            t.put(s, s as u32);
        }
        t.purge(4);
        let offset_before = t.offset();
        t.compact();
        assert!(t.offset() > offset_before);
        assert_eq!(t.get(5), Some(&5));
        assert_eq!(t.get(8), Some(&8));
    }

    #[test]
    fn get_null_messages_counts_gaps() {
        let mut t = small_table(1);
        t.put(1, 1);
        t.put(3, 3);
        assert_eq!(t.get_null_messages(3), 1);
    }

    #[test]
    fn fill_factor_tracks_size_over_capacity() {
        let mut t = small_table(1);
        assert_eq!(t.fill_factor(), 0.0);
        t.put(1, 1);
        assert!(t.fill_factor() > 0.0);
    }
}
