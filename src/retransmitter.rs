// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timer-driven retransmission scheduling.
//!
//! A [`Retransmitter`] owns one entry per outstanding gap and keeps
//! asking the transport to resend it, on an escalating backoff, until
//! the entry is removed (the gap filled, or the window purged past
//! it). The two variants -- [`RetransmitterKind::Default`], which
//! tracks one entry per missing seqno, and
//! [`RetransmitterKind::RangeBased`], which coalesces a contiguous run
//! of missing seqnos into a single entry -- are a closed set, modeled
//! here as a tagged enum with one shared operation surface rather than
//! as trait objects, since no third variant is expected.

use crate::interval::Interval;
use crate::scheduler::{TaskHandle, TimeScheduler};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The upper layer's retransmit-request callback:
/// `retransmit(first_seqno, last_seqno, sender)`.
pub trait RetransmitCommand<Sender>: Send + Sync {
    /// Invoked on every backoff tick for an outstanding gap.
    fn retransmit(&self, first: u64, last: u64, sender: &Sender);
}

impl<Sender, F> RetransmitCommand<Sender> for F
where
    F: Fn(u64, u64, &Sender) + Send + Sync,
{
    fn retransmit(&self, first: u64, last: u64, sender: &Sender) {
        self(first, last, sender)
    }
}

/// Which `Retransmitter` strategy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitterKind {
    /// One scheduled entry per missing seqno.
    Default,
    /// One scheduled entry per contiguous missing range.
    RangeBased,
}

struct Entry {
    handle: TaskHandle,
    fires: Arc<AtomicU64>,
}

fn spawn_entry<Sender>(
    scheduler: &TimeScheduler,
    mut interval: Interval,
    command: Arc<dyn RetransmitCommand<Sender>>,
    sender: Sender,
    first: u64,
    last: u64,
) -> Entry
where
    Sender: Clone + Send + Sync + 'static,
{
    let fires = Arc::new(AtomicU64::new(0));
    let fires_for_task = fires.clone();
    let first_delay = interval.next();
    let handle = scheduler.schedule_fixed_delay(first_delay, move || {
        fires_for_task.fetch_add(1, Ordering::Relaxed);
        command.retransmit(first, last, &sender);
        interval.next()
    });
    Entry { handle, fires }
}

/// One missing seqno (or range) per entry, timer-driven until removed.
///
/// See the module docs for why this is a tagged enum rather than a
/// trait object.
pub struct Retransmitter<Sender> {
    scheduler: Arc<TimeScheduler>,
    command: Arc<dyn RetransmitCommand<Sender>>,
    sender: Sender,
    timeouts_template: Mutex<Interval>,
    kind: RetransmitterKind,
    single: DashMap<u64, Entry>,
    ranges: Mutex<Vec<(u64, u64, Entry)>>,
    num_ranges_ever_added: AtomicU64,
    num_single_seqnos: AtomicU64,
    num_ranges_split: AtomicU64,
}

impl<Sender> Retransmitter<Sender>
where
    Sender: Clone + Send + Sync + 'static,
{
    /// Builds a retransmitter of the given `kind`.
    pub fn new(
        kind: RetransmitterKind,
        scheduler: Arc<TimeScheduler>,
        command: Arc<dyn RetransmitCommand<Sender>>,
        sender: Sender,
        timeouts: Interval,
    ) -> Self {
        Self {
            scheduler,
            command,
            sender,
            timeouts_template: Mutex::new(timeouts),
            kind,
            single: DashMap::new(),
            ranges: Mutex::new(Vec::new()),
            num_ranges_ever_added: AtomicU64::new(0),
            num_single_seqnos: AtomicU64::new(0),
            num_ranges_split: AtomicU64::new(0),
        }
    }

    fn fresh_interval(&self) -> Interval {
        self.timeouts_template.lock().clone()
    }

    /// Registers the range `[from, to]` as missing. Under
    /// [`RetransmitterKind::Default`] this expands into one entry per
    /// seqno; under [`RetransmitterKind::RangeBased`] a single entry
    /// covers the whole run. A seqno already tracked is left alone.
    pub fn add(&self, from: u64, to: u64) {
        if to < from {
            return;
        }
        match self.kind {
            RetransmitterKind::Default => {
                for seqno in from..=to {
                    if self.single.contains_key(&seqno) {
                        continue;
                    }
                    let entry = spawn_entry(
                        &self.scheduler,
                        self.fresh_interval(),
                        self.command.clone(),
                        self.sender.clone(),
                        seqno,
                        seqno,
                    );
                    self.single.insert(seqno, entry);
                }
            }
            RetransmitterKind::RangeBased => {
                let mut ranges = self.ranges.lock();
                let already_tracked = ranges.iter().any(|(a, b, _)| *a == from && *b == to);
                if already_tracked {
                    return;
                }
                let entry = spawn_entry(
                    &self.scheduler,
                    self.fresh_interval(),
                    self.command.clone(),
                    self.sender.clone(),
                    from,
                    to,
                );
                ranges.push((from, to, entry));
                self.num_ranges_ever_added.fetch_add(1, Ordering::Relaxed);
                if from == to {
                    self.num_single_seqnos.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Removes `seqno` from whatever entry currently covers it,
    /// returning the number of retransmit fires that entry had already
    /// made. Under [`RetransmitterKind::RangeBased`], removing a seqno
    /// from the middle of a range splits it into zero, one, or two
    /// remaining ranges.
    pub fn remove(&self, seqno: u64) -> usize {
        match self.kind {
            RetransmitterKind::Default => {
                if let Some((_, entry)) = self.single.remove(&seqno) {
                    self.scheduler.cancel(&entry.handle);
                    entry.fires.load(Ordering::Relaxed) as usize
                } else {
                    0
                }
            }
            RetransmitterKind::RangeBased => {
                let mut ranges = self.ranges.lock();
                let Some(idx) = ranges.iter().position(|(a, b, _)| seqno >= *a && seqno <= *b) else {
                    return 0;
                };
                let (a, b, entry) = ranges.remove(idx);
                self.scheduler.cancel(&entry.handle);
                let fires = entry.fires.load(Ordering::Relaxed) as usize;

                let left = (seqno > a).then(|| (a, seqno - 1));
                let right = (seqno < b).then(|| (seqno + 1, b));
                if left.is_some() && right.is_some() {
                    self.num_ranges_split.fetch_add(1, Ordering::Relaxed);
                }
                for (new_from, new_to) in [left, right].into_iter().flatten() {
                    let new_entry = spawn_entry(
                        &self.scheduler,
                        self.fresh_interval(),
                        self.command.clone(),
                        self.sender.clone(),
                        new_from,
                        new_to,
                    );
                    ranges.push((new_from, new_to, new_entry));
                    self.num_ranges_ever_added.fetch_add(1, Ordering::Relaxed);
                    if new_from == new_to {
                        self.num_single_seqnos.fetch_add(1, Ordering::Relaxed);
                    }
                }
                fires
            }
        }
    }

    /// Cancels every outstanding entry.
    pub fn reset(&self) {
        match self.kind {
            RetransmitterKind::Default => {
                for entry in self.single.iter() {
                    self.scheduler.cancel(&entry.handle);
                }
                self.single.clear();
            }
            RetransmitterKind::RangeBased => {
                let mut ranges = self.ranges.lock();
                for (_, _, entry) in ranges.drain(..) {
                    self.scheduler.cancel(&entry.handle);
                }
            }
        }
    }

    /// Installs the backoff sequence used by entries created from now
    /// on. Entries already scheduled keep their own cursor.
    pub fn set_retransmit_timeouts(&self, timeouts: Interval) {
        *self.timeouts_template.lock() = timeouts;
    }

    /// Number of distinct missing seqnos currently tracked -- for
    /// `RangeBased` this is the sum of range lengths, matching
    /// `Default`'s unit exactly (see the design notes on this choice).
    #[must_use]
    pub fn size(&self) -> usize {
        match self.kind {
            RetransmitterKind::Default => self.single.len(),
            RetransmitterKind::RangeBased => self
                .ranges
                .lock()
                .iter()
                .map(|(a, b, _)| (b - a + 1) as usize)
                .sum(),
        }
    }

    /// A printable summary of `RangeBased` lifetime statistics. Always
    /// available; reports zeros under `Default`.
    #[must_use]
    pub fn stats(&self) -> String {
        format!(
            "ranges_ever_added={} single_seqnos={} ranges_split={}",
            self.num_ranges_ever_added.load(Ordering::Relaxed),
            self.num_single_seqnos.load(Ordering::Relaxed),
            self.num_ranges_split.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_command() -> (Arc<dyn RetransmitCommand<u32>>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let cmd = move |_first: u64, _last: u64, _sender: &u32| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        };
        (Arc::new(cmd), calls)
    }

    #[test]
    fn default_add_creates_one_entry_per_seqno() {
        let scheduler = Arc::new(TimeScheduler::new(2));
        let (cmd, _calls) = counting_command();
        let rt = Retransmitter::new(
            RetransmitterKind::Default,
            scheduler,
            cmd,
            1u32,
            Interval::from_millis(&[1000]),
        );
        rt.add(2, 4);
        assert_eq!(rt.size(), 3);
        rt.add(3, 3);
        assert_eq!(rt.size(), 3, "duplicate registration is a no-op");
    }

    #[test]
    fn default_remove_cancels_entry() {
        let scheduler = Arc::new(TimeScheduler::new(2));
        let (cmd, _calls) = counting_command();
        let rt = Retransmitter::new(
            RetransmitterKind::Default,
            scheduler,
            cmd,
            1u32,
            Interval::from_millis(&[1000]),
        );
        rt.add(2, 4);
        rt.remove(3);
        assert_eq!(rt.size(), 2);
        assert_eq!(rt.remove(3), 0);
    }

    #[test]
    fn range_based_add_keeps_single_range() {
        let scheduler = Arc::new(TimeScheduler::new(2));
        let (cmd, _calls) = counting_command();
        let rt = Retransmitter::new(
            RetransmitterKind::RangeBased,
            scheduler,
            cmd,
            1u32,
            Interval::from_millis(&[1000]),
        );
        rt.add(2, 6);
        assert_eq!(rt.size(), 5);
        assert_eq!(rt.ranges.lock().len(), 1);
    }

    #[test]
    fn range_based_remove_splits_middle() {
        let scheduler = Arc::new(TimeScheduler::new(2));
        let (cmd, _calls) = counting_command();
        let rt = Retransmitter::new(
            RetransmitterKind::RangeBased,
            scheduler,
            cmd,
            1u32,
            Interval::from_millis(&[1000]),
        );
        rt.add(2, 6);
        rt.remove(4);
        assert_eq!(rt.size(), 4);
        let ranges = rt.ranges.lock();
        assert_eq!(ranges.len(), 2);
        assert!(ranges.iter().any(|(a, b, _)| *a == 2 && *b == 3));
        assert!(ranges.iter().any(|(a, b, _)| *a == 5 && *b == 6));
    }

    #[test]
    fn range_based_remove_at_edge_does_not_split() {
        let scheduler = Arc::new(TimeScheduler::new(2));
        let (cmd, _calls) = counting_command();
        let rt = Retransmitter::new(
            RetransmitterKind::RangeBased,
            scheduler,
            cmd,
            1u32,
            Interval::from_millis(&[1000]),
        );
        rt.add(2, 6);
        rt.remove(2);
        assert_eq!(rt.size(), 4);
        let ranges = rt.ranges.lock();
        assert_eq!(ranges.len(), 1);
        assert!(ranges.iter().any(|(a, b, _)| *a == 3 && *b == 6));
    }

    #[test]
    fn fires_accumulate_before_removal() {
        let scheduler = Arc::new(TimeScheduler::new(2));
        let (cmd, calls) = counting_command();
        let rt = Retransmitter::new(
            RetransmitterKind::Default,
            scheduler,
            cmd,
            1u32,
            Interval::from_millis(&[5]),
        );
        rt.add(1, 1);
        std::thread::sleep(Duration::from_millis(40));
        assert!(calls.load(Ordering::SeqCst) >= 2);
        let fires = rt.remove(1);
        assert!(fires >= 2);
    }

    #[test]
    fn reset_cancels_everything() {
        let scheduler = Arc::new(TimeScheduler::new(2));
        let (cmd, _calls) = counting_command();
        let rt = Retransmitter::new(
            RetransmitterKind::Default,
            scheduler,
            cmd,
            1u32,
            Interval::from_millis(&[1000]),
        );
        rt.add(1, 5);
        rt.reset();
        assert_eq!(rt.size(), 0);
    }
}
