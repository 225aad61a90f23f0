// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-sender ordered-delivery receive window.
//!
//! `NakWindow` is the integration point between [`crate::RetransmitTable`]
//! (storage) and [`crate::Retransmitter`] (gap-recovery timing) behind
//! ordered-delivery semantics: `add`/`remove`/`stable`/digest.
//!
//! # Insertion cases
//!
//! ```text
//!                     seqno == highest_received + 1
//!                     +---------------------------+
//!                     |  case 1: expected next     |
//!                     |  store, bump highest_recv  |
//!                     +---------------------------+
//!
//! seqno <= highest_delivered      highest_delivered < seqno <= highest_received
//! +------------------------+      +--------------------------------------+
//! | case 2: already        |      | case 3: fills a known gap            |
//! | delivered -- discard   |      | put_if_absent; fire missing_message  |
//! +------------------------+      | _received outside the lock           |
//!                                 +--------------------------------------+
//!
//!                     seqno > highest_received + 1
//!                     +---------------------------------------+
//!                     |  case 4: ahead of expected              |
//!                     |  register [old_next..seqno-1] as a gap; |
//!                     |  fire message_gap_detected outside lock |
//!                     +---------------------------------------+
//! ```
//!
//! `highest_received` only advances on a *successful* insertion (cases
//! 1, 3-fresh, 4) -- never in an update-on-all-paths finally step, so
//! that `low <= highest_delivered <= highest_received` stays tight even
//! under concurrent late duplicates.

use crate::error::Error;
use crate::retransmit_table::{RetransmitTable, TableConfig};
use crate::retransmitter::{RetransmitCommand, Retransmitter, RetransmitterKind};
use crate::scheduler::TimeScheduler;
use crate::Interval;
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Optional observer of gap-creation and gap-fill events.
///
/// Both methods default to doing nothing, so a listener only needs to
/// implement the events it cares about. Methods are invoked strictly
/// outside the window's write lock (see [`NakWindow`] docs); a panic
/// inside one is caught and logged, never propagated.
pub trait NakWindowListener<Sender>: Send + Sync {
    /// A seqno that had been missing was just filled in (`add` case 3).
    fn missing_message_received(&self, _seqno: u64, _sender: &Sender) {}
    /// A new gap `[from, to)` was just created (`add` case 4).
    fn message_gap_detected(&self, _from: u64, _to: u64, _sender: &Sender) {}
}

enum ListenerEvent {
    MissingReceived(u64),
    GapDetected(u64, u64),
}

struct State<M> {
    low: u64,
    highest_delivered: u64,
    highest_received: u64,
    highest_stability_seqno: u64,
    running: bool,
    xmit_table: RetransmitTable<M>,
}

/// Per-sender ordered-delivery receive window with gap detection and
/// timer-driven retransmission requests.
///
/// Concurrency: a single [`parking_lot::RwLock`] protects `low`,
/// `highest_delivered`, `highest_received`, `highest_stability_seqno`
/// and the window's direct use of its `RetransmitTable` and
/// `Retransmitter`. Listener callbacks fire strictly after the lock is
/// released.
pub struct NakWindow<Sender, M> {
    sender: Sender,
    state: RwLock<State<M>>,
    retransmitter: Option<Retransmitter<Sender>>,
    listener: Option<Arc<dyn NakWindowListener<Sender>>>,
    total_messages: AtomicU64,
    smoothed_loss_rate: Mutex<Option<f64>>,
}

impl<Sender, M> NakWindow<Sender, M>
where
    Sender: Clone + Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
{
    /// Builds a window for `sender`.
    ///
    /// `retransmit_command` is optional: when absent, no
    /// [`Retransmitter`] is created at all and the upper protocol is
    /// expected to perform its own retransmission. `scheduler` is
    /// always required by the type system; the `Result` return is kept
    /// to surface future construction validation (today it only
    /// rejects `initial_highest_delivered < initial_low`, which would
    /// leave `low <= highest_delivered` false from the first snapshot).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender: Sender,
        retransmit_command: Option<Arc<dyn RetransmitCommand<Sender>>>,
        initial_highest_delivered: u64,
        initial_low: u64,
        scheduler: Arc<TimeScheduler>,
        variant: RetransmitterKind,
        table_config: TableConfig,
        timeouts: Interval,
    ) -> Result<Self, Error> {
        if initial_highest_delivered < initial_low {
            return Err(Error::InvalidRange {
                highest_delivered: initial_highest_delivered,
                low: initial_low,
            });
        }

        let retransmitter = retransmit_command.map(|command| {
            Retransmitter::new(variant, scheduler, command, sender.clone(), timeouts)
        });

        Ok(Self {
            sender,
            state: RwLock::new(State {
                low: initial_low,
                highest_delivered: initial_highest_delivered,
                highest_received: initial_highest_delivered,
                highest_stability_seqno: initial_low,
                running: true,
                xmit_table: RetransmitTable::new(table_config, initial_low + 1),
            }),
            retransmitter,
            listener: None,
            total_messages: AtomicU64::new(0),
            smoothed_loss_rate: Mutex::new(None),
        })
    }

    /// Attaches a listener. Replaces any previously attached listener.
    pub fn set_listener(&mut self, listener: Arc<dyn NakWindowListener<Sender>>) {
        self.listener = Some(listener);
    }

    fn dispatch(&self, event: ListenerEvent) {
        let Some(listener) = &self.listener else {
            return;
        };
        let sender = &self.sender;
        let result = panic::catch_unwind(AssertUnwindSafe(|| match event {
            ListenerEvent::MissingReceived(seqno) => {
                listener.missing_message_received(seqno, sender)
            }
            ListenerEvent::GapDetected(from, to) => {
                listener.message_gap_detected(from, to, sender)
            }
        }));
        if result.is_err() {
            log::warn!("naklib: NakWindowListener panicked, suppressing");
        }
    }

    /// Inserts a received message. See the module docs for the four
    /// cases. Returns `false` immediately if the window has been
    /// destroyed, if `seqno` is 0 (reserved), or if the message is a
    /// duplicate/stale arrival.
    pub fn add(&self, seqno: u64, msg: M) -> bool {
        if seqno == 0 {
            log::trace!("naklib: add rejected invalid seqno 0");
            return false;
        }

        let (accepted, event) = {
            let mut state = self.state.write();
            if !state.running {
                return false;
            }

            if seqno == state.highest_received + 1 {
                state.xmit_table.put(seqno, msg);
                state.highest_received = seqno;
                self.total_messages.fetch_add(1, Ordering::Relaxed);
                (true, None)
            } else if seqno <= state.highest_delivered {
                log::trace!("naklib: add({seqno}) already delivered, discarding");
                (false, None)
            } else if seqno <= state.highest_received {
                match state.xmit_table.put_if_absent(seqno, msg) {
                    Some(_existing) => {
                        log::trace!("naklib: add({seqno}) duplicate fill, discarding");
                        (false, None)
                    }
                    None => {
                        if let Some(rt) = &self.retransmitter {
                            rt.remove(seqno);
                        }
                        self.total_messages.fetch_add(1, Ordering::Relaxed);
                        (true, Some(ListenerEvent::MissingReceived(seqno)))
                    }
                }
            } else {
                let old_next = state.highest_received + 1;
                state.xmit_table.put(seqno, msg);
                log::debug!(
                    "naklib: add({seqno}) opened gap [{old_next}..{}], registering with retransmitter",
                    seqno - 1
                );
                if let Some(rt) = &self.retransmitter {
                    rt.add(old_next, seqno - 1);
                }
                state.highest_received = seqno;
                self.total_messages.fetch_add(1, Ordering::Relaxed);
                (true, Some(ListenerEvent::GapDetected(old_next, seqno)))
            }
        };

        if let Some(event) = event {
            self.dispatch(event);
        }
        accepted
    }

    /// Returns the message at `highest_delivered + 1`, advancing
    /// `highest_delivered` on success, or `None` if that slot is a gap.
    /// `physically_remove` chooses whether the slot is cleared from the
    /// table or merely read (cloned) and left in place.
    pub fn remove(&self, physically_remove: bool) -> Option<M> {
        let mut state = self.state.write();
        if !state.running {
            return None;
        }
        let next = state.highest_delivered + 1;
        let msg = if physically_remove {
            state.xmit_table.remove(next)
        } else {
            state.xmit_table.get(next).cloned()
        };
        if let Some(m) = msg {
            state.highest_delivered = next;
            Some(m)
        } else {
            None
        }
    }

    /// Greedily drains in-order messages, stopping at the first gap or
    /// once `max_results` (if non-zero) have been collected. If nothing
    /// was drained, `processing` (if given) is cleared. Returns `None`
    /// rather than an empty `Vec` to signal "nothing".
    pub fn remove_many(
        &self,
        processing: Option<&AtomicBool>,
        remove_msgs: bool,
        max_results: usize,
    ) -> Option<Vec<M>> {
        let mut state = self.state.write();
        if !state.running {
            if let Some(p) = processing {
                p.store(false, Ordering::Relaxed);
            }
            return None;
        }

        let mut results = Vec::new();
        loop {
            if max_results > 0 && results.len() >= max_results {
                break;
            }
            let next = state.highest_delivered + 1;
            let msg = if remove_msgs {
                state.xmit_table.remove(next)
            } else {
                state.xmit_table.get(next).cloned()
            };
            match msg {
                Some(m) => {
                    state.highest_delivered = next;
                    results.push(m);
                }
                None => break,
            }
        }

        if results.is_empty() {
            if let Some(p) = processing {
                p.store(false, Ordering::Relaxed);
            }
            None
        } else {
            Some(results)
        }
    }

    /// Marks every seqno `<= seqno` globally delivered: purges the
    /// table, removes those seqnos from the retransmitter, and raises
    /// `low`/`highest_stability_seqno` monotonically. A request above
    /// `highest_delivered` is warn-logged and ignored.
    pub fn stable(&self, seqno: u64) {
        let mut state = self.state.write();
        if seqno > state.highest_delivered {
            log::warn!(
                "naklib: stable({seqno}) rejected, highest_delivered={} < {seqno}",
                state.highest_delivered
            );
            return;
        }

        if let Some(rt) = &self.retransmitter {
            let from = state.low;
            for s in from..=seqno {
                rt.remove(s);
            }
        }
        state.xmit_table.purge(seqno);
        state.highest_stability_seqno = state.highest_stability_seqno.max(seqno);
        state.low = state.low.max(seqno);
    }

    /// Stops the window, cancels all retransmit tasks, clears all
    /// storage, and zeros every counter. Idempotent: calling it twice
    /// leaves the window in the same terminal state.
    pub fn destroy(&self) {
        let mut state = self.state.write();
        state.running = false;
        if let Some(rt) = &self.retransmitter {
            rt.reset();
        }
        state.xmit_table.clear(1);
        state.low = 0;
        state.highest_delivered = 0;
        state.highest_received = 0;
        state.highest_stability_seqno = 0;
    }

    /// Atomic snapshot `(low, highest_delivered, highest_received)`.
    #[must_use]
    pub fn get_digest(&self) -> (u64, u64, u64) {
        let state = self.state.read();
        (state.low, state.highest_delivered, state.highest_received)
    }

    /// Unconditionally overwrites `highest_delivered`, returning its
    /// previous value. Used by protocol bootstrap from a received
    /// digest; does not touch `low` or `highest_received`.
    pub fn set_highest_delivered(&self, value: u64) -> u64 {
        let mut state = self.state.write();
        std::mem::replace(&mut state.highest_delivered, value)
    }

    /// Read-only passthrough to the table.
    #[must_use]
    pub fn get(&self, seqno: u64) -> Option<M> {
        self.state.read().xmit_table.get(seqno).cloned()
    }

    /// Read-only passthrough to the table.
    #[must_use]
    pub fn get_range(&self, from: u64, to: u64) -> Vec<M> {
        self.state
            .read()
            .xmit_table
            .get_range(from, to)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Number of present (non-null) slots currently stored.
    #[must_use]
    pub fn size(&self) -> usize {
        self.state.read().xmit_table.size()
    }

    /// `pending_retransmits / total_messages`, or 0 if either is 0.
    #[must_use]
    pub fn get_loss_rate(&self) -> f64 {
        let pending = self.retransmitter.as_ref().map_or(0, Retransmitter::size) as f64;
        let total = self.total_messages.load(Ordering::Relaxed) as f64;
        if pending == 0.0 || total == 0.0 {
            0.0
        } else {
            pending / total
        }
    }

    /// EWMA of [`Self::get_loss_rate`]: `0.3 * old + 0.7 * new`, seeded
    /// with the first non-zero sample.
    pub fn get_smoothed_loss_rate(&self) -> f64 {
        let new = self.get_loss_rate();
        let mut smoothed = self.smoothed_loss_rate.lock();
        match *smoothed {
            None => {
                if new != 0.0 {
                    *smoothed = Some(new);
                }
                new
            }
            Some(old) => {
                let updated = 0.3 * old + 0.7 * new;
                *smoothed = Some(updated);
                updated
            }
        }
    }
}
