// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lifecycle manager for external gateway stub connections.
//!
//! `RouterStubManager` illustrates the same timer-driven retry
//! discipline as [`crate::Retransmitter`] at a different scale: instead
//! of re-requesting missing seqnos, it keeps a set of `RouterStub`
//! connections alive, reconnecting broken ones and pinging live ones on
//! a shared [`crate::TimeScheduler`].
//!
//! The stub list is copy-on-write (read-mostly, `ArcSwap`); the task
//! map is a lock-free concurrent map (`DashMap`) holding at most one
//! scheduled task per stub. Replacement follows `cancel(old);
//! put_if_absent(new)` deliberately: a caller that loses the race
//! leaves the previously-scheduled task in place rather than risking
//! two tasks racing on the same stub.

use crate::error::Error;
use crate::scheduler::{TaskHandle, TimeScheduler};
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identity of a `RouterStub`: enough to tell two registrations apart
/// and to test "equal previously registered stub" on re-registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StubId {
    host: String,
    port: u16,
    bind_addr: String,
}

/// Connection lifecycle state of a [`RouterStub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Broken = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Broken,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// A connection handle to an external gossip/router server.
///
/// The actual network I/O to the router is the out-of-scope transport
/// layer; this type models the connection's lifecycle state and the
/// downward operations the manager drives it with.
pub struct RouterStub {
    id: StubId,
    state: AtomicU8,
}

impl RouterStub {
    /// Builds a disconnected stub for `host:port` bound to `bind_addr`.
    pub fn new(host: impl Into<String>, port: u16, bind_addr: impl Into<String>) -> Self {
        Self {
            id: StubId {
                host: host.into(),
                port,
                bind_addr: bind_addr.into(),
            },
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
        }
    }

    /// This stub's identity.
    #[must_use]
    pub fn id(&self) -> &StubId {
        &self.id
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Attempts to connect using a resolved physical address.
    pub fn connect(
        &self,
        _channel: &str,
        _logical_address: &str,
        _logical_name: &str,
        physical_addrs: &[String],
    ) -> Result<(), Error> {
        if physical_addrs.is_empty() {
            self.state
                .store(ConnectionState::Connecting as u8, Ordering::Relaxed);
            return Err(Error::Connect {
                reason: "no physical address resolved".into(),
            });
        }
        self.state
            .store(ConnectionState::Connected as u8, Ordering::Relaxed);
        Ok(())
    }

    /// Best-effort disconnect.
    pub fn disconnect(&self, _channel: &str, _logical_address: &str) -> Result<(), Error> {
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::Relaxed);
        Ok(())
    }

    /// Pings a connected stub to confirm liveness.
    pub fn check_connection(&self) -> Result<(), Error> {
        if self.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(Error::Connect {
                reason: "stub not connected".into(),
            })
        }
    }

    /// Marks the stub disconnected and releases any held resources.
    pub fn destroy(&self) {
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::Relaxed);
    }

    /// Interrupts any in-flight worker operation. No-op here: this
    /// stub model has no blocking worker thread of its own.
    pub fn interrupt(&self) {}

    /// Waits up to `timeout` for a disconnect acknowledgment.
    /// Always succeeds immediately in this stub model.
    pub fn join(&self, _timeout: Duration) -> bool {
        true
    }
}

/// Lifecycle manager for a dynamic set of [`RouterStub`]s.
pub struct RouterStubManager {
    scheduler: Arc<TimeScheduler>,
    stubs: ArcSwap<Vec<Arc<RouterStub>>>,
    tasks: DashMap<StubId, TaskHandle>,
    interval: Duration,
}

impl RouterStubManager {
    /// Builds a manager driving reconnect/ping tasks every `interval`
    /// on `scheduler`.
    pub fn new(scheduler: Arc<TimeScheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            stubs: ArcSwap::from_pointee(Vec::new()),
            tasks: DashMap::new(),
            interval,
        }
    }

    /// Constructs a stub, destroys and replaces any equal previously
    /// registered stub, and registers the new one.
    pub fn create_and_register(
        &self,
        host: impl Into<String>,
        port: u16,
        bind_addr: impl Into<String>,
    ) -> Arc<RouterStub> {
        let stub = Arc::new(RouterStub::new(host, port, bind_addr));
        self.unregister_and_destroy(stub.id());
        self.register(stub.clone());
        stub
    }

    /// Adds `stub` to the registry, replacing any stub with the same
    /// identity.
    pub fn register(&self, stub: Arc<RouterStub>) {
        self.stubs.rcu(|current| {
            let mut next: Vec<Arc<RouterStub>> =
                current.iter().filter(|s| s.id() != stub.id()).cloned().collect();
            next.push(stub.clone());
            next
        });
    }

    /// Removes and returns the stub with identity `id`, if registered.
    pub fn unregister(&self, id: &StubId) -> Option<Arc<RouterStub>> {
        let mut removed = None;
        self.stubs.rcu(|current| {
            let mut next = Vec::with_capacity(current.len());
            for s in current.iter() {
                if s.id() == id {
                    removed = Some(s.clone());
                } else {
                    next.push(s.clone());
                }
            }
            next
        });
        removed
    }

    /// Unregisters and destroys the stub with identity `id`. Returns
    /// `true` if a stub was found.
    pub fn unregister_and_destroy(&self, id: &StubId) -> bool {
        match self.unregister(id) {
            Some(stub) => {
                self.cancel_task(id);
                stub.destroy();
                true
            }
            None => false,
        }
    }

    /// Best-effort disconnect of every registered stub; failures are
    /// logged and swallowed.
    pub fn disconnect_all(&self) {
        for stub in self.stubs.load().iter() {
            if let Err(e) = stub.disconnect("default", &stub.id().host) {
                log::warn!("naklib: disconnect_all failed for {:?}: {e}", stub.id());
            }
        }
    }

    /// Stops every per-stub periodic task, destroys every stub, and
    /// clears the registry.
    pub fn destroy_all(&self) {
        let stubs = self.stubs.swap(Arc::new(Vec::new()));
        for stub in stubs.iter() {
            self.cancel_task(stub.id());
            stub.destroy();
        }
    }

    fn cancel_task(&self, id: &StubId) {
        if let Some((_, handle)) = self.tasks.remove(id) {
            self.scheduler.cancel(&handle);
        }
    }

    /// Cancels any prior task for `stub`, then installs `new_handle`
    /// only if no other task has since been registered for it
    /// (`cancel(old); put_if_absent(new)` -- see the module docs on
    /// why a lost race is accepted rather than guarded against).
    fn replace_task(&self, id: StubId, new_handle: TaskHandle) {
        self.cancel_task(&id);
        match self.tasks.entry(id) {
            DashEntry::Occupied(_) => self.scheduler.cancel(&new_handle),
            DashEntry::Vacant(v) => {
                v.insert(new_handle);
            }
        }
    }

    /// Schedules a fixed-delay task that resolves `stub`'s logical
    /// address to a physical one and attempts to connect, every
    /// `interval` ms, warn-logging and retrying on failure.
    pub fn start_reconnecting(&self, stub: Arc<RouterStub>) {
        let interval = self.interval;
        let stub_for_task = stub.clone();
        let handle = self.scheduler.schedule_fixed_delay(interval, move || {
            let physical = resolve_physical_address(&stub_for_task.id().host);
            if let Err(e) = stub_for_task.connect(
                "default",
                &stub_for_task.id().host,
                &stub_for_task.id().host,
                &physical,
            ) {
                log::warn!("naklib: reconnect failed for {:?}: {e}", stub_for_task.id());
            }
            interval
        });
        self.replace_task(stub.id().clone(), handle);
    }

    /// Cancels any reconnect task for `stub` and installs a pinger
    /// task: first fire after 1s, then every `interval` ms, calling
    /// `check_connection` and warn-logging on failure.
    pub fn stop_reconnecting(&self, stub: Arc<RouterStub>) {
        let interval = self.interval;
        let stub_for_task = stub.clone();
        let handle = self
            .scheduler
            .schedule_fixed_delay(Duration::from_secs(1), move || {
                if let Err(e) = stub_for_task.check_connection() {
                    log::warn!("naklib: ping failed for {:?}: {e}", stub_for_task.id());
                }
                interval
            });
        self.replace_task(stub.id().clone(), handle);
    }

    /// Reacts to an externally observed state transition for `stub`.
    pub fn connection_status_change(&self, stub: Arc<RouterStub>, new_state: ConnectionState) {
        match new_state {
            ConnectionState::Broken => {
                stub.interrupt();
                stub.destroy();
                self.start_reconnecting(stub);
            }
            ConnectionState::Connected => {
                self.stop_reconnecting(stub);
            }
            ConnectionState::Disconnected => {
                self.cancel_task(stub.id());
                stub.join(self.interval);
            }
            ConnectionState::Connecting => {}
        }
    }

    /// Number of stubs currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stubs.load().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stubs.load().is_empty()
    }
}

/// Resolves a logical address to a physical one via the upward
/// `GET_PHYSICAL_ADDRESS` control event. The control plane this queries
/// is the out-of-scope protocol layer above; here it degenerates to
/// echoing the logical host back as its own physical address.
fn resolve_physical_address(logical_address: &str) -> Vec<String> {
    vec![logical_address.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager() -> RouterStubManager {
        RouterStubManager::new(Arc::new(TimeScheduler::new(2)), Duration::from_millis(20))
    }

    #[test]
    fn register_and_unregister_round_trip() {
        let mgr = manager();
        let stub = mgr.create_and_register("router.example", 7000, "0.0.0.0:0");
        assert_eq!(mgr.len(), 1);

        let removed = mgr.unregister(stub.id());
        assert!(removed.is_some());
        assert!(mgr.is_empty());
    }

    #[test]
    fn create_and_register_replaces_equal_stub() {
        let mgr = manager();
        let first = mgr.create_and_register("router.example", 7000, "0.0.0.0:0");
        first.connect("c", "l", "n", &["1.2.3.4".into()]).unwrap();
        assert_eq!(first.state(), ConnectionState::Connected);

        let second = mgr.create_and_register("router.example", 7000, "0.0.0.0:0");
        assert_eq!(mgr.len(), 1, "replacement keeps exactly one stub for this identity");
        assert_eq!(first.state(), ConnectionState::Disconnected, "old stub destroyed");
        assert_eq!(second.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn unregister_and_destroy_reports_found() {
        let mgr = manager();
        let stub = mgr.create_and_register("router.example", 7000, "0.0.0.0:0");
        assert!(mgr.unregister_and_destroy(stub.id()));
        assert!(!mgr.unregister_and_destroy(stub.id()));
    }

    #[test]
    fn start_reconnecting_eventually_connects() {
        let mgr = manager();
        let stub = mgr.create_and_register("router.example", 7000, "0.0.0.0:0");
        mgr.start_reconnecting(stub.clone());

        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while stub.state() != ConnectionState::Connected && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stub.state(), ConnectionState::Connected);
    }

    #[test]
    fn connection_status_change_broken_triggers_reconnect() {
        let mgr = manager();
        let stub = mgr.create_and_register("router.example", 7000, "0.0.0.0:0");
        mgr.connection_status_change(stub.clone(), ConnectionState::Broken);

        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while stub.state() != ConnectionState::Connected && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stub.state(), ConnectionState::Connected);
    }

    #[test]
    fn destroy_all_clears_registry_and_tasks() {
        let mgr = manager();
        let stub = mgr.create_and_register("router.example", 7000, "0.0.0.0:0");
        mgr.start_reconnecting(stub.clone());
        mgr.destroy_all();
        assert!(mgr.is_empty());
        assert_eq!(stub.state(), ConnectionState::Disconnected);
    }
}
