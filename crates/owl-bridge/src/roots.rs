//! Rendezvous between a native root provider and a host-side collector.
//!
//! The host's reclamation pass must observe which foreign objects the native
//! side still roots. One provider thread loops in [`RootExchangeCoordinator::provide`];
//! any number of collector threads take turns in [`RootExchangeCoordinator::collect`].
//! A single mutex owns the whole exchange state; two condvars separate
//! "provider has work" from "collector has an answer" wakeups so the two
//! roles never steal each other's notifications.
//!
//! A provider that stops looping while collectors depend on it is a
//! process-level failure: reclamation can no longer make progress, and
//! [`RootExchangeCoordinator::collect`] panics rather than letting the host
//! free objects the native side may still reach.

use owl_vm::RawRef;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// One delivered set of native roots.
///
/// Snapshots are sequence-numbered; a collector that exchanges twice is
/// guaranteed a strictly larger sequence the second time.
#[derive(Debug, Clone)]
pub struct RootSnapshot {
    seq: u64,
    roots: Vec<RawRef>,
}

impl RootSnapshot {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn roots(&self) -> &[RawRef] {
        &self.roots
    }

    pub fn size(&self) -> u32 {
        self.roots.len() as u32
    }
}

#[derive(Default)]
struct ExchangeState {
    provider_ready: bool,
    requested: bool,
    delivered: bool,
    provider_exited: bool,
    shutdown: bool,
    seq: u64,
    snapshot: Option<RootSnapshot>,
}

/// Coordinates root snapshots between one provider and its collectors.
#[derive(Default)]
pub struct RootExchangeCoordinator {
    state: Mutex<ExchangeState>,
    provider_wake: Condvar,
    collector_wake: Condvar,
}

/// Marks the provider as gone on every exit path, panicking included.
struct ExitGuard<'a>(&'a RootExchangeCoordinator);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.provider_ready = false;
        state.provider_exited = true;
        self.0.collector_wake.notify_all();
    }
}

impl RootExchangeCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the provider loop: answer every collector request with a fresh
    /// snapshot from `roots` until [`RootExchangeCoordinator::shutdown`].
    ///
    /// `roots` is called with the coordination lock held; the snapshot a
    /// collector receives is therefore never older than its own request.
    pub fn provide<F>(&self, mut roots: F)
    where
        F: FnMut() -> Vec<RawRef>,
    {
        let _exit = ExitGuard(self);
        let mut state = self.state.lock();
        loop {
            state.provider_ready = true;
            self.collector_wake.notify_all();

            while !state.requested && !state.shutdown {
                self.provider_wake.wait(&mut state);
            }
            if state.shutdown {
                debug!(served = state.seq, "root provider shutting down");
                return;
            }

            state.requested = false;
            state.provider_ready = false;
            state.seq += 1;
            let snapshot = RootSnapshot {
                seq: state.seq,
                roots: roots(),
            };
            trace!(seq = snapshot.seq, size = snapshot.size(), "roots delivered");
            state.snapshot = Some(snapshot);
            state.delivered = true;
            self.collector_wake.notify_all();
        }
    }

    /// Requests and takes one root snapshot, blocking until the provider
    /// delivers it.
    ///
    /// Requests are serialized: a collector arriving while another exchange
    /// is in flight waits for that exchange to finish first.
    ///
    /// # Panics
    ///
    /// Panics if the provider has exited, at the point of the request or at
    /// any time while waiting. There is no recovery from a dead provider.
    pub fn collect(&self) -> RootSnapshot {
        let mut state = self.state.lock();

        loop {
            assert!(
                !state.provider_exited,
                "root provider exited while collectors depend on it"
            );
            if state.provider_ready && !state.requested && state.snapshot.is_none() {
                break;
            }
            self.collector_wake.wait(&mut state);
        }

        state.requested = true;
        self.provider_wake.notify_all();

        while !state.delivered {
            assert!(
                !state.provider_exited,
                "root provider exited while a collector was waiting"
            );
            self.collector_wake.wait(&mut state);
        }

        state.delivered = false;
        let snapshot = state
            .snapshot
            .take()
            .unwrap_or_else(|| unreachable!("delivery flagged without a snapshot"));
        // Wake collectors queued behind this exchange.
        self.collector_wake.notify_all();
        snapshot
    }

    /// Asks the provider loop to return. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.provider_wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::RootExchangeCoordinator;

    #[test]
    fn test_exchange_delivers_the_provider_roots() {
        let coordinator = Arc::new(RootExchangeCoordinator::new());

        let provider = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.provide(|| vec![10, 20, 30]))
        };

        let snapshot = coordinator.collect();
        assert_eq!(snapshot.roots(), &[10, 20, 30]);
        assert_eq!(snapshot.size(), 3);
        assert_eq!(snapshot.seq(), 1);

        coordinator.shutdown();
        provider.join().unwrap();
    }

    #[test]
    fn test_repeated_exchanges_increase_the_sequence() {
        let coordinator = Arc::new(RootExchangeCoordinator::new());
        let calls = Arc::new(AtomicU64::new(0));

        let provider = {
            let coordinator = Arc::clone(&coordinator);
            let calls = Arc::clone(&calls);
            thread::spawn(move || {
                coordinator.provide(|| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    vec![n]
                });
            })
        };

        let mut last_seq = 0;
        for round in 0..64 {
            let snapshot = coordinator.collect();
            assert!(snapshot.seq() > last_seq);
            last_seq = snapshot.seq();
            assert_eq!(snapshot.roots(), &[round]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 64);

        coordinator.shutdown();
        provider.join().unwrap();
    }

    #[test]
    fn test_concurrent_collectors_each_get_a_distinct_snapshot() {
        let coordinator = Arc::new(RootExchangeCoordinator::new());

        let provider = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                coordinator.provide(|| {
                    // Stretch the in-flight window so the second request
                    // really does arrive mid-exchange.
                    thread::sleep(Duration::from_millis(10));
                    vec![7]
                });
            })
        };

        let collectors: Vec<_> = (0..2)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                thread::spawn(move || coordinator.collect().seq())
            })
            .collect();

        let mut seqs: Vec<u64> = collectors
            .into_iter()
            .map(|c| c.join().unwrap())
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2]);

        coordinator.shutdown();
        provider.join().unwrap();
    }

    #[test]
    fn test_collector_panics_when_the_provider_died() {
        let coordinator = Arc::new(RootExchangeCoordinator::new());

        // A provider that serves exactly one exchange and then exits.
        let provider = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                let mut served = false;
                coordinator.provide(|| {
                    served = true;
                    vec![1]
                });
                served
            })
        };

        // Shut the provider down after the first exchange.
        let first = coordinator.collect();
        assert_eq!(first.seq(), 1);
        coordinator.shutdown();
        assert!(provider.join().unwrap());

        let outcome = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.collect()).join()
        };
        assert!(outcome.is_err(), "collect after provider death must panic");
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let coordinator = Arc::new(RootExchangeCoordinator::new());
        let provider = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.provide(Vec::new))
        };

        coordinator.shutdown();
        coordinator.shutdown();
        provider.join().unwrap();
    }
}
