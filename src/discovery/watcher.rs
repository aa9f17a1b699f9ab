//! Control-plane watcher.
//!
//! # Responsibilities
//! - Poll the backend lister once per interval
//! - Diff each snapshot against the previous one by identity
//! - Emit a `ChangeSet` only when something appeared or disappeared
//! - Signal readiness after the first successful fetch
//!
//! # Design Decisions
//! - Membership only: a backend present in both snapshots is never reported,
//!   even if its ports or labels changed
//! - A failed fetch is logged and retried on the next tick
//! - Stop is a request/acknowledge pair bounded by a timeout

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::discovery::backend::Backend;
use crate::discovery::lister::BackendLister;
use crate::observability::metrics;

/// Poll interval used when none (or zero) is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Backends keyed by identity (`namespace/name`).
pub type Snapshot = HashMap<String, Backend>;

/// The delta produced by one watcher tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: BTreeMap<String, Backend>,
    pub removed: BTreeMap<String, Backend>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compute appearances and disappearances between two snapshots.
pub fn diff(current: &Snapshot, next: &Snapshot) -> ChangeSet {
    let removed = current
        .iter()
        .filter(|(id, _)| !next.contains_key(*id))
        .map(|(id, b)| (id.clone(), b.clone()))
        .collect();
    let added = next
        .iter()
        .filter(|(id, _)| !current.contains_key(*id))
        .map(|(id, b)| (id.clone(), b.clone()))
        .collect();
    ChangeSet { added, removed }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher did not acknowledge stop within {0:?}")]
    StopTimeout(Duration),

    #[error("watcher exited before the first snapshot was loaded")]
    Closed,
}

/// Periodic poller over a `BackendLister`.
pub struct Watcher {
    lister: Arc<dyn BackendLister>,
    interval: Duration,
}

impl Watcher {
    /// Create a watcher. A missing or zero interval becomes `DEFAULT_INTERVAL`.
    pub fn new(lister: Arc<dyn BackendLister>, interval: Option<Duration>) -> Self {
        let interval = interval
            .filter(|i| !i.is_zero())
            .unwrap_or(DEFAULT_INTERVAL);
        Self { lister, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the poll loop. It runs until stopped or `cancel` fires.
    pub fn watch(self, cancel: CancellationToken) -> WatchHandle {
        let (changes_tx, changes_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::channel(1);

        let task = tokio::spawn(run(
            self.lister,
            self.interval,
            changes_tx,
            ready_tx,
            control_rx,
            cancel,
        ));

        WatchHandle {
            changes: Some(changes_rx),
            ready: ready_rx,
            control: control_tx,
            task,
        }
    }
}

/// Owner-side handle of a running watch loop.
pub struct WatchHandle {
    changes: Option<mpsc::Receiver<ChangeSet>>,
    ready: watch::Receiver<bool>,
    control: mpsc::Sender<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Wait until the first successful fetch has populated the snapshot.
    pub async fn ready(&mut self) -> Result<(), WatchError> {
        self.ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| WatchError::Closed)
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// A receiver that flips to `true` once the first snapshot is loaded.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    /// Take the change stream. Only the first call returns `Some`.
    pub fn take_changes(&mut self) -> Option<mpsc::Receiver<ChangeSet>> {
        self.changes.take()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the loop to exit and wait for its acknowledgement.
    pub async fn stop(&self, timeout: Duration) -> Result<(), WatchError> {
        let handshake = async {
            let (ack_tx, ack_rx) = oneshot::channel();
            if self.control.send(ack_tx).await.is_err() {
                // loop already gone
                return;
            }
            let _ = ack_rx.await;
        };

        time::timeout(timeout, handshake)
            .await
            .map_err(|_| WatchError::StopTimeout(timeout))
    }
}

fn acknowledge(ack: Option<oneshot::Sender<()>>) {
    tracing::info!("Watcher stopping");
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

async fn run(
    lister: Arc<dyn BackendLister>,
    interval: Duration,
    changes: mpsc::Sender<ChangeSet>,
    ready: watch::Sender<bool>,
    mut control: mpsc::Receiver<oneshot::Sender<()>>,
    cancel: CancellationToken,
) {
    tracing::info!(interval = ?interval, "Watcher starting");

    let mut snapshot = Snapshot::new();
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            ack = control.recv() => return acknowledge(ack),
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            biased;
            ack = control.recv() => return acknowledge(ack),
            _ = cancel.cancelled() => return,
            fetched = lister.list() => fetched,
        };

        let backends = match fetched {
            Ok(backends) => backends,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list backends, retrying next tick");
                metrics::record_watch_error();
                continue;
            }
        };

        let next: Snapshot = backends.into_iter().map(|b| (b.id(), b)).collect();
        let change_set = diff(&snapshot, &next);
        snapshot = next;

        if !change_set.is_empty() {
            tracing::debug!(
                added = change_set.added.len(),
                removed = change_set.removed.len(),
                "Backend set changed"
            );

            tokio::select! {
                biased;
                ack = control.recv() => return acknowledge(ack),
                _ = cancel.cancelled() => return,
                sent = changes.send(change_set) => {
                    if sent.is_err() {
                        tracing::debug!("Change receiver dropped, watcher exiting");
                        return;
                    }
                }
            }
        }

        // the first change set is queued before readiness flips
        if !*ready.borrow() {
            tracing::info!(backends = snapshot.len(), "Initial backend snapshot loaded");
            ready.send_replace(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::backend::{PortSpec, Protocol};
    use crate::discovery::lister::StaticLister;
    use std::collections::BTreeSet;

    fn backend(name: &str) -> Backend {
        Backend::new(name, "default").with_port(PortSpec::new(Protocol::Tcp, 80))
    }

    fn snapshot(names: &[&str]) -> Snapshot {
        names.iter().map(|n| backend(n)).map(|b| (b.id(), b)).collect()
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let a = snapshot(&["foo", "bar", "baz"]);
        assert!(diff(&a, &a).is_empty());
        assert!(diff(&Snapshot::new(), &Snapshot::new()).is_empty());
    }

    #[test]
    fn diff_reconstructs_next_membership() {
        let cases = [
            (vec!["a", "b", "c"], vec!["b", "c", "d"]),
            (vec![], vec!["x"]),
            (vec!["x"], vec![]),
            (vec!["a", "b"], vec!["c", "d"]),
        ];

        for (a, b) in cases {
            let (a, b) = (snapshot(&a), snapshot(&b));
            let changes = diff(&a, &b);

            let mut rebuilt: BTreeSet<String> = a
                .keys()
                .filter(|k| !changes.removed.contains_key(*k))
                .cloned()
                .collect();
            rebuilt.extend(changes.added.keys().cloned());

            let expected: BTreeSet<String> = b.keys().cloned().collect();
            assert_eq!(rebuilt, expected);
        }
    }

    #[test]
    fn diff_ignores_port_changes() {
        let a = snapshot(&["foo"]);
        let mut b = a.clone();
        b.get_mut("default/foo")
            .unwrap()
            .ports
            .push(PortSpec::new(Protocol::Tcp, 8080));
        assert!(diff(&a, &b).is_empty());
    }

    #[test]
    fn zero_interval_is_coerced() {
        let lister = Arc::new(StaticLister::default());
        assert_eq!(Watcher::new(lister.clone(), None).interval(), DEFAULT_INTERVAL);
        assert_eq!(
            Watcher::new(lister.clone(), Some(Duration::ZERO)).interval(),
            DEFAULT_INTERVAL
        );
        assert_eq!(
            Watcher::new(lister, Some(Duration::from_millis(20))).interval(),
            Duration::from_millis(20)
        );
    }

    #[tokio::test]
    async fn emits_added_then_removed() {
        let lister = Arc::new(StaticLister::new(vec![backend("foo")]));
        let mut handle = Watcher::new(lister.clone(), Some(Duration::from_millis(20)))
            .watch(CancellationToken::new());
        let mut changes = handle.take_changes().unwrap();

        handle.ready().await.unwrap();
        // queued before readiness
        let first = changes.try_recv().unwrap();
        assert_eq!(first.added.keys().collect::<Vec<_>>(), vec!["default/foo"]);
        assert!(first.removed.is_empty());

        lister.set_backends(Vec::new());
        let second = changes.recv().await.unwrap();
        assert!(second.added.is_empty());
        assert_eq!(second.removed.keys().collect::<Vec<_>>(), vec!["default/foo"]);

        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn unchanged_ticks_are_silent() {
        let lister = Arc::new(StaticLister::new(vec![backend("foo")]));
        let mut handle = Watcher::new(lister, Some(Duration::from_millis(10)))
            .watch(CancellationToken::new());
        let mut changes = handle.take_changes().unwrap();

        assert!(changes.recv().await.is_some());
        let next = time::timeout(Duration::from_millis(100), changes.recv()).await;
        assert!(next.is_err(), "no change set expected for an unchanged cluster");

        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_errors_do_not_stop_the_loop() {
        let lister = Arc::new(StaticLister::new(vec![backend("foo")]));
        lister.set_failing(true);
        let mut handle = Watcher::new(lister.clone(), Some(Duration::from_millis(10)))
            .watch(CancellationToken::new());
        let mut changes = handle.take_changes().unwrap();

        time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_ready());
        assert!(!handle.is_finished());

        lister.set_failing(false);
        handle.ready().await.unwrap();
        assert!(changes.recv().await.unwrap().added.contains_key("default/foo"));

        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_interrupts_a_slow_fetch() {
        let lister = Arc::new(StaticLister::new(vec![backend("foo")]));
        lister.set_delay(Some(Duration::from_secs(30)));
        let handle = Watcher::new(lister, Some(Duration::from_millis(10)))
            .watch(CancellationToken::new());

        time::sleep(Duration::from_millis(30)).await;
        let started = std::time::Instant::now();
        handle.stop(Duration::from_secs(1)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stop_after_cancel_is_ok() {
        let lister = Arc::new(StaticLister::default());
        let cancel = CancellationToken::new();
        let handle = Watcher::new(lister, Some(Duration::from_millis(10))).watch(cancel.clone());

        cancel.cancel();
        time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_finished());
        handle.stop(Duration::from_millis(100)).await.unwrap();
    }
}
