#![forbid(unsafe_code)]

//! Single-flight update scheduler with latest-wins coalescing.
//!
//! [`UpdateScheduler`] owns the presentation surface on a dedicated apply
//! thread and is the only place surface operations are issued — the
//! one-writer rule by construction. Callers hand it whole snapshots via
//! [`update`](UpdateScheduler::update); the scheduler diffs each partition
//! against the current snapshot, replays the structural delta as one
//! batched surface transaction, refreshes retained-but-changed rows, and
//! resolves the caller's [`Ticket`].
//!
//! # Coalescing Rules
//!
//! - At most one update executes at a time.
//! - At most one update is queued. A newer request supersedes the queued
//!   one, whose ticket resolves [`UpdateOutcome::Cancelled`] immediately.
//! - Queued data is not diffed until it becomes active; intermediate
//!   snapshots that were superseded are never applied at all.
//! - An update that started executing always reaches `Applied` or
//!   `Failed`, never `Cancelled`.
//!
//! # Snapshot visibility
//!
//! The exposed snapshot switches to the incoming data *before* the surface
//! transaction is issued, so concurrent reads during a transition observe
//! the new logical data. If the transition fails — the surface reports an
//! incomplete batch, or a refresh fails — the snapshot is reverted: after
//! a failure, [`current`](UpdateScheduler::current) equals the last
//! *successfully applied* data, because partial surface state is not
//! trusted. Retrying is the caller's decision via a new `update` call.
//!
//! # Execution context
//!
//! All scheduler state lives behind one mutex; every transition is a short
//! critical section. Transactions and refresh waits run on the apply
//! thread, which is also where tickets resolve — a caller blocking on
//! [`Ticket::wait`] continues strictly after the surface finished that
//! update.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use web_time::Instant;

use rowflux_diff::{DiffError, Difference, Identify};

use crate::surface::{RefreshError, RefreshResult, RowRefresher, RowSurface};
use crate::ticket::{self, Resolver, Ticket};

/// Apply-thread channel capacity. The state machine guarantees at most one
/// in-flight job message plus a shutdown marker.
const CHANNEL_CAPACITY: usize = 4;

// ─── Outcome & errors ────────────────────────────────────────────────────────

/// Final outcome of one update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The transaction and every refresh completed.
    Applied,
    /// The update ran but did not complete.
    Failed(UpdateError),
    /// The request was superseded while queued and never ran.
    Cancelled,
}

impl UpdateOutcome {
    /// Whether the update fully applied.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Why an update failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// The incoming snapshot's partition count differs from the current
    /// one. Partition structure is fixed across an update.
    PartitionMismatch {
        /// Partitions in the current snapshot.
        expected: usize,
        /// Partitions in the rejected snapshot.
        got: usize,
    },
    /// A partition contained two items with the same identity.
    DuplicateKey(DiffError),
    /// The surface reported that the batch did not complete.
    Transaction,
    /// A per-item refresh reported failure (first failure wins).
    Refresh(RefreshError),
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PartitionMismatch { expected, got } => write!(
                f,
                "partition count changed between updates (expected {expected}, got {got})"
            ),
            Self::DuplicateKey(err) => write!(f, "{err}"),
            Self::Transaction => f.write_str("batch update did not complete"),
            Self::Refresh(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for UpdateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DuplicateKey(err) => Some(err),
            Self::Refresh(err) => Some(err),
            Self::PartitionMismatch { .. } | Self::Transaction => None,
        }
    }
}

// ─── Config & metrics ────────────────────────────────────────────────────────

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterConfig {
    /// Forwarded to every refresh callback.
    pub animated: bool,
    /// Name of the apply thread.
    pub thread_name: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            animated: true,
            thread_name: "rowflux-apply".into(),
        }
    }
}

/// Counters for observability and triage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdaterMetrics {
    /// Update requests accepted (active or queued).
    pub requests: u64,
    /// Updates that resolved `Applied`.
    pub applied: u64,
    /// Updates that resolved `Failed`.
    pub failed: u64,
    /// Queued updates cancelled by a newer request or by shutdown.
    pub cancelled_pending: u64,
    /// Failures where the surface reported an incomplete batch.
    pub transaction_failures: u64,
    /// Refresh callbacks dispatched.
    pub refreshes_dispatched: u64,
    /// Refresh callbacks that failed (or were abandoned).
    pub refresh_failures: u64,
    /// Wall-clock microseconds the most recent update took to execute.
    pub last_apply_us: u64,
}

// ─── Internal state ──────────────────────────────────────────────────────────

/// One accepted update request.
struct Job<T> {
    data: Vec<Vec<T>>,
    resolver: Resolver<UpdateOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Active,
}

struct Shared<T> {
    phase: Phase,
    pending: Option<Job<T>>,
    current: Vec<Vec<T>>,
    metrics: UpdaterMetrics,
}

/// A poisoned lock means a panic elsewhere; the state value itself stays
/// consistent, so recover the guard.
fn lock<T>(shared: &Mutex<Shared<T>>) -> MutexGuard<'_, Shared<T>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Msg<T> {
    Run(Job<T>),
    Shutdown,
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

/// Serializes snapshot transitions against one presentation surface.
///
/// See the module docs for the coalescing and visibility rules.
pub struct UpdateScheduler<T: Identify> {
    shared: Arc<Mutex<Shared<T>>>,
    sender: mpsc::SyncSender<Msg<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T> UpdateScheduler<T>
where
    T: Identify + Clone + Send + 'static,
{
    /// Spawn the apply thread, transferring ownership of the surface and
    /// refresher. `initial` fixes the partition count for the scheduler's
    /// lifetime.
    pub fn start<S, R>(initial: Vec<Vec<T>>, surface: S, refresher: R, config: UpdaterConfig) -> Self
    where
        S: RowSurface + 'static,
        R: RowRefresher<T> + 'static,
    {
        let shared = Arc::new(Mutex::new(Shared {
            phase: Phase::Idle,
            pending: None,
            current: initial,
            metrics: UpdaterMetrics::default(),
        }));
        let (sender, receiver) = mpsc::sync_channel::<Msg<T>>(CHANNEL_CAPACITY);

        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || apply_loop(shared, receiver, surface, refresher, config))
                .expect("failed to spawn apply thread")
        };

        Self {
            shared,
            sender,
            handle: Some(handle),
        }
    }

    /// Request a transition to `new_data`.
    ///
    /// Never blocks. The returned ticket resolves on the apply thread once
    /// the request ran (`Applied` / `Failed`) or was superseded while
    /// queued (`Cancelled`).
    pub fn update(&self, new_data: Vec<Vec<T>>) -> Ticket<UpdateOutcome> {
        let (resolver, handle) = ticket::channel();
        let job = Job {
            data: new_data,
            resolver,
        };

        let mut shared = lock(&self.shared);
        shared.metrics.requests += 1;
        match shared.phase {
            Phase::Idle => {
                shared.phase = Phase::Active;
                drop(shared);
                trace!("update accepted while idle; dispatching");
                if let Err(mpsc::SendError(Msg::Run(job))) = self.sender.send(Msg::Run(job)) {
                    // Apply thread already gone (shutdown); the request
                    // never ran.
                    warn!("update arrived after shutdown; resolving cancelled");
                    let mut shared = lock(&self.shared);
                    shared.phase = Phase::Idle;
                    shared.metrics.cancelled_pending += 1;
                    job.resolver.resolve(UpdateOutcome::Cancelled);
                }
            }
            Phase::Active => {
                if let Some(superseded) = shared.pending.replace(job) {
                    shared.metrics.cancelled_pending += 1;
                    debug!("queued update superseded by newer request");
                    superseded.resolver.resolve(UpdateOutcome::Cancelled);
                } else {
                    trace!("update queued behind active request");
                }
            }
        }
        handle
    }

    /// Clone of the current per-partition snapshot.
    #[must_use]
    pub fn current(&self) -> Vec<Vec<T>> {
        lock(&self.shared).current.clone()
    }

    /// Run `f` against the current snapshot without cloning it.
    pub fn with_current<R>(&self, f: impl FnOnce(&[Vec<T>]) -> R) -> R {
        f(&lock(&self.shared).current)
    }

    /// Number of partitions the scheduler manages.
    #[must_use]
    pub fn partitions(&self) -> usize {
        lock(&self.shared).current.len()
    }

    /// Snapshot of the scheduler counters.
    #[must_use]
    pub fn metrics(&self) -> UpdaterMetrics {
        lock(&self.shared).metrics.clone()
    }

    /// Gracefully shut down: the active request and any already-queued
    /// request finish first, then the apply thread exits and is joined.
    pub fn shutdown(mut self) {
        let _ = self.sender.send(Msg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<T: Identify> Drop for UpdateScheduler<T> {
    fn drop(&mut self) {
        // Best-effort shutdown if the caller forgot to call shutdown().
        let _ = self.sender.send(Msg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ─── Apply thread ────────────────────────────────────────────────────────────

/// The apply thread's main loop: run the active job, then promote the
/// queued job (if any) and keep going, else return to idle.
fn apply_loop<T, S, R>(
    shared: Arc<Mutex<Shared<T>>>,
    receiver: mpsc::Receiver<Msg<T>>,
    mut surface: S,
    mut refresher: R,
    config: UpdaterConfig,
) where
    T: Identify + Clone,
    S: RowSurface,
    R: RowRefresher<T>,
{
    loop {
        let msg = match receiver.recv() {
            Ok(msg) => msg,
            Err(_) => return, // Sender dropped, exit cleanly.
        };
        let mut job = match msg {
            Msg::Run(job) => job,
            Msg::Shutdown => {
                drain_on_shutdown(&shared, &receiver);
                return;
            }
        };

        loop {
            run_update(&shared, &mut surface, &mut refresher, &config, job);

            let mut guard = lock(&shared);
            match guard.pending.take() {
                Some(next) => {
                    trace!("promoting queued update to active");
                    job = next;
                }
                None => {
                    guard.phase = Phase::Idle;
                    break;
                }
            }
        }
    }
}

/// Cancel anything still queued when shutdown is observed.
fn drain_on_shutdown<T: Identify>(shared: &Mutex<Shared<T>>, receiver: &mpsc::Receiver<Msg<T>>) {
    let mut guard = lock(shared);
    if let Some(job) = guard.pending.take() {
        guard.metrics.cancelled_pending += 1;
        job.resolver.resolve(UpdateOutcome::Cancelled);
    }
    guard.phase = Phase::Idle;
    drop(guard);

    while let Ok(msg) = receiver.try_recv() {
        if let Msg::Run(job) = msg {
            lock(shared).metrics.cancelled_pending += 1;
            job.resolver.resolve(UpdateOutcome::Cancelled);
        }
    }
}

/// Execute one active update end to end and resolve its ticket.
fn run_update<T, S, R>(
    shared: &Mutex<Shared<T>>,
    surface: &mut S,
    refresher: &mut R,
    config: &UpdaterConfig,
    job: Job<T>,
) where
    T: Identify + Clone,
    S: RowSurface,
    R: RowRefresher<T>,
{
    let Job { data, resolver } = job;
    let started = Instant::now();

    let previous: Vec<Vec<T>> = lock(shared).current.clone();

    // Partition structure is fixed across an update.
    if data.len() != previous.len() {
        warn!(
            expected = previous.len(),
            got = data.len(),
            "rejecting update: partition count changed"
        );
        let outcome = UpdateOutcome::Failed(UpdateError::PartitionMismatch {
            expected: previous.len(),
            got: data.len(),
        });
        finish(shared, &resolver, outcome, started);
        return;
    }

    // Diff every partition before touching the surface; a precondition
    // violation must not leave a half-issued batch behind.
    let mut diffs: SmallVec<[Difference<T>; 4]> = SmallVec::new();
    for (before, after) in previous.iter().zip(&data) {
        match Difference::compute(before, after) {
            Ok(diff) => diffs.push(diff),
            Err(err) => {
                warn!(error = %err, "rejecting update: duplicate identity");
                let outcome = UpdateOutcome::Failed(UpdateError::DuplicateKey(err));
                finish(shared, &resolver, outcome, started);
                return;
            }
        }
    }

    let operations: usize = diffs.iter().map(Difference::operation_count).sum();
    debug!(
        partitions = diffs.len(),
        operations, "applying update transaction"
    );

    // Expose the new logical data for the duration of the transaction.
    lock(shared).current = data;

    surface.begin_batch();
    for (partition, diff) in diffs.iter().enumerate() {
        for insertion in diff.inserted() {
            surface.insert_row(partition, insertion.target);
        }
        for removal in diff.removed() {
            surface.remove_row(partition, removal.source);
        }
        for mv in diff.moved() {
            surface.move_row(partition, mv.from, mv.to);
        }
    }
    let completed = surface.end_batch();

    if !completed {
        // Partial surface state is not trusted: the exposed snapshot rolls
        // back to the last successful data.
        warn!("surface batch did not complete; reverting snapshot");
        let mut guard = lock(shared);
        guard.current = previous;
        guard.metrics.transaction_failures += 1;
        drop(guard);
        finish(
            shared,
            &resolver,
            UpdateOutcome::Failed(UpdateError::Transaction),
            started,
        );
        return;
    }

    // Refresh pass: dispatch every changed retained row first, then await.
    let mut tickets: SmallVec<[Ticket<RefreshResult>; 8]> = SmallVec::new();
    for (partition, diff) in diffs.iter().enumerate() {
        for retention in diff.unmoved() {
            let counterpart = &previous[partition][retention.source];
            if retention.item.changed_since(counterpart) {
                tickets.push(refresher.refresh(partition, &retention.item, config.animated));
            }
        }
    }
    let dispatched = tickets.len() as u64;
    trace!(refreshes = dispatched, "awaiting refresh completions");

    let mut first_failure: Option<RefreshError> = None;
    let mut failures = 0u64;
    for ticket in &tickets {
        let result = match ticket.wait() {
            Ok(result) => result,
            Err(abandoned) => Err(RefreshError::new(abandoned.to_string())),
        };
        if let Err(err) = result {
            failures += 1;
            if first_failure.is_none() {
                // First failure wins; the ticket resolves now and later
                // results are drained and ignored.
                warn!(error = %err, "refresh failed");
                resolver.resolve(UpdateOutcome::Failed(UpdateError::Refresh(err.clone())));
                first_failure = Some(err);
            }
        }
    }

    if first_failure.is_some() {
        // Same distrust as a failed transaction: roll the snapshot back.
        let mut guard = lock(shared);
        guard.current = previous;
        guard.metrics.failed += 1;
        guard.metrics.refreshes_dispatched += dispatched;
        guard.metrics.refresh_failures += failures;
        guard.metrics.last_apply_us = elapsed_us(started);
        return;
    }

    resolver.resolve(UpdateOutcome::Applied);
    let mut guard = lock(shared);
    guard.metrics.applied += 1;
    guard.metrics.refreshes_dispatched += dispatched;
    guard.metrics.last_apply_us = elapsed_us(started);
    debug!(elapsed_us = guard.metrics.last_apply_us, "update applied");
}

/// Resolve a failed update and record terminal metrics.
fn finish<T: Identify>(
    shared: &Mutex<Shared<T>>,
    resolver: &Resolver<UpdateOutcome>,
    outcome: UpdateOutcome,
    started: Instant,
) {
    resolver.resolve(outcome);
    let mut guard = lock(shared);
    guard.metrics.failed += 1;
    guard.metrics.last_apply_us = elapsed_us(started);
}

fn elapsed_us(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_reports_applied() {
        assert!(UpdateOutcome::Applied.is_applied());
        assert!(!UpdateOutcome::Cancelled.is_applied());
        assert!(!UpdateOutcome::Failed(UpdateError::Transaction).is_applied());
    }

    #[test]
    fn errors_format_for_callers() {
        let mismatch = UpdateError::PartitionMismatch {
            expected: 2,
            got: 3,
        };
        assert_eq!(
            mismatch.to_string(),
            "partition count changed between updates (expected 2, got 3)"
        );
        assert_eq!(
            UpdateError::Transaction.to_string(),
            "batch update did not complete"
        );
        let refresh = UpdateError::Refresh(RefreshError::new("boom"));
        assert_eq!(refresh.to_string(), "refresh failed: boom");
    }

    #[test]
    fn default_config_animates() {
        let config = UpdaterConfig::default();
        assert!(config.animated);
        assert_eq!(config.thread_name, "rowflux-apply");
    }
}
