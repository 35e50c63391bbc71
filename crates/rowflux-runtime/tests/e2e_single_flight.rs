//! E2E: single-flight execution and latest-wins coalescing.
//!
//! Validates, against a gated surface that blocks inside `end_batch`:
//!
//! 1. Three rapid updates A/B/C while busy: A runs, B queues, C supersedes
//!    B (B resolves `Cancelled` immediately), and C — not B — runs after A.
//! 2. `update` never blocks the caller while a transaction is in flight.
//! 3. The exposed snapshot switches to the incoming data while the
//!    transaction is still running.
//! 4. Queued work survives a graceful shutdown.
//! 5. A rapid burst coalesces: every ticket resolves `Applied` or
//!    `Cancelled`, and the final snapshot is the last requested data.

#![forbid(unsafe_code)]

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rowflux_runtime::scheduler::{UpdateScheduler, UpdaterConfig};
use rowflux_runtime::surface::{InstantRefresher, RowSurface};
use rowflux_runtime::ticket::Ticket;
use rowflux_runtime::UpdateOutcome;

// ── Fixtures ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Begin,
    Insert(usize, usize),
    Remove(usize, usize),
    Move(usize, usize, usize),
    End,
}

/// Records every operation; `end_batch` blocks until the test sends a
/// completion token through the gate.
struct GatedSurface {
    ops: Arc<Mutex<Vec<Op>>>,
    gate: mpsc::Receiver<bool>,
}

impl RowSurface for GatedSurface {
    fn begin_batch(&mut self) {
        self.ops.lock().unwrap().push(Op::Begin);
    }

    fn insert_row(&mut self, partition: usize, index: usize) {
        self.ops.lock().unwrap().push(Op::Insert(partition, index));
    }

    fn remove_row(&mut self, partition: usize, index: usize) {
        self.ops.lock().unwrap().push(Op::Remove(partition, index));
    }

    fn move_row(&mut self, partition: usize, from: usize, to: usize) {
        self.ops.lock().unwrap().push(Op::Move(partition, from, to));
    }

    fn end_batch(&mut self) -> bool {
        self.ops.lock().unwrap().push(Op::End);
        self.gate.recv().unwrap_or(true)
    }
}

/// Accepts everything immediately.
struct OpenSurface;

impl RowSurface for OpenSurface {
    fn begin_batch(&mut self) {}
    fn insert_row(&mut self, _partition: usize, _index: usize) {}
    fn remove_row(&mut self, _partition: usize, _index: usize) {}
    fn move_row(&mut self, _partition: usize, _from: usize, _to: usize) {}
    fn end_batch(&mut self) -> bool {
        true
    }
}

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn begin_count(ops: &Mutex<Vec<Op>>) -> usize {
    ops.lock()
        .unwrap()
        .iter()
        .filter(|op| matches!(op, Op::Begin))
        .count()
}

// ── Tests ───────────────────────────────────────────────────────────────

#[test]
fn newer_request_supersedes_queued_request() {
    let (gate, gate_rx) = mpsc::channel();
    let ops = Arc::new(Mutex::new(Vec::new()));
    let scheduler = UpdateScheduler::start(
        vec![vec![1u32]],
        GatedSurface {
            ops: Arc::clone(&ops),
            gate: gate_rx,
        },
        InstantRefresher,
        UpdaterConfig::default(),
    );

    // A starts executing and blocks inside end_batch.
    let a = scheduler.update(vec![vec![1, 2]]);
    // B queues behind A; C supersedes B.
    let b = scheduler.update(vec![vec![1, 2, 3]]);
    let c = scheduler.update(vec![vec![9]]);

    // B is cancelled the moment C arrives, before A finishes.
    assert_eq!(b.wait(), Ok(UpdateOutcome::Cancelled));
    assert!(a.try_get().is_none(), "A must still be in flight");

    gate.send(true).unwrap();
    assert_eq!(a.wait(), Ok(UpdateOutcome::Applied));

    gate.send(true).unwrap();
    assert_eq!(c.wait(), Ok(UpdateOutcome::Applied));
    assert_eq!(scheduler.current(), vec![vec![9u32]]);

    let metrics = scheduler.metrics();
    assert_eq!(metrics.requests, 3);
    assert_eq!(metrics.applied, 2);
    assert_eq!(metrics.cancelled_pending, 1);

    scheduler.shutdown();

    // Exactly two transactions reached the surface: A and C. B never ran.
    assert_eq!(begin_count(&ops), 2);

    // A: [1] -> [1, 2] inserts row 1. C: [1, 2] -> [9] inserts 9 at 0 and
    // removes both old rows, all against pre-batch indices.
    let recorded = ops.lock().unwrap();
    assert_eq!(
        &*recorded,
        &[
            Op::Begin,
            Op::Insert(0, 1),
            Op::End,
            Op::Begin,
            Op::Insert(0, 0),
            Op::Remove(0, 0),
            Op::Remove(0, 1),
            Op::End,
        ]
    );
}

#[test]
fn update_never_blocks_the_caller() {
    let (gate, gate_rx) = mpsc::channel();
    let ops = Arc::new(Mutex::new(Vec::new()));
    let scheduler = UpdateScheduler::start(
        vec![vec![1u32]],
        GatedSurface {
            ops: Arc::clone(&ops),
            gate: gate_rx,
        },
        InstantRefresher,
        UpdaterConfig::default(),
    );

    let start = Instant::now();
    let first = scheduler.update(vec![vec![2]]);
    let second = scheduler.update(vec![vec![3]]);
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "update must return without waiting for the surface"
    );
    assert!(first.try_get().is_none());
    assert!(second.try_get().is_none());

    gate.send(true).unwrap();
    gate.send(true).unwrap();
    assert_eq!(first.wait(), Ok(UpdateOutcome::Applied));
    assert_eq!(second.wait(), Ok(UpdateOutcome::Applied));
    scheduler.shutdown();
}

#[test]
fn snapshot_switches_before_transaction_completes() {
    let (gate, gate_rx) = mpsc::channel();
    let ops = Arc::new(Mutex::new(Vec::new()));
    let scheduler = UpdateScheduler::start(
        vec![vec![1u32]],
        GatedSurface {
            ops: Arc::clone(&ops),
            gate: gate_rx,
        },
        InstantRefresher,
        UpdaterConfig::default(),
    );

    let ticket = scheduler.update(vec![vec![1, 2]]);

    // Wait for the transaction to reach end_batch, then observe the
    // snapshot while the surface is still holding the batch open.
    assert!(wait_until(Duration::from_secs(5), || {
        ops.lock().unwrap().contains(&Op::End)
    }));
    assert_eq!(scheduler.current(), vec![vec![1u32, 2]]);
    assert_eq!(scheduler.partitions(), 1);

    gate.send(true).unwrap();
    assert_eq!(ticket.wait(), Ok(UpdateOutcome::Applied));
    scheduler.shutdown();
}

#[test]
fn queued_update_survives_graceful_shutdown() {
    let (gate, gate_rx) = mpsc::channel();
    let ops = Arc::new(Mutex::new(Vec::new()));
    let scheduler = UpdateScheduler::start(
        vec![vec![1u32]],
        GatedSurface {
            ops: Arc::clone(&ops),
            gate: gate_rx,
        },
        InstantRefresher,
        UpdaterConfig::default(),
    );

    let active = scheduler.update(vec![vec![2]]);
    let queued = scheduler.update(vec![vec![3]]);

    // Both transactions can complete once shutdown begins.
    gate.send(true).unwrap();
    gate.send(true).unwrap();
    scheduler.shutdown();

    assert_eq!(active.wait(), Ok(UpdateOutcome::Applied));
    assert_eq!(queued.wait(), Ok(UpdateOutcome::Applied));
    assert_eq!(begin_count(&ops), 2);
}

#[test]
fn rapid_burst_coalesces_to_latest() {
    let scheduler = UpdateScheduler::start(
        vec![vec![0u32]],
        OpenSurface,
        InstantRefresher,
        UpdaterConfig::default(),
    );

    let tickets: Vec<Ticket<UpdateOutcome>> = (1..=50u32)
        .map(|n| scheduler.update(vec![(0..n).collect()]))
        .collect();

    let mut applied = 0u64;
    let mut cancelled = 0u64;
    for ticket in &tickets {
        match ticket.wait().unwrap() {
            UpdateOutcome::Applied => applied += 1,
            UpdateOutcome::Cancelled => cancelled += 1,
            UpdateOutcome::Failed(err) => panic!("unexpected failure: {err}"),
        }
    }

    // The last request is never superseded.
    assert_eq!(
        tickets.last().unwrap().wait(),
        Ok(UpdateOutcome::Applied)
    );
    assert_eq!(applied + cancelled, 50);
    assert_eq!(scheduler.current(), vec![(0..50u32).collect::<Vec<u32>>()]);

    let metrics = scheduler.metrics();
    assert_eq!(metrics.requests, 50);
    assert_eq!(metrics.applied, applied);
    assert_eq!(metrics.cancelled_pending, cancelled);
    scheduler.shutdown();
}
