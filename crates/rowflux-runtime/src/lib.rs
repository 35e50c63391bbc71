#![forbid(unsafe_code)]

//! Update runtime: single-flight application of list transitions.
//!
//! This crate turns the pure deltas of `rowflux-diff` into serialized
//! transactions against a live presentation surface:
//!
//! - [`ticket`] — one-shot completion handles used for the scheduler's
//!   public result and for per-item refresh tracking.
//! - [`surface`] — the [`RowSurface`](surface::RowSurface) and
//!   [`RowRefresher`](surface::RowRefresher) contracts the scheduler
//!   drives.
//! - [`scheduler`] — [`UpdateScheduler`](scheduler::UpdateScheduler), the
//!   single-flight-with-latest-wins controller.
//!
//! # Example
//!
//! ```
//! use rowflux_runtime::scheduler::{UpdateScheduler, UpdaterConfig};
//! use rowflux_runtime::surface::{InstantRefresher, RowSurface};
//!
//! /// A surface that accepts everything.
//! struct NullSurface;
//!
//! impl RowSurface for NullSurface {
//!     fn begin_batch(&mut self) {}
//!     fn insert_row(&mut self, _partition: usize, _index: usize) {}
//!     fn remove_row(&mut self, _partition: usize, _index: usize) {}
//!     fn move_row(&mut self, _partition: usize, _from: usize, _to: usize) {}
//!     fn end_batch(&mut self) -> bool {
//!         true
//!     }
//! }
//!
//! let scheduler = UpdateScheduler::start(
//!     vec![vec![1u32, 2, 3]],
//!     NullSurface,
//!     InstantRefresher,
//!     UpdaterConfig::default(),
//! );
//!
//! let ticket = scheduler.update(vec![vec![2u32, 3, 4]]);
//! assert!(ticket.wait().unwrap().is_applied());
//! assert_eq!(scheduler.current(), vec![vec![2u32, 3, 4]]);
//! scheduler.shutdown();
//! ```

pub mod scheduler;
pub mod surface;
pub mod ticket;

pub use scheduler::{UpdateError, UpdateOutcome, UpdateScheduler, UpdaterConfig, UpdaterMetrics};
pub use surface::{
    FnRefresher, InstantRefresher, RefreshError, RefreshResult, RowRefresher, RowSurface,
};
pub use ticket::{Abandoned, Resolver, Ticket};
