#![forbid(unsafe_code)]

//! Contracts for the external collaborators the scheduler drives.
//!
//! The scheduler is deliberately ignorant of what a "row" looks like on
//! screen. It speaks to two collaborators:
//!
//! - [`RowSurface`] — the presentation surface: a row/partition view that
//!   accepts primitive insert/remove/move operations inside a batch and
//!   reports whether the batch completed.
//! - [`RowRefresher`] — the per-item visual refresh hook, invoked for each
//!   retained-but-changed item after a successful batch. Refreshes are
//!   asynchronous; each returns a [`Ticket`] the scheduler awaits.
//!
//! Polymorphic per-item refresh behavior belongs in the refresher
//! implementation, not here; the scheduler invokes one uniform callback.
//! [`FnRefresher`] adapts a plain closure for the common case.
//!
//! # Index contract
//!
//! Within one batch the surface receives removals addressed by pre-batch
//! indices, and insertions/moves addressed by post-batch indices, in the
//! order the diff kernel produces them (insertions ascending, removals
//! ascending, then moves). A surface that applies the whole batch against
//! one consistent snapshot of its pre-batch state will never observe an
//! out-of-range index.

use std::fmt;

use crate::ticket::Ticket;

/// A row/partition presentation surface the scheduler drives.
///
/// `begin_batch` / `end_batch` bracket one transaction covering every
/// partition of one update. `end_batch` returns whether the transaction
/// completed; `false` fails the whole update.
pub trait RowSurface: Send {
    /// Open a transaction.
    fn begin_batch(&mut self);

    /// Insert a row at `index` (post-batch coordinates) in `partition`.
    fn insert_row(&mut self, partition: usize, index: usize);

    /// Remove the row at `index` (pre-batch coordinates) in `partition`.
    fn remove_row(&mut self, partition: usize, index: usize);

    /// Move a row from its informed position to `to` in `partition`.
    fn move_row(&mut self, partition: usize, from: usize, to: usize);

    /// Close the transaction. `true` means every operation applied.
    fn end_batch(&mut self) -> bool;
}

/// Per-item refresh outcome.
pub type RefreshResult = Result<(), RefreshError>;

/// A per-item refresh callback failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshError {
    message: String,
}

impl RefreshError {
    /// Build an error carrying the refresher's reason.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The reason reported by the refresher.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "refresh failed: {}", self.message)
    }
}

impl std::error::Error for RefreshError {}

/// Hook refreshing the visual representation of one retained item.
///
/// Invoked once per retained-but-changed item after the structural batch
/// completed. The returned ticket resolves when the refresh finishes;
/// dropping the resolver without resolving counts as a failure.
pub trait RowRefresher<T>: Send {
    /// Refresh `item` in `partition`. `animated` mirrors the scheduler's
    /// configuration.
    fn refresh(&mut self, partition: usize, item: &T, animated: bool) -> Ticket<RefreshResult>;
}

/// Adapter turning a closure into a [`RowRefresher`].
///
/// The closure receives `(partition, item, animated)` and returns the
/// refresh ticket.
#[derive(Debug, Clone)]
pub struct FnRefresher<F>(pub F);

impl<T, F> RowRefresher<T> for FnRefresher<F>
where
    F: FnMut(usize, &T, bool) -> Ticket<RefreshResult> + Send,
{
    fn refresh(&mut self, partition: usize, item: &T, animated: bool) -> Ticket<RefreshResult> {
        (self.0)(partition, item, animated)
    }
}

/// A refresher that completes every refresh immediately and successfully.
///
/// Useful when retained items have no out-of-band visual state, and as the
/// no-op default in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstantRefresher;

impl<T> RowRefresher<T> for InstantRefresher {
    fn refresh(&mut self, _partition: usize, _item: &T, _animated: bool) -> Ticket<RefreshResult> {
        let (resolver, ticket) = crate::ticket::channel();
        resolver.resolve(Ok(()));
        ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_refresher_resolves_immediately() {
        let mut refresher = InstantRefresher;
        let ticket = RowRefresher::<u32>::refresh(&mut refresher, 0, &1, true);
        assert_eq!(ticket.try_get(), Some(Ok(())));
    }

    #[test]
    fn closures_adapt_into_refreshers() {
        let mut animated_seen = None;
        {
            let mut refresher = FnRefresher(|_partition: usize, _item: &u32, animated: bool| {
                animated_seen = Some(animated);
                let (resolver, ticket) = crate::ticket::channel();
                resolver.resolve(Ok(()));
                ticket
            });
            let _ = refresher.refresh(0, &5, false);
        }
        assert_eq!(animated_seen, Some(false));
    }

    #[test]
    fn refresh_error_formats_reason() {
        let err = RefreshError::new("cell vanished");
        assert_eq!(err.to_string(), "refresh failed: cell vanished");
        assert_eq!(err.message(), "cell vanished");
    }
}
