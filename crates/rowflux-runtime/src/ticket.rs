#![forbid(unsafe_code)]

//! One-shot completion tickets.
//!
//! A [`Ticket`] is the asynchronous result handle handed back by the update
//! scheduler, and the same abstraction refresh callbacks use to report
//! their own outcome. [`channel`] returns a `(Resolver, Ticket)` pair: the
//! producer side resolves exactly once, every ticket clone observes that
//! single resolution.
//!
//! # Resolution rules
//!
//! - The **first** [`Resolver::resolve`] wins. Later calls are ignored and
//!   return `false`.
//! - Resolvers are cloneable (several producers may race; first wins).
//! - When every resolver clone is dropped without resolving, the ticket
//!   becomes **abandoned** and waiters unblock with [`Abandoned`] instead
//!   of hanging forever.
//!
//! # Blocking
//!
//! [`Ticket::wait`] blocks the calling thread. The scheduler only waits on
//! its own apply thread; callers that must not block can poll
//! [`Ticket::try_get`] or bound the wait with [`Ticket::wait_timeout`].

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use web_time::Instant;

/// Result slot shared between resolvers and tickets.
#[derive(Debug)]
enum State<T> {
    /// Unresolved; counts the live resolver clones.
    Waiting { resolvers: usize },
    /// Resolved exactly once.
    Resolved(T),
    /// Every resolver dropped without resolving.
    Abandoned,
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Shared<T> {
    /// A poisoned lock means some thread panicked mid-notify; the state
    /// value itself is always consistent, so recover the guard.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a linked resolver/ticket pair.
#[must_use]
pub fn channel<T>() -> (Resolver<T>, Ticket<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Waiting { resolvers: 1 }),
        cond: Condvar::new(),
    });
    (
        Resolver {
            shared: Arc::clone(&shared),
        },
        Ticket { shared },
    )
}

// ─── Resolver ────────────────────────────────────────────────────────────────

/// Producer side of a one-shot completion.
#[derive(Debug)]
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Resolver<T> {
    /// Resolve the ticket. Returns `true` if this call won the resolution,
    /// `false` if the ticket was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        let mut state = self.shared.lock();
        match *state {
            State::Waiting { .. } => {
                *state = State::Resolved(value);
                drop(state);
                self.shared.cond.notify_all();
                true
            }
            State::Resolved(_) | State::Abandoned => false,
        }
    }

    /// Whether the ticket has already been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.shared.lock(), State::Resolved(_))
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        if let State::Waiting { resolvers } = &mut *self.shared.lock() {
            *resolvers += 1;
        }
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let State::Waiting { resolvers } = &mut *state {
            *resolvers -= 1;
            if *resolvers == 0 {
                *state = State::Abandoned;
                drop(state);
                self.shared.cond.notify_all();
            }
        }
    }
}

// ─── Ticket ──────────────────────────────────────────────────────────────────

/// Consumer side of a one-shot completion.
///
/// Cheaply cloneable; all clones observe the same resolution.
#[derive(Debug)]
pub struct Ticket<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Ticket<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> Ticket<T> {
    /// Block until the ticket resolves.
    pub fn wait(&self) -> Result<T, Abandoned> {
        let mut state = self.shared.lock();
        loop {
            match &*state {
                State::Resolved(value) => return Ok(value.clone()),
                State::Abandoned => return Err(Abandoned),
                State::Waiting { .. } => {
                    state = self
                        .shared
                        .cond
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Block until the ticket resolves or `timeout` elapses.
    ///
    /// `Ok(None)` means the timeout elapsed with the ticket still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>, Abandoned> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            match &*state {
                State::Resolved(value) => return Ok(Some(value.clone())),
                State::Abandoned => return Err(Abandoned),
                State::Waiting { .. } => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let (guard, _) = self
                        .shared
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }

    /// The resolved value, if any. Never blocks.
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        match &*self.shared.lock() {
            State::Resolved(value) => Some(value.clone()),
            State::Waiting { .. } | State::Abandoned => None,
        }
    }
}

impl<T> Ticket<T> {
    /// Whether a resolution has been recorded.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.shared.lock(), State::Resolved(_))
    }

    /// Whether every resolver was dropped without resolving.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        matches!(*self.shared.lock(), State::Abandoned)
    }
}

// ─── Abandoned ───────────────────────────────────────────────────────────────

/// Error: the producer side went away without ever resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abandoned;

impl fmt::Display for Abandoned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("completion abandoned: every resolver dropped without a result")
    }
}

impl std::error::Error for Abandoned {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolve_then_wait() {
        let (resolver, ticket) = channel();
        assert!(resolver.resolve(7u32));
        assert_eq!(ticket.wait(), Ok(7));
        assert!(ticket.is_resolved());
    }

    #[test]
    fn first_resolution_wins() {
        let (resolver, ticket) = channel();
        assert!(resolver.resolve(1u32));
        assert!(!resolver.resolve(2));
        assert_eq!(ticket.wait(), Ok(1));
    }

    #[test]
    fn cloned_resolvers_race_first_wins() {
        let (resolver, ticket) = channel();
        let second = resolver.clone();
        assert!(second.resolve(10u32));
        assert!(!resolver.resolve(20));
        assert_eq!(ticket.try_get(), Some(10));
    }

    #[test]
    fn dropping_all_resolvers_abandons() {
        let (resolver, ticket) = channel::<u32>();
        let second = resolver.clone();
        drop(resolver);
        assert!(!ticket.is_abandoned());
        drop(second);
        assert!(ticket.is_abandoned());
        assert_eq!(ticket.wait(), Err(Abandoned));
    }

    #[test]
    fn resolved_ticket_survives_resolver_drop() {
        let (resolver, ticket) = channel();
        resolver.resolve(5u32);
        drop(resolver);
        assert_eq!(ticket.wait(), Ok(5));
        assert!(!ticket.is_abandoned());
    }

    #[test]
    fn wait_blocks_until_cross_thread_resolution() {
        let (resolver, ticket) = channel();
        let waiter = {
            let ticket = ticket.clone();
            thread::spawn(move || ticket.wait())
        };
        resolver.resolve(String::from("done"));
        assert_eq!(waiter.join().unwrap(), Ok(String::from("done")));
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let (_resolver, ticket) = channel::<u32>();
        assert_eq!(ticket.wait_timeout(Duration::from_millis(10)), Ok(None));
    }

    #[test]
    fn clones_observe_same_resolution() {
        let (resolver, ticket) = channel();
        let other = ticket.clone();
        resolver.resolve('x');
        assert_eq!(ticket.try_get(), Some('x'));
        assert_eq!(other.try_get(), Some('x'));
    }
}
