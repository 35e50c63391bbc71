#![forbid(unsafe_code)]

//! Identity-keyed list diff kernel.
//!
//! Given a "before" and an "after" ordered snapshot of the same collection,
//! [`Difference::compute`] derives the structural delta between them:
//! insertions, removals, per-item position moves, and the retained items
//! that stayed put. Elements are matched by a stable identity key (see
//! [`Identify`]), never by content, so an item whose attributes changed but
//! whose key is unchanged is still "the same element".
//!
//! The kernel is pure: no I/O, no side effects, deterministic output for
//! identical inputs. Everything derived is computed once, eagerly, by a
//! single `compute` call — later fields depend on earlier ones (moves are
//! derived from the informed projection), so recomputation is both wasteful
//! and a consistency hazard.
//!
//! Consumers that drive a batching presentation surface should apply, per
//! partition: insertions (target index ascending), removals (source index
//! ascending), then informed moves. The orderings produced here are exactly
//! the ones such a surface can replay against a single pre-batch indexing
//! scheme without re-reading invalidated indices mid-batch.

pub mod difference;
pub mod identity;

pub use difference::{
    DiffError, Difference, Insertion, Move, Removal, Retention, SequenceSide,
};
pub use identity::Identify;
