#![forbid(unsafe_code)]

//! Structural difference between two ordered snapshots.
//!
//! [`Difference::compute`] takes a `(before, after)` pair and derives every
//! positional view a presentation layer needs:
//!
//! - `inserted` / `removed`: membership changes, with the index each
//!   operation targets.
//! - `moved`: **informed** moves — position deltas measured against the
//!   projection of `before` with removals and insertions already applied
//!   (but no moves). This is the view to replay against a batching surface.
//! - `unmoved`: retained items whose informed position equals their final
//!   position, carrying both their source row (in `before`) and target row
//!   (in `after`).
//! - `uninformed_moved` / `naive_moved`: auxiliary diagnostic views using
//!   other index bases. Do not drive a surface with these.
//!
//! # Invariants
//!
//! 1. `inserted ∪ removed ∪ moved ∪ unmoved` partitions the identity union
//!    of both sequences: every key lands in exactly one bucket.
//! 2. `inserted` is ordered by target index ascending; `removed` by source
//!    index ascending. Replaying removals back-to-front and insertions
//!    front-to-back over `before` reproduces [`informed_before`]
//!    (Difference::informed_before).
//! 3. Output is deterministic: list order follows sequence order, never
//!    hash-set iteration order.
//!
//! # Index spaces
//!
//! Removal sources refer to pre-batch (`before`) indices; insertion targets
//! and move destinations refer to post-batch (`after`) indices; move origins
//! refer to the informed projection. A surface that batches all three kinds
//! of operation against a single consistent pre-batch indexing scheme can
//! apply them in the order produced here without index invalidation.

use std::fmt;

use ahash::{AHashMap, AHashSet};

use crate::identity::Identify;

// ─── Records ─────────────────────────────────────────────────────────────────

/// An item present in `after` but not in `before`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion<T> {
    /// The inserted item, as captured in `after`.
    pub item: T,
    /// Its index in `after`.
    pub target: usize,
}

/// An item present in `before` but not in `after`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal<T> {
    /// The removed item, as captured in `before`.
    pub item: T,
    /// Its index in `before`.
    pub source: usize,
}

/// A retained item whose position changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move<T> {
    /// The moved item, as captured in `after`.
    pub item: T,
    /// Index in the base the view is measured against (see the view's doc).
    pub from: usize,
    /// Destination index.
    pub to: usize,
}

/// A retained item whose informed position equals its final position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retention<T> {
    /// The retained item, as captured in `after`.
    pub item: T,
    /// Its index in `before` — the row a pre-update counterpart lives at.
    pub source: usize,
    /// Its index in `after`.
    pub target: usize,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Which input sequence an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceSide {
    /// The "before" snapshot.
    Before,
    /// The "after" snapshot.
    After,
}

impl fmt::Display for SequenceSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before => f.write_str("before"),
            Self::After => f.write_str("after"),
        }
    }
}

/// Error computing a difference.
///
/// Duplicate identities within one sequence are a caller precondition
/// violation: positions become ambiguous, so the computation refuses the
/// input outright rather than silently picking an occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    /// Two items in the same sequence share an identity key.
    DuplicateKey {
        /// Sequence the duplicate was found in.
        side: SequenceSide,
        /// Index of the first occurrence.
        first: usize,
        /// Index of the second occurrence.
        second: usize,
        /// Debug rendering of the offending key.
        key: String,
    },
}

impl fmt::Display for DiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey {
                side,
                first,
                second,
                key,
            } => write!(
                f,
                "duplicate identity {key} in {side} sequence (indices {first} and {second})"
            ),
        }
    }
}

impl std::error::Error for DiffError {}

// ─── Difference ──────────────────────────────────────────────────────────────

/// Eagerly-computed, immutable structural delta between two snapshots.
///
/// Produced by [`Difference::compute`]; all derived views are materialized
/// by that one call and never recomputed.
#[derive(Debug, Clone)]
pub struct Difference<T: Identify> {
    inserted: Vec<Insertion<T>>,
    removed: Vec<Removal<T>>,
    moved: Vec<Move<T>>,
    uninformed_moved: Vec<Move<T>>,
    naive_moved: Vec<Move<T>>,
    unmoved: Vec<Retention<T>>,
    informed_before: Vec<T>,
    all_keys: AHashSet<T::Key>,
    inserted_keys: AHashSet<T::Key>,
    removed_keys: AHashSet<T::Key>,
    retained_keys: AHashSet<T::Key>,
}

impl<T: Identify + Clone> Difference<T> {
    /// Compute the difference between `before` and `after`.
    ///
    /// Pure and deterministic. Fails only when a sequence contains two
    /// items with the same identity key.
    pub fn compute(before: &[T], after: &[T]) -> Result<Self, DiffError> {
        let before_index = index_keys(before, SequenceSide::Before)?;
        let after_index = index_keys(after, SequenceSide::After)?;

        // Membership changes, ordered by the sequence that defines their
        // index space: removals by source ascending, insertions by target
        // ascending. Downstream batches stay monotonic this way.
        let mut removed = Vec::new();
        for (source, item) in before.iter().enumerate() {
            if !after_index.contains_key(&item.key()) {
                removed.push(Removal {
                    item: item.clone(),
                    source,
                });
            }
        }
        let mut inserted = Vec::new();
        for (target, item) in after.iter().enumerate() {
            if !before_index.contains_key(&item.key()) {
                inserted.push(Insertion {
                    item: item.clone(),
                    target,
                });
            }
        }

        // Informed projection: `before` with removals and insertions applied
        // but no moves. Removals go back-to-front (original source indices
        // stay valid), then insertions front-to-back (each target index is
        // valid against the growing list). Removal sources address the
        // pre-batch list, insertion targets the post-batch list.
        let mut informed_before: Vec<T> = before.to_vec();
        for removal in removed.iter().rev() {
            informed_before.remove(removal.source);
        }
        for insertion in &inserted {
            informed_before.insert(insertion.target, insertion.item.clone());
        }
        let informed_index: AHashMap<T::Key, usize> = informed_before
            .iter()
            .enumerate()
            .map(|(index, item)| (item.key(), index))
            .collect();

        // Informed moves and retentions. Iterating `after` keeps the answer
        // index-comparison-driven and deterministic.
        let mut moved = Vec::new();
        let mut unmoved = Vec::new();
        for (target, item) in after.iter().enumerate() {
            let key = item.key();
            let Some(&source) = before_index.get(&key) else {
                continue; // inserted, not retained
            };
            let from = *informed_index
                .get(&key)
                .expect("retained key must appear in the informed projection");
            if from == target {
                unmoved.push(Retention {
                    item: item.clone(),
                    source,
                    target,
                });
            } else {
                moved.push(Move {
                    item: item.clone(),
                    from,
                    to: target,
                });
            }
        }

        // Uninformed projection: `after` with insertions and removals
        // reverted. Insertions are undone back-to-front by target index,
        // removals re-inserted front-to-back by source index, so no step
        // reads an index the previous step invalidated.
        let mut uninformed_after: Vec<T> = after.to_vec();
        for insertion in inserted.iter().rev() {
            uninformed_after.remove(insertion.target);
        }
        for removal in &removed {
            uninformed_after.insert(removal.source, removal.item.clone());
        }
        let uninformed_index: AHashMap<T::Key, usize> = uninformed_after
            .iter()
            .enumerate()
            .map(|(index, item)| (item.key(), index))
            .collect();

        let mut uninformed_moved = Vec::new();
        for (source, item) in before.iter().enumerate() {
            let key = item.key();
            if !after_index.contains_key(&key) {
                continue; // removed, not retained
            }
            let to = *uninformed_index
                .get(&key)
                .expect("retained key must appear in the uninformed projection");
            if source != to {
                uninformed_moved.push(Move {
                    item: item.clone(),
                    from: source,
                    to,
                });
            }
        }

        // Naive moves: raw index comparison, ignoring insert/remove shift.
        // Meaningful only when the membership did not change.
        let mut naive_moved = Vec::new();
        for (target, item) in after.iter().enumerate() {
            let key = item.key();
            let Some(&source) = before_index.get(&key) else {
                continue;
            };
            if source != target {
                naive_moved.push(Move {
                    item: item.clone(),
                    from: source,
                    to: target,
                });
            }
        }

        let removed_keys: AHashSet<T::Key> =
            removed.iter().map(|removal| removal.item.key()).collect();
        let inserted_keys: AHashSet<T::Key> = inserted
            .iter()
            .map(|insertion| insertion.item.key())
            .collect();
        let retained_keys: AHashSet<T::Key> = after
            .iter()
            .map(Identify::key)
            .filter(|key| before_index.contains_key(key))
            .collect();
        let mut all_keys = AHashSet::with_capacity(before.len() + inserted.len());
        all_keys.extend(before.iter().map(Identify::key));
        all_keys.extend(inserted_keys.iter().cloned());

        Ok(Self {
            inserted,
            removed,
            moved,
            uninformed_moved,
            naive_moved,
            unmoved,
            informed_before,
            all_keys,
            inserted_keys,
            removed_keys,
            retained_keys,
        })
    }

    // ── Views ────────────────────────────────────────────────────────

    /// Inserted items, target index ascending.
    #[must_use]
    pub fn inserted(&self) -> &[Insertion<T>] {
        &self.inserted
    }

    /// Removed items, source index ascending.
    #[must_use]
    pub fn removed(&self) -> &[Removal<T>] {
        &self.removed
    }

    /// Informed moves: informed-projection index → `after` index.
    ///
    /// This is the move view to replay against a presentation surface.
    #[must_use]
    pub fn moved(&self) -> &[Move<T>] {
        &self.moved
    }

    /// Diagnostic view: `before` index → uninformed-projection index.
    #[must_use]
    pub fn uninformed_moved(&self) -> &[Move<T>] {
        &self.uninformed_moved
    }

    /// Diagnostic view: raw `before` index → raw `after` index.
    ///
    /// Coincides with [`moved`](Self::moved) exactly when no insertions or
    /// removals occurred.
    #[must_use]
    pub fn naive_moved(&self) -> &[Move<T>] {
        &self.naive_moved
    }

    /// Retained items that did not move, target index ascending.
    #[must_use]
    pub fn unmoved(&self) -> &[Retention<T>] {
        &self.unmoved
    }

    /// The projection of `before` with removals and insertions applied but
    /// no moves.
    #[must_use]
    pub fn informed_before(&self) -> &[T] {
        &self.informed_before
    }

    // ── Key sets ─────────────────────────────────────────────────────

    /// Number of distinct identities across both snapshots.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.all_keys.len()
    }

    /// Whether `key` appears in either snapshot.
    #[must_use]
    pub fn contains(&self, key: &T::Key) -> bool {
        self.all_keys.contains(key)
    }

    /// Whether `key` was inserted.
    #[must_use]
    pub fn was_inserted(&self, key: &T::Key) -> bool {
        self.inserted_keys.contains(key)
    }

    /// Whether `key` was removed.
    #[must_use]
    pub fn was_removed(&self, key: &T::Key) -> bool {
        self.removed_keys.contains(key)
    }

    /// Whether `key` is present in both snapshots.
    #[must_use]
    pub fn was_retained(&self, key: &T::Key) -> bool {
        self.retained_keys.contains(key)
    }

    // ── Shape ────────────────────────────────────────────────────────

    /// No insertions, removals, or moves: the snapshots are structurally
    /// identical (retained content may still have changed).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty() && self.moved.is_empty()
    }

    /// Same membership, different order.
    #[must_use]
    pub fn is_pure_reorder(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty() && !self.moved.is_empty()
    }

    /// Total structural operations a surface would replay.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.inserted.len() + self.removed.len() + self.moved.len()
    }
}

/// Build a key → index map, rejecting duplicate identities.
fn index_keys<T: Identify>(
    sequence: &[T],
    side: SequenceSide,
) -> Result<AHashMap<T::Key, usize>, DiffError> {
    let mut map = AHashMap::with_capacity(sequence.len());
    for (index, item) in sequence.iter().enumerate() {
        let key = item.key();
        if let Some(first) = map.insert(key, index) {
            return Err(DiffError::DuplicateKey {
                side,
                first,
                second: index,
                key: format!("{:?}", item.key()),
            });
        }
    }
    Ok(map)
}
