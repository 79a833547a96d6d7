//! An in-memory incremental view maintenance engine.
//!
//! `delta-view` materializes relational query results and keeps them current under a
//! continuous stream of row-level changes. A pipeline of operators is built from base
//! tables ([`Memory`]) to materialized results ([`View`]); thereafter every insertion,
//! deletion, or update flows through the pipeline as a weighted [`ChangeSet`] and
//! updates downstream state and subscribers without re-running the query.
//!
//! Records move through the pipeline as *change-sets*: lists of `(record, weight)`
//! pairs in which a positive weight is an insertion and a negative weight a deletion.
//! Operators consume a change-set, update whatever internal state they keep (ordered
//! copy-on-write B+trees, for the stateful ones), and emit the change-set describing
//! the delta of their own output. A [`View`] at the bottom of the pipeline folds the
//! deltas into a duplicate-preserving ordered result and notifies its subscribers.
//!
//! # Examples
//!
//! ```
//! use delta_view::{by_column, Memory, OwnedRow, Record, Value, View};
//! use delta_view::operators::Filter;
//!
//! fn item(id: i64, value: i64) -> OwnedRow {
//!     [("id", Value::from(id)), ("value", Value::from(value))]
//!         .into_iter()
//!         .collect()
//! }
//!
//! let memory = Memory::new(vec![item(1, 10), item(2, 25)], "id").unwrap();
//! let evens = Filter::new(memory.connect(), |row: &OwnedRow| {
//!     row.column("value").as_i64().unwrap() % 2 == 0
//! })
//! .unwrap();
//! let view = View::new(evens, by_column("id")).unwrap();
//!
//! assert_eq!(view.materialize(), vec![item(1, 10)]);
//! memory.add(item(3, 30)).unwrap();
//! assert_eq!(view.current_state(), vec![item(1, 10), item(3, 30)]);
//! ```
//!
//! The engine is single-process and single-threaded: all operator work runs
//! synchronously on the thread that mutated a source, and a base mutation returns
//! only after every transitively attached sink has been brought up to date.

#![forbid(missing_docs)]

use std::cmp::Ordering;
use std::fmt::Debug;
use std::rc::Rc;

use serde::Serialize;

/// A change in the occurrence count of a record.
pub type Weight = isize;

/// A total order on records, supplied by the caller.
///
/// Comparators must be deterministic and antisymmetric. Comparators governing
/// set-semantic containers (operator state trees, [`View`] state) must distinguish
/// non-equal rows; rows that compare equal silently replace one another.
pub type Comparator<T> = Rc<dyn Fn(&T, &T) -> Ordering>;

/// A composite trait for data types usable as records in a pipeline.
///
/// Records are opaque to the engine: they are compared only through caller-supplied
/// [`Comparator`]s. The `Serialize` requirement exists because record *identity* (for
/// change-set merging, join bookkeeping, and similar) is established through a cached
/// structural serialization of the record rather than through `Hash`/`Eq` instances.
pub trait Data: Clone + Serialize + Debug + 'static {}
impl<T: Clone + Serialize + Debug + 'static> Data for T {}

/// An error surfaced by the engine for a violated caller contract.
///
/// Internal invariant violations are not represented here; those are logic bugs and
/// fail as assertions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A source received a second `set_sink` call. Sources feed exactly one sink;
    /// fan-out goes through [`SplitStream`](split::SplitStream) branches.
    #[error("sink already set on {0}")]
    SinkAlreadySet(&'static str),
    /// An `add` found an existing row with the same primary key.
    #[error("duplicate primary key {0}")]
    DuplicateKey(String),
    /// An `update` or `remove` probe matched no row.
    #[error("no row with primary key {0}")]
    MissingKey(String),
}

/// Result type for fallible engine operations.
pub type Result<T> = std::result::Result<T, Error>;

pub mod aggregate;
pub mod btree;
pub mod changeset;
pub mod memory;
pub mod operators;
pub mod row;
pub mod split;
pub mod stream;
pub mod view;

pub use changeset::ChangeSet;
pub use memory::Memory;
pub use row::{by_column, serialized_order, value_cmp, OwnedRow, Record, Value};
pub use stream::{IntoSourceHandle, Sink, SinkHandle, Source, SourceHandle};
pub use view::View;
