//! The stream operators: each is a [`Sink`](crate::Sink) for its upstream's deltas
//! and a [`Source`](crate::Source) of its own.
//!
//! Stateless operators ([`Filter`], [`Map`], [`Project`]) transform deltas as they
//! pass. Stateful operators maintain internal B+trees keyed to their purpose:
//! [`OrderBy`] an order-enforcing index, [`Distinct`] reference counts,
//! [`DistinctOn`] per-key candidate sets, [`GroupBy`] per-group row trees,
//! [`Limit`] the current top-k, [`Join`]/[`LeftOuterJoin`] per-side key indexes and
//! a result set. [`Combine`] and [`MultiRowCombine`] pair rows across two upstreams.
//!
//! Constructors attach the new operator to its upstream(s) and hand back an
//! `Rc<RefCell<…>>` cell that coerces to a [`SourceHandle`](crate::SourceHandle)
//! wherever a downstream consumer wants one.

pub mod combine;
pub mod distinct;
pub mod distinct_on;
pub mod filter;
pub mod group_by;
pub mod join;
pub mod left_join;
pub mod limit;
pub mod map;
pub mod order_by;
pub mod project;

pub use combine::{Combine, MultiRowCombine};
pub use distinct::Distinct;
pub use distinct_on::DistinctOn;
pub use filter::Filter;
pub use group_by::{GroupBy, GroupedRow};
pub use join::Join;
pub use left_join::LeftOuterJoin;
pub use limit::Limit;
pub use map::Map;
pub use order_by::OrderBy;
pub use project::Project;
