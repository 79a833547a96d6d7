//! Aggregations over streams and over grouped streams.
//!
//! The scalar family ([`Count`], [`Sum`], [`Min`], [`Max`], [`Avg`], [`ArrayAgg`],
//! [`JsonAgg`]) reduces a whole stream to a single [`OwnedRow`](crate::OwnedRow)
//! result, re-emitted as retract-old/assert-new whenever it changes. The per-group
//! family wraps the same computations around the groups produced by
//! [`GroupBy`](crate::operators::GroupBy): one result row per surviving group,
//! carrying the group's key columns next to the aggregate (see
//! [`GroupAggregate`] and the generated `…GroupBy` constructors).

pub mod grouped;
pub mod scalar;

pub use grouped::{
    ArrayAggGroupBy, AvgGroupBy, CountGroupBy, GroupAggregate, JsonAggGroupBy, MaxGroupBy,
    MinGroupBy, SumGroupBy,
};
pub use scalar::{ArrayAgg, Avg, Count, JsonAgg, JsonSpec, Max, Min, Sum};
