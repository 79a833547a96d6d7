//! Per-group aggregations over the output of [`GroupBy`](crate::operators::GroupBy).
//!
//! One reusable operator, [`GroupAggregate`], does all the bookkeeping: it consumes
//! grouped-row change-sets, recomputes the configured aggregate from each affected
//! group's (post-delta) row tree, and emits retract-old/assert-new result rows that
//! carry the group's key columns next to the aggregate value. The concrete
//! aggregations differ only in their `compute` function; their constructors are
//! generated below.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::ops::ControlFlow;
use std::rc::Rc;

use fnv::FnvHashMap;

use crate::btree::BTree;
use crate::changeset::ChangeSet;
use crate::operators::GroupedRow;
use crate::row::{fingerprint, value_cmp, Keyed, OwnedRow, Record};
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::{Comparator, Result, Value};

/// Computes an aggregate [`Value`] from a group's rows; the column is `None` for
/// aggregations that consider whole rows.
pub type GroupCompute<T> = Box<dyn Fn(&BTree<T>, Option<&str>) -> Value>;

/// Decides whether a computed aggregate keeps its group in the output.
pub type GroupKeep = Box<dyn Fn(&Value, usize) -> bool>;

/// The reusable per-group aggregation operator.
///
/// State is one result row per live group, keyed by the group's key tuple. On push,
/// each group the delta touched is recomputed from its current row tree; groups
/// that vanished (or that `should_keep` rejects) retract their row.
pub struct GroupAggregate<T: Record> {
    upstream: SourceHandle<GroupedRow<T>>,
    result_key: String,
    column: Option<String>,
    compute: GroupCompute<T>,
    should_keep: GroupKeep,
    state: BTree<Keyed<OwnedRow>>,
    sink: SinkSlot<OwnedRow>,
}

impl<T: Record> GroupAggregate<T> {
    /// Attaches a per-group aggregation to a grouped upstream.
    pub fn new(
        upstream: impl IntoSourceHandle<GroupedRow<T>>,
        result_key: impl Into<String>,
        column: Option<String>,
        compute: GroupCompute<T>,
        should_keep: GroupKeep,
    ) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        // One state entry per group: entries are keyed by the group key tuple
        // alone, not by their row contents.
        let state_cmp: Comparator<Keyed<OwnedRow>> =
            Rc::new(|a: &Keyed<OwnedRow>, b: &Keyed<OwnedRow>| value_cmp(&a.key, &b.key));
        let op = Rc::new(RefCell::new(GroupAggregate {
            upstream: upstream.clone(),
            result_key: result_key.into(),
            column,
            compute,
            should_keep,
            state: BTree::new(state_cmp),
            sink: SinkSlot::new("group aggregate"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }

    fn output_row(&self, group: &GroupedRow<T>, value: Value) -> OwnedRow {
        group.key_values.clone().with(self.result_key.clone(), value)
    }

    fn computed_row(&self, group: &GroupedRow<T>) -> Option<OwnedRow> {
        let value = (self.compute)(&group.rows, self.column.as_deref());
        (self.should_keep)(&value, group.rows.len()).then(|| self.output_row(group, value))
    }

    fn apply(&mut self, delta: ChangeSet<GroupedRow<T>>) -> ChangeSet<OwnedRow> {
        // Net effect per group in this delta: retractions come before assertions,
        // so the last entry for a key decides whether the group survives.
        let mut order: Vec<Value> = Vec::new();
        let mut latest: FnvHashMap<String, Option<GroupedRow<T>>> = FnvHashMap::default();
        for (group, weight) in delta {
            let tuple = group.key_tuple();
            let id = fingerprint(&tuple);
            if !latest.contains_key(&id) {
                order.push(tuple);
            }
            latest.insert(id, (weight > 0).then_some(group));
        }

        let mut out = ChangeSet::zero();
        for tuple in order {
            let id = fingerprint(&tuple);
            let probe = Keyed::new(tuple.clone(), OwnedRow::new());
            let old = self.state.get(&probe).map(|entry| entry.row.clone());
            let new = latest
                .remove(&id)
                .flatten()
                .and_then(|group| self.computed_row(&group));
            if old == new {
                continue;
            }
            if let Some(old) = old {
                out.append(old, -1);
            }
            match new {
                Some(new) => {
                    self.state.add(Keyed::new(tuple, new.clone()));
                    out.append(new, 1);
                }
                None => {
                    self.state.delete(&probe);
                }
            }
        }
        out
    }
}

impl<T: Record> Sink<GroupedRow<T>> for RefCell<GroupAggregate<T>> {
    fn push(&self, delta: ChangeSet<GroupedRow<T>>) {
        let (out, slot) = {
            let mut op = self.borrow_mut();
            (op.apply(delta), op.sink.clone())
        };
        slot.push(out);
    }
}

impl<T: Record> Source<OwnedRow> for GroupAggregate<T> {
    fn size(&self) -> usize {
        self.state.len()
    }

    fn set_sink(&mut self, sink: SinkHandle<OwnedRow>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, OwnedRow>) -> ControlFlow<()> {
        self.state.clear();
        let upstream = self.upstream.clone();
        let mut groups: Vec<GroupedRow<T>> = Vec::new();
        let _ = upstream.borrow_mut().pull(&mut |group, _| {
            groups.push(group.clone());
            ControlFlow::Continue(())
        });
        for group in groups {
            if let Some(row) = self.computed_row(&group) {
                self.state.add(Keyed::new(group.key_tuple(), row));
            }
        }
        for entry in self.state.values() {
            each(&entry.row, 1)?;
        }
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}

fn non_null_column_values<'a, T: Record>(
    rows: &'a BTree<T>,
    column: Option<&'a str>,
) -> impl Iterator<Item = Value> + 'a {
    rows.values().filter_map(move |row| {
        let column = column.expect("column-aggregations carry a column");
        let value = row.column(column);
        (!value.is_null()).then_some(value)
    })
}

fn compute_count<T: Record>(rows: &BTree<T>, column: Option<&str>) -> Value {
    match column {
        None => Value::from(rows.len() as i64),
        Some(_) => Value::from(non_null_column_values(rows, column).count() as i64),
    }
}

fn compute_sum<T: Record>(rows: &BTree<T>, column: Option<&str>) -> Value {
    let mut sum = 0.0;
    for value in non_null_column_values(rows, column) {
        match value {
            Value::Number(n) => sum += n.as_f64().unwrap_or(0.0),
            other => panic!("numeric aggregation over non-numeric value {other}"),
        }
    }
    Value::from(sum)
}

fn compute_min<T: Record>(rows: &BTree<T>, column: Option<&str>) -> Value {
    non_null_column_values(rows, column)
        .reduce(|a, b| if value_cmp(&b, &a) == Ordering::Less { b } else { a })
        .unwrap_or(Value::Null)
}

fn compute_max<T: Record>(rows: &BTree<T>, column: Option<&str>) -> Value {
    non_null_column_values(rows, column)
        .reduce(|a, b| if value_cmp(&b, &a) == Ordering::Greater { b } else { a })
        .unwrap_or(Value::Null)
}

fn compute_avg<T: Record>(rows: &BTree<T>, column: Option<&str>) -> Value {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in non_null_column_values(rows, column) {
        match value {
            Value::Number(n) => {
                sum += n.as_f64().unwrap_or(0.0);
                count += 1;
            }
            other => panic!("numeric aggregation over non-numeric value {other}"),
        }
    }
    if count > 0 {
        Value::from(sum / count as f64)
    } else {
        Value::Null
    }
}

fn compute_array_agg<T: Record>(rows: &BTree<T>, column: Option<&str>) -> Value {
    let items = non_null_column_values(rows, column)
        .map(|value| match value {
            Value::String(_) => value,
            other => panic!("array aggregation over non-string value {other}"),
        })
        .collect();
    Value::Array(items)
}

macro_rules! column_group_aggregations {
    ($(($variant:ident, $key:literal, $compute:path, $doc:literal),)+) => {
        paste::paste! { $(
            #[doc = concat!("Per-group ", $doc, " of one column.")]
            ///
            /// Emits one row per surviving group: the group's key columns plus
            #[doc = concat!("`\"", $key, "\"`.")]
            pub struct [<$variant GroupBy>];

            impl [<$variant GroupBy>] {
                #[doc = concat!("Attaches a per-group ", $doc, " of `column` to a grouped upstream.")]
                pub fn new<T: Record>(
                    upstream: impl IntoSourceHandle<GroupedRow<T>>,
                    column: impl Into<String>,
                ) -> Result<Rc<RefCell<GroupAggregate<T>>>> {
                    let upstream = upstream.into_handle();
                    GroupAggregate::new(
                        upstream,
                        $key,
                        Some(column.into()),
                        Box::new($compute),
                        Box::new(|_, _| true),
                    )
                }
            }
        )+ }
    };
}

column_group_aggregations! {
    (Sum, "sum", compute_sum, "sum"),
    (Min, "min", compute_min, "minimum"),
    (Max, "max", compute_max, "maximum"),
    (Avg, "avg", compute_avg, "average"),
    (ArrayAgg, "array_agg", compute_array_agg, "string-array aggregation"),
}

/// Per-group row count.
///
/// Emits one row per surviving group: the group's key columns plus `"count"`.
pub struct CountGroupBy;

impl CountGroupBy {
    /// Attaches a per-group count of all rows to a grouped upstream.
    pub fn new<T: Record>(
        upstream: impl IntoSourceHandle<GroupedRow<T>>,
    ) -> Result<Rc<RefCell<GroupAggregate<T>>>> {
        let upstream = upstream.into_handle();
        GroupAggregate::new(
            upstream,
            "count",
            None,
            Box::new(compute_count),
            Box::new(|_, _| true),
        )
    }

    /// Attaches a per-group count of rows whose `column` is non-null.
    pub fn for_column<T: Record>(
        upstream: impl IntoSourceHandle<GroupedRow<T>>,
        column: impl Into<String>,
    ) -> Result<Rc<RefCell<GroupAggregate<T>>>> {
        let upstream = upstream.into_handle();
        GroupAggregate::new(
            upstream,
            "count",
            Some(column.into()),
            Box::new(compute_count),
            Box::new(|_, _| true),
        )
    }
}

/// Per-group JSON aggregation, shaped by a [`JsonSpec`](super::JsonSpec).
///
/// Emits one row per surviving group: the group's key columns plus `"json_agg"`.
pub struct JsonAggGroupBy;

impl JsonAggGroupBy {
    /// Attaches a per-group JSON aggregation to a grouped upstream.
    pub fn new<T: Record>(
        upstream: impl IntoSourceHandle<GroupedRow<T>>,
        spec: super::JsonSpec,
    ) -> Result<Rc<RefCell<GroupAggregate<T>>>> {
        let upstream = upstream.into_handle();
        GroupAggregate::new(
            upstream,
            "json_agg",
            None,
            Box::new(move |rows: &BTree<T>, _| {
                Value::Array(rows.values().filter_map(|row| spec.value_for(row)).collect())
            }),
            Box::new(|_, _| true),
        )
    }
}
