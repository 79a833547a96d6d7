//! Whole-stream aggregations producing a single result row.
//!
//! Every operator here keeps one running aggregate and emits
//! `{(old, −1), (new, +1)}` when a push changes it; a cold pull recomputes the
//! aggregate from upstream and yields its single row (present even for an empty
//! input). Result rows are [`OwnedRow`]s keyed `"count"`, `"sum"`, `"min"`,
//! `"max"`, `"avg"`, `"array_agg"`, or `"json_agg"`.
//!
//! Typed aggregations treat null column values as absent and panic on values of
//! the wrong type; that is a contract violation by the caller, fatal to the pipeline.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::btree::BTree;
use crate::changeset::ChangeSet;
use crate::operators::Combine;
use crate::row::{keyed_cmp, Keyed, OwnedRow, Record};
use crate::split::SplitStream;
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::{value_cmp, Result, Value, Weight};

/// Counts rows, or non-null values of one column.
pub struct Count<T: Record> {
    upstream: SourceHandle<T>,
    column: Option<String>,
    count: i64,
    sink: SinkSlot<OwnedRow>,
}

impl<T: Record> Count<T> {
    /// Attaches a count of all rows.
    pub fn new(upstream: impl IntoSourceHandle<T>) -> Result<Rc<RefCell<Self>>> {
        Self::build(upstream, None)
    }

    /// Attaches a count of rows whose `column` is non-null.
    pub fn for_column(
        upstream: impl IntoSourceHandle<T>,
        column: impl Into<String>,
    ) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        Self::build(upstream, Some(column.into()))
    }

    fn build(upstream: impl IntoSourceHandle<T>, column: Option<String>) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let op = Rc::new(RefCell::new(Count {
            upstream: upstream.clone(),
            column,
            count: 0,
            sink: SinkSlot::new("count"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }

    fn counts(&self, row: &T) -> bool {
        match &self.column {
            None => true,
            Some(column) => !row.column(column).is_null(),
        }
    }

    fn row(count: i64) -> OwnedRow {
        OwnedRow::single("count", Value::from(count))
    }
}

impl<T: Record> Sink<T> for RefCell<Count<T>> {
    fn push(&self, delta: ChangeSet<T>) {
        let (out, slot) = {
            let mut op = self.borrow_mut();
            let old = op.count;
            for (row, weight) in delta {
                if op.counts(&row) {
                    op.count += weight as i64;
                }
            }
            let mut out = ChangeSet::zero();
            if op.count != old {
                out.append(Count::<T>::row(old), -1);
                out.append(Count::<T>::row(op.count), 1);
            }
            (out, op.sink.clone())
        };
        slot.push(out);
    }
}

impl<T: Record> Source<OwnedRow> for Count<T> {
    fn size(&self) -> usize {
        1
    }

    fn set_sink(&mut self, sink: SinkHandle<OwnedRow>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, OwnedRow>) -> ControlFlow<()> {
        self.count = 0;
        let upstream = self.upstream.clone();
        let column = self.column.clone();
        let count = &mut self.count;
        let _ = upstream.borrow_mut().pull(&mut |row: &T, weight| {
            let counted = match &column {
                None => true,
                Some(column) => !row.column(column).is_null(),
            };
            if counted {
                *count += weight as i64;
            }
            ControlFlow::Continue(())
        });
        each(&Self::row(self.count), 1)?;
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}

/// Sums a numeric column; null values are skipped.
pub struct Sum<T: Record> {
    upstream: SourceHandle<T>,
    column: String,
    sum: f64,
    sink: SinkSlot<OwnedRow>,
}

/// The numeric value of `row[column]`, `None` for null.
///
/// # Panics
///
/// Panics on a non-numeric, non-null value.
fn numeric_value<T: Record>(row: &T, column: &str) -> Option<f64> {
    match row.column(column) {
        Value::Null => None,
        Value::Number(n) => n.as_f64(),
        other => panic!("numeric aggregation over non-numeric value {other}"),
    }
}

impl<T: Record> Sum<T> {
    /// Attaches a sum of `column`.
    pub fn new(upstream: impl IntoSourceHandle<T>, column: impl Into<String>) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let op = Rc::new(RefCell::new(Sum {
            upstream: upstream.clone(),
            column: column.into(),
            sum: 0.0,
            sink: SinkSlot::new("sum"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }

    fn row(sum: f64) -> OwnedRow {
        OwnedRow::single("sum", Value::from(sum))
    }
}

impl<T: Record> Sink<T> for RefCell<Sum<T>> {
    fn push(&self, delta: ChangeSet<T>) {
        let (out, slot) = {
            let mut op = self.borrow_mut();
            let old = op.sum;
            for (row, weight) in delta {
                if let Some(value) = numeric_value(&row, &op.column) {
                    op.sum += value * weight as f64;
                }
            }
            let mut out = ChangeSet::zero();
            if op.sum != old {
                out.append(Sum::<T>::row(old), -1);
                out.append(Sum::<T>::row(op.sum), 1);
            }
            (out, op.sink.clone())
        };
        slot.push(out);
    }
}

impl<T: Record> Source<OwnedRow> for Sum<T> {
    fn size(&self) -> usize {
        1
    }

    fn set_sink(&mut self, sink: SinkHandle<OwnedRow>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, OwnedRow>) -> ControlFlow<()> {
        self.sum = 0.0;
        let upstream = self.upstream.clone();
        let column = self.column.clone();
        let sum = &mut self.sum;
        let _ = upstream.borrow_mut().pull(&mut |row: &T, weight| {
            if let Some(value) = numeric_value(row, &column) {
                *sum += value * weight as f64;
            }
            ControlFlow::Continue(())
        });
        each(&Self::row(self.sum), 1)?;
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}

/// Tracks the least value of a column; null for an empty input.
pub struct Min<T: Record> {
    inner: Extremum<T>,
}

/// Tracks the greatest value of a column; null for an empty input.
pub struct Max<T: Record> {
    inner: Extremum<T>,
}

/// Shared state of [`Min`] and [`Max`]: the source rows ordered by the column.
struct Extremum<T: Record> {
    upstream: SourceHandle<T>,
    column: String,
    result_key: &'static str,
    /// `false` reads the tree's first entry (min), `true` its last (max).
    take_last: bool,
    rows: BTree<Keyed<T>>,
    sink: SinkSlot<OwnedRow>,
}

impl<T: Record> Extremum<T> {
    fn current(&self) -> Value {
        let entry = if self.take_last {
            self.rows.last()
        } else {
            self.rows.first()
        };
        entry.map_or(Value::Null, |e| e.key.clone())
    }

    fn row(&self, value: Value) -> OwnedRow {
        OwnedRow::single(self.result_key, value)
    }

    fn apply(&mut self, delta: ChangeSet<T>) -> ChangeSet<OwnedRow> {
        let old = self.current();
        for (row, weight) in delta {
            let value = row.column(&self.column);
            if value.is_null() {
                continue;
            }
            let entry = Keyed::new(value, row);
            if weight > 0 {
                self.rows.add(entry);
            } else if weight < 0 {
                self.rows.delete(&entry);
            }
        }
        let new = self.current();
        let mut out = ChangeSet::zero();
        if value_cmp(&old, &new) != Ordering::Equal {
            out.append(self.row(old), -1);
            out.append(self.row(new), 1);
        }
        out
    }

    fn pull(&mut self, each: &mut Each<'_, OwnedRow>) -> ControlFlow<()> {
        self.rows.clear();
        let upstream = self.upstream.clone();
        let column = self.column.clone();
        let rows = &mut self.rows;
        let _ = upstream.borrow_mut().pull(&mut |row: &T, _| {
            let value = row.column(&column);
            if !value.is_null() {
                rows.add(Keyed::new(value, row.clone()));
            }
            ControlFlow::Continue(())
        });
        each(&self.row(self.current()), 1)?;
        ControlFlow::Continue(())
    }
}

macro_rules! extremum_operator {
    ($name:ident, $key:literal, $take_last:expr, $doc:literal) => {
        impl<T: Record> $name<T> {
            #[doc = concat!("Attaches a ", $doc, " of `column`.")]
            pub fn new(
                upstream: impl IntoSourceHandle<T>,
                column: impl Into<String>,
            ) -> Result<Rc<RefCell<Self>>> {
                let upstream = upstream.into_handle();
                let op = Rc::new(RefCell::new($name {
                    inner: Extremum {
                        upstream: upstream.clone(),
                        column: column.into(),
                        result_key: $key,
                        take_last: $take_last,
                        rows: BTree::new(keyed_cmp()),
                        sink: SinkSlot::new($key),
                    },
                }));
                upstream.borrow_mut().set_sink(sink_handle(&op))?;
                Ok(op)
            }
        }

        impl<T: Record> Sink<T> for RefCell<$name<T>> {
            fn push(&self, delta: ChangeSet<T>) {
                let (out, slot) = {
                    let mut op = self.borrow_mut();
                    (op.inner.apply(delta), op.inner.sink.clone())
                };
                slot.push(out);
            }
        }

        impl<T: Record> Source<OwnedRow> for $name<T> {
            fn size(&self) -> usize {
                1
            }

            fn set_sink(&mut self, sink: SinkHandle<OwnedRow>) -> Result<()> {
                self.inner.sink.set(sink)
            }

            fn pull(&mut self, each: &mut Each<'_, OwnedRow>) -> ControlFlow<()> {
                self.inner.pull(each)
            }

            fn disconnect(&mut self) {
                self.inner.sink.clear();
                self.inner.upstream.borrow_mut().disconnect();
            }
        }
    };
}

extremum_operator!(Min, "min", false, "minimum");
extremum_operator!(Max, "max", true, "maximum");

/// Collects a column's string values in arrival order.
pub struct ArrayAgg<T: Record> {
    upstream: SourceHandle<T>,
    column: String,
    items: Vec<String>,
    sink: SinkSlot<OwnedRow>,
}

impl<T: Record> ArrayAgg<T> {
    /// Attaches a string-array aggregation of `column`.
    pub fn new(upstream: impl IntoSourceHandle<T>, column: impl Into<String>) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let op = Rc::new(RefCell::new(ArrayAgg {
            upstream: upstream.clone(),
            column: column.into(),
            items: Vec::new(),
            sink: SinkSlot::new("array agg"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }

    fn row(items: &[String]) -> OwnedRow {
        OwnedRow::single(
            "array_agg",
            Value::Array(items.iter().cloned().map(Value::String).collect()),
        )
    }

    /// The string value of `row[column]`, `None` for null.
    ///
    /// # Panics
    ///
    /// Panics on a non-string, non-null value.
    fn string_value(row: &T, column: &str) -> Option<String> {
        match row.column(column) {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => panic!("array aggregation over non-string value {other}"),
        }
    }

    fn absorb(items: &mut Vec<String>, row: &T, column: &str, weight: Weight) {
        if let Some(value) = Self::string_value(row, column) {
            if weight > 0 {
                items.push(value);
            } else if weight < 0 {
                if let Some(at) = items.iter().position(|x| *x == value) {
                    items.remove(at);
                }
            }
        }
    }
}

impl<T: Record> Sink<T> for RefCell<ArrayAgg<T>> {
    fn push(&self, delta: ChangeSet<T>) {
        let (out, slot) = {
            let mut op = self.borrow_mut();
            let old = op.items.clone();
            let column = op.column.clone();
            for (row, weight) in delta {
                ArrayAgg::absorb(&mut op.items, &row, &column, weight);
            }
            let mut out = ChangeSet::zero();
            if op.items != old {
                out.append(ArrayAgg::<T>::row(&old), -1);
                out.append(ArrayAgg::<T>::row(&op.items), 1);
            }
            (out, op.sink.clone())
        };
        slot.push(out);
    }
}

impl<T: Record> Source<OwnedRow> for ArrayAgg<T> {
    fn size(&self) -> usize {
        1
    }

    fn set_sink(&mut self, sink: SinkHandle<OwnedRow>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, OwnedRow>) -> ControlFlow<()> {
        self.items.clear();
        let upstream = self.upstream.clone();
        let column = self.column.clone();
        let items = &mut self.items;
        let _ = upstream.borrow_mut().pull(&mut |row: &T, weight| {
            ArrayAgg::absorb(items, row, &column, weight);
            ControlFlow::Continue(())
        });
        each(&Self::row(&self.items), 1)?;
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}

/// What [`JsonAgg`] collects per row.
#[derive(Clone, Debug)]
pub enum JsonSpec {
    /// The value of one column; null values exclude the row.
    Column(String),
    /// An object of the named columns; null-valued columns are omitted.
    Columns(Vec<String>),
    /// An object of `(alias, column)` pairs; null-valued columns are omitted.
    Aliased(Vec<(String, String)>),
}

impl JsonSpec {
    /// The JSON value this spec extracts from `row`, or `None` when the row is
    /// excluded.
    pub fn value_for<T: Record>(&self, row: &T) -> Option<Value> {
        fn object<T: Record>(
            row: &T,
            fields: impl Iterator<Item = (String, String)>,
        ) -> Option<Value> {
            let mut map = serde_json::Map::new();
            for (name, column) in fields {
                let value = row.column(&column);
                if !value.is_null() {
                    map.insert(name, value);
                }
            }
            Some(Value::Object(map))
        }
        match self {
            JsonSpec::Column(column) => {
                let value = row.column(column);
                (!value.is_null()).then_some(value)
            }
            JsonSpec::Columns(columns) => {
                object(row, columns.iter().map(|c| (c.clone(), c.clone())))
            }
            JsonSpec::Aliased(pairs) => object(row, pairs.iter().cloned()),
        }
    }
}

/// Collects JSON values in arrival order, shaped by a [`JsonSpec`].
pub struct JsonAgg<T: Record> {
    upstream: SourceHandle<T>,
    spec: JsonSpec,
    items: Vec<Value>,
    sink: SinkSlot<OwnedRow>,
}

impl<T: Record> JsonAgg<T> {
    /// Attaches a JSON aggregation shaped by `spec`.
    pub fn new(upstream: impl IntoSourceHandle<T>, spec: JsonSpec) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let op = Rc::new(RefCell::new(JsonAgg {
            upstream: upstream.clone(),
            spec,
            items: Vec::new(),
            sink: SinkSlot::new("json agg"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }

    fn row(items: &[Value]) -> OwnedRow {
        OwnedRow::single("json_agg", Value::Array(items.to_vec()))
    }

    fn absorb(items: &mut Vec<Value>, spec: &JsonSpec, row: &T, weight: Weight) {
        if let Some(value) = spec.value_for(row) {
            if weight > 0 {
                items.push(value);
            } else if weight < 0 {
                if let Some(at) = items.iter().position(|x| *x == value) {
                    items.remove(at);
                }
            }
        }
    }
}

impl<T: Record> Sink<T> for RefCell<JsonAgg<T>> {
    fn push(&self, delta: ChangeSet<T>) {
        let (out, slot) = {
            let mut op = self.borrow_mut();
            let old = op.items.clone();
            let spec = op.spec.clone();
            for (row, weight) in delta {
                JsonAgg::absorb(&mut op.items, &spec, &row, weight);
            }
            let mut out = ChangeSet::zero();
            if op.items != old {
                out.append(JsonAgg::<T>::row(&old), -1);
                out.append(JsonAgg::<T>::row(&op.items), 1);
            }
            (out, op.sink.clone())
        };
        slot.push(out);
    }
}

impl<T: Record> Source<OwnedRow> for JsonAgg<T> {
    fn size(&self) -> usize {
        1
    }

    fn set_sink(&mut self, sink: SinkHandle<OwnedRow>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, OwnedRow>) -> ControlFlow<()> {
        self.items.clear();
        let upstream = self.upstream.clone();
        let spec = self.spec.clone();
        let items = &mut self.items;
        let _ = upstream.borrow_mut().pull(&mut |row: &T, weight| {
            JsonAgg::absorb(items, &spec, row, weight);
            ControlFlow::Continue(())
        });
        each(&Self::row(&self.items), 1)?;
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}

/// The average of a numeric column, composed from [`Sum`] and [`Count`] over a
/// [`SplitStream`] and merged through a [`Combine`].
pub struct Avg;

impl Avg {
    /// Attaches an average of `column` to `upstream`.
    ///
    /// The result row is `{avg: sum / count}`, or `{avg: null}` while no row has a
    /// non-null value in the column.
    pub fn new<T: Record>(
        upstream: impl IntoSourceHandle<T>,
        column: impl Into<String>,
    ) -> Result<Rc<RefCell<Combine<OwnedRow, OwnedRow, OwnedRow>>>> {
        let upstream = upstream.into_handle();
        let column = column.into();
        let split = SplitStream::new(upstream)?;
        let sum = Sum::new(split.branch(), column.clone())?;
        let count = Count::for_column(split.branch(), column)?;
        Combine::new(sum, count, |sum: &OwnedRow, count: &OwnedRow| {
            let count = count.column("count").as_i64().unwrap_or(0);
            let avg = if count > 0 {
                let sum = sum.column("sum").as_f64().unwrap_or(0.0);
                Value::from(sum / count as f64)
            } else {
                Value::Null
            };
            OwnedRow::single("avg", avg)
        })
    }
}
