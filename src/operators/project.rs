//! Build a named-column record from each input record.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::changeset::ChangeSet;
use crate::row::{OwnedRow, Record, Value};
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::Result;

/// An extractor producing one projected column from an input record.
pub type ColumnExtractor<I> = Box<dyn Fn(&I) -> Value>;

/// Builds an [`OwnedRow`] of named columns from each record; weights pass through.
///
/// [`Map`](super::Map) specialized to column extraction. A non-injective projection
/// produces duplicate rows downstream, which a [`View`](crate::View) preserves and a
/// following [`Distinct`](super::Distinct) would collapse.
pub struct Project<I: Record> {
    upstream: SourceHandle<I>,
    columns: Vec<(String, ColumnExtractor<I>)>,
    sink: SinkSlot<OwnedRow>,
}

impl<I: Record> Project<I> {
    /// Attaches a projection described by `(name, extractor)` pairs.
    pub fn new(
        upstream: impl IntoSourceHandle<I>,
        columns: Vec<(String, ColumnExtractor<I>)>,
    ) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let op = Rc::new(RefCell::new(Project {
            upstream: upstream.clone(),
            columns,
            sink: SinkSlot::new("project"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }

    /// Attaches a projection that keeps the named columns as they are.
    pub fn of_columns(upstream: impl IntoSourceHandle<I>, names: &[&str]) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let columns = names
            .iter()
            .map(|&name| {
                let column = name.to_string();
                let extractor: ColumnExtractor<I> =
                    Box::new(move |row: &I| row.column(&column));
                (name.to_string(), extractor)
            })
            .collect();
        Self::new(upstream, columns)
    }

    fn build(&self, row: &I) -> OwnedRow {
        self.columns
            .iter()
            .map(|(name, extract)| (name.clone(), extract(row)))
            .collect()
    }
}

impl<I: Record> Sink<I> for RefCell<Project<I>> {
    fn push(&self, delta: ChangeSet<I>) {
        let (out, slot) = {
            let op = self.borrow();
            let mut out = ChangeSet::zero();
            for (row, weight) in delta {
                out.append(op.build(&row), weight);
            }
            (out, op.sink.clone())
        };
        slot.push(out);
    }
}

impl<I: Record> Source<OwnedRow> for Project<I> {
    fn size(&self) -> usize {
        self.upstream.borrow().size()
    }

    fn set_sink(&mut self, sink: SinkHandle<OwnedRow>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, OwnedRow>) -> ControlFlow<()> {
        let upstream = self.upstream.clone();
        let columns = &self.columns;
        let flow = upstream.borrow_mut().pull(&mut |row, weight| {
            let projected: OwnedRow = columns
                .iter()
                .map(|(name, extract)| (name.clone(), extract(row)))
                .collect();
            each(&projected, weight)
        });
        flow
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}
