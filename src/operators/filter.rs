//! Keep only the records satisfying a predicate.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::changeset::ChangeSet;
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::{Data, Result};

/// Forwards the pairs of each delta whose record satisfies the predicate.
///
/// The predicate must be pure: it is consulted both on push and on pull, and a
/// record must answer the same way every time it is asked.
pub struct Filter<T: Data, P> {
    upstream: SourceHandle<T>,
    predicate: P,
    sink: SinkSlot<T>,
}

impl<T, P> Filter<T, P>
where
    T: Data,
    P: Fn(&T) -> bool + 'static,
{
    /// Attaches a filter to `upstream`.
    pub fn new(upstream: impl IntoSourceHandle<T>, predicate: P) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let op = Rc::new(RefCell::new(Filter {
            upstream: upstream.clone(),
            predicate,
            sink: SinkSlot::new("filter"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }
}

impl<T, P> Sink<T> for RefCell<Filter<T, P>>
where
    T: Data,
    P: Fn(&T) -> bool + 'static,
{
    fn push(&self, delta: ChangeSet<T>) {
        let (out, slot) = {
            let op = self.borrow();
            let mut out = ChangeSet::zero();
            for (row, weight) in delta {
                if (op.predicate)(&row) {
                    out.append(row, weight);
                }
            }
            (out, op.sink.clone())
        };
        slot.push(out);
    }
}

impl<T, P> Source<T> for Filter<T, P>
where
    T: Data,
    P: Fn(&T) -> bool + 'static,
{
    fn size(&self) -> usize {
        self.upstream.borrow().size()
    }

    fn set_sink(&mut self, sink: SinkHandle<T>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, T>) -> ControlFlow<()> {
        let upstream = self.upstream.clone();
        let predicate = &self.predicate;
        let flow = upstream.borrow_mut().pull(&mut |row, weight| {
            if predicate(row) {
                each(row, weight)
            } else {
                ControlFlow::Continue(())
            }
        });
        flow
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}
