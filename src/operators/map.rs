//! Transform each record through a function.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::changeset::ChangeSet;
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::{Data, Result};

/// Applies a function to each record, forwarding weights unchanged.
///
/// Non-injective functions may produce records that collide downstream; those
/// remain separate weighted pairs unless a [`Distinct`](super::Distinct) follows.
pub struct Map<I: Data, O: Data, F> {
    upstream: SourceHandle<I>,
    transform: F,
    sink: SinkSlot<O>,
}

impl<I, O, F> Map<I, O, F>
where
    I: Data,
    O: Data,
    F: Fn(&I) -> O + 'static,
{
    /// Attaches a map to `upstream`.
    pub fn new(upstream: impl IntoSourceHandle<I>, transform: F) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let op = Rc::new(RefCell::new(Map {
            upstream: upstream.clone(),
            transform,
            sink: SinkSlot::new("map"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }
}

impl<I, O, F> Sink<I> for RefCell<Map<I, O, F>>
where
    I: Data,
    O: Data,
    F: Fn(&I) -> O + 'static,
{
    fn push(&self, delta: ChangeSet<I>) {
        let (out, slot) = {
            let op = self.borrow();
            let mut out = ChangeSet::zero();
            for (row, weight) in delta {
                out.append((op.transform)(&row), weight);
            }
            (out, op.sink.clone())
        };
        slot.push(out);
    }
}

impl<I, O, F> Source<O> for Map<I, O, F>
where
    I: Data,
    O: Data,
    F: Fn(&I) -> O + 'static,
{
    fn size(&self) -> usize {
        self.upstream.borrow().size()
    }

    fn set_sink(&mut self, sink: SinkHandle<O>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, O>) -> ControlFlow<()> {
        let upstream = self.upstream.clone();
        let transform = &self.transform;
        let flow = upstream
            .borrow_mut()
            .pull(&mut |row, weight| each(&transform(row), weight));
        flow
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}
