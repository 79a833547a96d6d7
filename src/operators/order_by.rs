//! Maintain an ordering over the stream's contents.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::btree::BTree;
use crate::changeset::ChangeSet;
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::{Comparator, Data, Result};

/// Keeps the stream's rows in a B+tree under the supplied comparator.
///
/// Deltas pass through *unmodified*: the ordering materializes only when a
/// downstream consumer pulls, which yields rows in ascending comparator order. The
/// comparator must distinguish distinct rows or equal-comparing rows will collapse
/// into one.
pub struct OrderBy<T: Data> {
    upstream: SourceHandle<T>,
    tree: BTree<T>,
    sink: SinkSlot<T>,
}

impl<T: Data> OrderBy<T> {
    /// Attaches an ordering to `upstream`.
    pub fn new(upstream: impl IntoSourceHandle<T>, cmp: Comparator<T>) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let op = Rc::new(RefCell::new(OrderBy {
            upstream: upstream.clone(),
            tree: BTree::new(cmp),
            sink: SinkSlot::new("order by"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }
}

impl<T: Data> Sink<T> for RefCell<OrderBy<T>> {
    fn push(&self, delta: ChangeSet<T>) {
        let slot = {
            let mut op = self.borrow_mut();
            for (row, weight) in delta.iter() {
                if *weight > 0 {
                    op.tree.add(row.clone());
                } else if *weight < 0 {
                    op.tree.delete(row);
                }
            }
            op.sink.clone()
        };
        slot.push(delta);
    }
}

impl<T: Data> Source<T> for OrderBy<T> {
    fn size(&self) -> usize {
        self.upstream.borrow().size()
    }

    fn set_sink(&mut self, sink: SinkHandle<T>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, T>) -> ControlFlow<()> {
        self.tree.clear();
        let upstream = self.upstream.clone();
        let tree = &mut self.tree;
        let _ = upstream.borrow_mut().pull(&mut |row, _| {
            tree.add(row.clone());
            ControlFlow::Continue(())
        });
        for row in self.tree.values() {
            each(row, 1)?;
        }
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}
