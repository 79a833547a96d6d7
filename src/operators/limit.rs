//! Keep the top `k` rows under a comparator.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::btree::BTree;
use crate::changeset::ChangeSet;
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::{Comparator, Data, Result};

/// Maintains the `k` least rows under `cmp` and emits only net changes to that set.
///
/// Deletions that open a vacancy trigger a *refill*: the operator pulls its
/// upstream for replacement rows until it holds `k` again or the upstream runs dry.
/// Both the refill and the cold pull early-terminate the upstream scan after `k`
/// useful rows, which requires the upstream's scan order to agree with `cmp`
/// (pipelines built over a matching sorted connection or an
/// [`OrderBy`](super::OrderBy) satisfy this).
pub struct Limit<T: Data> {
    upstream: SourceHandle<T>,
    k: usize,
    top: BTree<T>,
    last_output: Vec<T>,
    sink: SinkSlot<T>,
}

impl<T: Data> Limit<T> {
    /// Attaches a top-`k` to `upstream`.
    pub fn new(upstream: impl IntoSourceHandle<T>, k: usize, cmp: Comparator<T>) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let op = Rc::new(RefCell::new(Limit {
            upstream: upstream.clone(),
            k,
            top: BTree::new(cmp),
            last_output: Vec::new(),
            sink: SinkSlot::new("limit"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }

    fn handle_addition(&mut self, row: T) {
        if self.top.len() < self.k {
            self.top.add(row);
            return;
        }
        // At capacity: the incoming row must beat the current worst to enter.
        let worst = match self.top.values_reversed().next() {
            Some(worst) => worst.clone(),
            None => return, // k == 0
        };
        if (self.top.comparator())(&row, &worst) == Ordering::Less {
            self.top.delete(&worst);
            self.top.add(row);
        }
    }

    fn refill(&mut self) {
        let upstream = self.upstream.clone();
        let top = &mut self.top;
        let k = self.k;
        let _ = upstream.borrow_mut().pull(&mut |row, _| {
            if !top.has(row) {
                top.add(row.clone());
            }
            if top.len() >= k {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
    }

    fn apply(&mut self, delta: ChangeSet<T>) -> ChangeSet<T> {
        let delta = delta.merge_records();
        // Deletions first, so vacancies are visible before additions compete.
        for (row, weight) in delta.iter() {
            if *weight < 0 {
                self.top.delete(row);
            }
        }
        for (row, weight) in delta {
            if weight > 0 {
                self.handle_addition(row);
            }
        }
        if self.top.len() < self.k {
            self.refill();
        }
        assert!(self.top.len() <= self.k, "limit state exceeded k");

        let current: Vec<T> = self.top.values().cloned().collect();
        let out = ChangeSet::from_updates(current.iter().cloned().map(|r| (r, 1)).collect())
            .subtract(ChangeSet::from_updates(
                self.last_output.iter().cloned().map(|r| (r, 1)).collect(),
            ));
        self.last_output = current;
        out
    }
}

impl<T: Data> Sink<T> for RefCell<Limit<T>> {
    fn push(&self, delta: ChangeSet<T>) {
        let (out, slot) = {
            let mut op = self.borrow_mut();
            (op.apply(delta), op.sink.clone())
        };
        slot.push(out);
    }
}

impl<T: Data> Source<T> for Limit<T> {
    fn size(&self) -> usize {
        self.top.len()
    }

    fn set_sink(&mut self, sink: SinkHandle<T>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, T>) -> ControlFlow<()> {
        self.top.clear();
        self.last_output.clear();
        if self.k == 0 {
            return ControlFlow::Continue(());
        }
        let upstream = self.upstream.clone();
        let top = &mut self.top;
        let last_output = &mut self.last_output;
        let k = self.k;
        let mut consumer = ControlFlow::Continue(());
        let _ = upstream.borrow_mut().pull(&mut |row, weight| {
            let before = top.len();
            top.add(row.clone());
            if top.len() == before {
                // A duplicate under the comparator collapsed; it is not a new
                // top-k member and must not be double-counted in the baseline.
                return ControlFlow::Continue(());
            }
            last_output.push(row.clone());
            consumer = each(row, weight);
            if consumer.is_break() || top.len() >= k {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        consumer
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}
