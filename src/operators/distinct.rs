//! Collapse the stream to one occurrence per distinct record.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::btree::BTree;
use crate::changeset::{ChangeSet, Counted};
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::{Comparator, Data, Result};

/// Reference-counts records and emits each one exactly once.
///
/// A record enters the output when its accumulated count rises from zero and leaves
/// it when the count returns to zero; every emitted weight is `±1`. Deletions of
/// absent records are ignored. A count driven below zero is an upstream accounting
/// anomaly: it is logged, the entry is kept with its negative count, and nothing is
/// emitted until the count recovers.
pub struct Distinct<T: Data> {
    upstream: SourceHandle<T>,
    counts: BTree<Counted<T>>,
    sink: SinkSlot<T>,
}

impl<T: Data> Distinct<T> {
    /// Attaches a distinct to `upstream`, with record equality decided by `cmp`.
    pub fn new(upstream: impl IntoSourceHandle<T>, cmp: Comparator<T>) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let counted_cmp: Comparator<Counted<T>> =
            Rc::new(move |a: &Counted<T>, b: &Counted<T>| cmp(&a.row, &b.row));
        let op = Rc::new(RefCell::new(Distinct {
            upstream: upstream.clone(),
            counts: BTree::new(counted_cmp),
            sink: SinkSlot::new("distinct"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }

    fn apply(&mut self, delta: ChangeSet<T>) -> ChangeSet<T> {
        let mut out = ChangeSet::zero();
        for (row, weight) in delta {
            let probe = Counted { row, count: 0 };
            match self.counts.get(&probe).map(|c| c.count) {
                None => {
                    if weight > 0 {
                        self.counts.add(Counted {
                            row: probe.row.clone(),
                            count: weight,
                        });
                        out.append(probe.row, 1);
                    }
                    // A deletion of an untracked record is ignored.
                }
                Some(count) => {
                    let count = count + weight;
                    if count == 0 {
                        self.counts.delete(&probe);
                        out.append(probe.row, -1);
                    } else {
                        if count < 0 {
                            tracing::warn!("distinct count went negative");
                        }
                        self.counts.add(Counted {
                            row: probe.row,
                            count,
                        });
                    }
                }
            }
        }
        out
    }
}

impl<T: Data> Sink<T> for RefCell<Distinct<T>> {
    fn push(&self, delta: ChangeSet<T>) {
        let (out, slot) = {
            let mut op = self.borrow_mut();
            (op.apply(delta), op.sink.clone())
        };
        slot.push(out);
    }
}

impl<T: Data> Source<T> for Distinct<T> {
    fn size(&self) -> usize {
        self.counts.len()
    }

    fn set_sink(&mut self, sink: SinkHandle<T>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, T>) -> ControlFlow<()> {
        self.counts.clear();
        let upstream = self.upstream.clone();
        let counts = &mut self.counts;
        let _ = upstream.borrow_mut().pull(&mut |row, weight| {
            let probe = Counted {
                row: row.clone(),
                count: 0,
            };
            let count = counts.get(&probe).map_or(0, |c| c.count) + weight;
            counts.add(Counted {
                row: probe.row,
                count,
            });
            ControlFlow::Continue(())
        });
        for counted in self.counts.values() {
            if counted.count > 0 {
                each(&counted.row, 1)?;
            }
        }
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}
