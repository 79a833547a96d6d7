//! Keep one best row per key, promoting the next-best on deletion.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::btree::BTree;
use crate::changeset::ChangeSet;
use crate::row::serialized_order;
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::{Comparator, Data, Result};

#[derive(Clone)]
struct KeyRows<T, K> {
    key: K,
    rows: BTree<T>,
}

/// Emits, per distinct key, the least row under the row comparator.
///
/// All candidate rows per key are retained in an ordered tree, so deleting the
/// currently emitted row *promotes the next-best row automatically*, unlike a
/// SQL `DISTINCT ON` over a snapshot, which would simply lose the key until the
/// next evaluation. "Best" means first under `row_cmp`; pass a reversed comparator
/// to keep, say, the most recent row.
pub struct DistinctOn<T: Data, K: Data> {
    upstream: SourceHandle<T>,
    key_of: Box<dyn Fn(&T) -> K>,
    row_cmp: Comparator<T>,
    groups: BTree<KeyRows<T, K>>,
    sink: SinkSlot<T>,
}

impl<T: Data, K: Data> DistinctOn<T, K> {
    /// Attaches a distinct-on to `upstream`.
    ///
    /// `key_of` extracts the key, `key_cmp` orders keys, and `row_cmp` picks the
    /// best row per key (least first). When `row_cmp` is `None`, rows order by
    /// their serialization.
    pub fn new(
        upstream: impl IntoSourceHandle<T>,
        key_of: impl Fn(&T) -> K + 'static,
        key_cmp: Comparator<K>,
        row_cmp: Option<Comparator<T>>,
    ) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let row_cmp = row_cmp.unwrap_or_else(serialized_order);
        let group_cmp: Comparator<KeyRows<T, K>> =
            Rc::new(move |a: &KeyRows<T, K>, b: &KeyRows<T, K>| key_cmp(&a.key, &b.key));
        let op = Rc::new(RefCell::new(DistinctOn {
            upstream: upstream.clone(),
            key_of: Box::new(key_of),
            row_cmp,
            groups: BTree::new(group_cmp),
            sink: SinkSlot::new("distinct on"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }

    fn probe(&self, key: K) -> KeyRows<T, K> {
        KeyRows {
            key,
            rows: BTree::new(self.row_cmp.clone()),
        }
    }

    fn apply(&mut self, delta: ChangeSet<T>) -> ChangeSet<T> {
        let mut out = ChangeSet::zero();
        for (row, weight) in delta {
            let probe = self.probe((self.key_of)(&row));
            let existing = self.groups.get(&probe).cloned();
            if weight > 0 {
                match existing {
                    None => {
                        let mut group = probe;
                        group.rows.add(row.clone());
                        self.groups.add(group);
                        out.append(row, 1);
                    }
                    Some(mut group) => {
                        let old_best = group.rows.first().cloned().expect("group is non-empty");
                        group.rows.add(row);
                        let new_best = group.rows.first().cloned().expect("group is non-empty");
                        self.groups.add(group);
                        if (self.row_cmp)(&old_best, &new_best) != Ordering::Equal {
                            out.append(old_best, -1);
                            out.append(new_best, 1);
                        }
                    }
                }
            } else if weight < 0 {
                if let Some(mut group) = existing {
                    let old_best = group.rows.first().cloned().expect("group is non-empty");
                    group.rows.delete(&row);
                    if group.rows.is_empty() {
                        self.groups.delete(&probe);
                        out.append(old_best, -1);
                    } else {
                        let new_best = group.rows.first().cloned().expect("group is non-empty");
                        if (self.row_cmp)(&old_best, &new_best) != Ordering::Equal {
                            out.append(old_best, -1);
                            out.append(new_best, 1);
                        }
                        self.groups.add(group);
                    }
                }
            }
        }
        out
    }
}

impl<T: Data, K: Data> Sink<T> for RefCell<DistinctOn<T, K>> {
    fn push(&self, delta: ChangeSet<T>) {
        let (out, slot) = {
            let mut op = self.borrow_mut();
            (op.apply(delta), op.sink.clone())
        };
        slot.push(out);
    }
}

impl<T: Data, K: Data> Source<T> for DistinctOn<T, K> {
    fn size(&self) -> usize {
        self.groups.len()
    }

    fn set_sink(&mut self, sink: SinkHandle<T>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, T>) -> ControlFlow<()> {
        self.groups.clear();
        let upstream = self.upstream.clone();
        let mut rows: Vec<T> = Vec::new();
        let _ = upstream.borrow_mut().pull(&mut |row, _| {
            rows.push(row.clone());
            ControlFlow::Continue(())
        });
        for row in rows {
            let probe = self.probe((self.key_of)(&row));
            let mut group = self.groups.get(&probe).cloned().unwrap_or(probe);
            group.rows.add(row);
            self.groups.add(group);
        }
        for group in self.groups.values() {
            let best = group.rows.first().expect("group is non-empty");
            each(best, 1)?;
        }
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}
