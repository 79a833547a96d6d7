//! Inner equi-join of two streams.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::btree::BTree;
use crate::changeset::ChangeSet;
use crate::row::{keyed_cmp, value_cmp, Keyed};
use crate::stream::{
    sink_handle, BinaryOperator, Each, IntoSourceHandle, LeftPort, RightPort, Sink, SinkHandle,
    SinkSlot, Source, SourceHandle,
};
use crate::{Comparator, Data, Result, Value};

/// Collects the rows of `storage` whose key equals `key`.
pub(crate) fn matches_for<T: Data>(storage: &BTree<Keyed<T>>, key: &Value) -> Vec<T> {
    storage
        .values_from_by(&|entry: &Keyed<T>| value_cmp(&entry.key, key), true)
        .take_while(|entry| value_cmp(&entry.key, key) == Ordering::Equal)
        .map(|entry| entry.row.clone())
        .collect()
}

/// Joins two streams on key equality, emitting `(left, right)` pairs.
///
/// Each side is indexed by its extracted key (row serialization as tie-break), so a
/// push probes the opposite side in O(log n + matches). The cold pull loads the
/// smaller side first and streams the larger against it.
///
/// Multiplicity: each stored row on the probed side counts once per emitted pair,
/// i.e. set semantics on the opposite side rather than strict weighted-multiset
/// semantics. Sources that never repeat a row (tables keyed by primary key) are
/// unaffected.
pub struct Join<L: Data, R: Data> {
    left_up: SourceHandle<L>,
    right_up: SourceHandle<R>,
    left_key: Box<dyn Fn(&L) -> Value>,
    right_key: Box<dyn Fn(&R) -> Value>,
    left_storage: BTree<Keyed<L>>,
    right_storage: BTree<Keyed<R>>,
    results: BTree<(L, R)>,
    sink: SinkSlot<(L, R)>,
    left_port: Option<Rc<LeftPort<Self>>>,
    right_port: Option<Rc<RightPort<Self>>>,
}

impl<L: Data, R: Data> Join<L, R> {
    /// Attaches an inner equi-join to the two upstreams.
    ///
    /// `result_cmp` orders the materialized result pairs and must distinguish
    /// distinct pairs.
    pub fn new(
        left: impl IntoSourceHandle<L>,
        right: impl IntoSourceHandle<R>,
        left_key: impl Fn(&L) -> Value + 'static,
        right_key: impl Fn(&R) -> Value + 'static,
        result_cmp: Comparator<(L, R)>,
    ) -> Result<Rc<RefCell<Self>>> {
        let left = left.into_handle();
        let right = right.into_handle();
        let op = Rc::new(RefCell::new(Join {
            left_up: left.clone(),
            right_up: right.clone(),
            left_key: Box::new(left_key),
            right_key: Box::new(right_key),
            left_storage: BTree::new(keyed_cmp()),
            right_storage: BTree::new(keyed_cmp()),
            results: BTree::new(result_cmp),
            sink: SinkSlot::new("join"),
            left_port: None,
            right_port: None,
        }));
        let left_port = LeftPort::new(&op);
        let right_port = RightPort::new(&op);
        left.borrow_mut().set_sink(sink_handle(&left_port))?;
        right.borrow_mut().set_sink(sink_handle(&right_port))?;
        {
            let mut core = op.borrow_mut();
            core.left_port = Some(left_port);
            core.right_port = Some(right_port);
        }
        Ok(op)
    }
}

impl<L: Data, R: Data> BinaryOperator for Join<L, R> {
    type Left = L;
    type Right = R;
    type Out = (L, R);

    fn apply_left(&mut self, delta: ChangeSet<L>) -> ChangeSet<(L, R)> {
        let mut out = ChangeSet::zero();
        for (row, weight) in delta {
            let key = (self.left_key)(&row);
            let entry = Keyed::new(key.clone(), row.clone());
            if weight > 0 {
                self.left_storage.add(entry);
            } else {
                self.left_storage.delete(&entry);
            }
            for matched in matches_for(&self.right_storage, &key) {
                let pair = (row.clone(), matched);
                if weight > 0 {
                    self.results.add(pair.clone());
                } else {
                    self.results.delete(&pair);
                }
                out.append(pair, weight);
            }
        }
        out
    }

    fn apply_right(&mut self, delta: ChangeSet<R>) -> ChangeSet<(L, R)> {
        let mut out = ChangeSet::zero();
        for (row, weight) in delta {
            let key = (self.right_key)(&row);
            let entry = Keyed::new(key.clone(), row.clone());
            if weight > 0 {
                self.right_storage.add(entry);
            } else {
                self.right_storage.delete(&entry);
            }
            for matched in matches_for(&self.left_storage, &key) {
                let pair = (matched, row.clone());
                if weight > 0 {
                    self.results.add(pair.clone());
                } else {
                    self.results.delete(&pair);
                }
                out.append(pair, weight);
            }
        }
        out
    }

    fn out_slot(&self) -> SinkSlot<(L, R)> {
        self.sink.clone()
    }
}

impl<L: Data, R: Data> Source<(L, R)> for Join<L, R> {
    fn size(&self) -> usize {
        self.results.len()
    }

    fn set_sink(&mut self, sink: SinkHandle<(L, R)>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, (L, R)>) -> ControlFlow<()> {
        self.left_storage.clear();
        self.right_storage.clear();
        self.results.clear();

        // Build the smaller side, then stream the other against it.
        let left_first = self.left_up.borrow().size() <= self.right_up.borrow().size();

        let (left_up, right_up) = (self.left_up.clone(), self.right_up.clone());
        let Join {
            left_key,
            right_key,
            left_storage,
            right_storage,
            results,
            ..
        } = self;

        if left_first {
            let _ = left_up.borrow_mut().pull(&mut |row: &L, _| {
                left_storage.add(Keyed::new(left_key(row), row.clone()));
                ControlFlow::Continue(())
            });
            let _ = right_up.borrow_mut().pull(&mut |row: &R, _| {
                let key = right_key(row);
                right_storage.add(Keyed::new(key.clone(), row.clone()));
                for matched in matches_for(left_storage, &key) {
                    results.add((matched, row.clone()));
                }
                ControlFlow::Continue(())
            });
        } else {
            let _ = right_up.borrow_mut().pull(&mut |row: &R, _| {
                right_storage.add(Keyed::new(right_key(row), row.clone()));
                ControlFlow::Continue(())
            });
            let _ = left_up.borrow_mut().pull(&mut |row: &L, _| {
                let key = left_key(row);
                left_storage.add(Keyed::new(key.clone(), row.clone()));
                for matched in matches_for(right_storage, &key) {
                    results.add((row.clone(), matched));
                }
                ControlFlow::Continue(())
            });
        }

        for pair in self.results.values() {
            each(pair, 1)?;
        }
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.left_up.borrow_mut().disconnect();
        self.right_up.borrow_mut().disconnect();
    }
}
