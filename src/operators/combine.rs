//! Pair rows from two upstream sources into merged results.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

use fnv::FnvHashMap;

use crate::changeset::ChangeSet;
use crate::row::{fingerprint, Record};
use crate::stream::{
    sink_handle, BinaryOperator, Each, IntoSourceHandle, LeftPort, RightPort, Sink, SinkHandle,
    SinkSlot, Source, SourceHandle,
};
use crate::{Data, Result, Value};

/// Merges two single-row streams into one, recomputing on any push from either
/// side.
///
/// Built for the scalar aggregations, which always carry exactly one current row:
/// each side's latest positive-weight record is absorbed, and once both sides are
/// known, `merger(left, right)` is emitted as retract-old/assert-new whenever it
/// changes. The average aggregation is the canonical user, pairing a running sum
/// with a running count.
pub struct Combine<L: Data, R: Data, O: Data> {
    left_up: SourceHandle<L>,
    right_up: SourceHandle<R>,
    merger: Box<dyn Fn(&L, &R) -> O>,
    left_value: Option<L>,
    right_value: Option<R>,
    current: Option<O>,
    sink: SinkSlot<O>,
    left_port: Option<Rc<LeftPort<Self>>>,
    right_port: Option<Rc<RightPort<Self>>>,
}

impl<L: Data, R: Data, O: Data> Combine<L, R, O> {
    /// Attaches a combine to the two upstreams.
    pub fn new(
        left: impl IntoSourceHandle<L>,
        right: impl IntoSourceHandle<R>,
        merger: impl Fn(&L, &R) -> O + 'static,
    ) -> Result<Rc<RefCell<Self>>> {
        let left = left.into_handle();
        let right = right.into_handle();
        let op = Rc::new(RefCell::new(Combine {
            left_up: left.clone(),
            right_up: right.clone(),
            merger: Box::new(merger),
            left_value: None,
            right_value: None,
            current: None,
            sink: SinkSlot::new("combine"),
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

    /// Recomputes the merged result, returning the retract/assert delta when it
    /// changed.
    fn recompute(&mut self) -> ChangeSet<O> {
        let (Some(left), Some(right)) = (&self.left_value, &self.right_value) else {
            return ChangeSet::zero();
        };
        let next = (self.merger)(left, right);
        let changed = match &self.current {
            None => true,
            Some(current) => fingerprint(current) != fingerprint(&next),
        };
        if !changed {
            return ChangeSet::zero();
        }
        let mut out = ChangeSet::zero();
        if let Some(old) = self.current.take() {
            out.append(old, -1);
        }
        out.append(next.clone(), 1);
        self.current = Some(next);
        out
    }
}

impl<L: Data, R: Data, O: Data> BinaryOperator for Combine<L, R, O> {
    type Left = L;
    type Right = R;
    type Out = O;

    fn apply_left(&mut self, delta: ChangeSet<L>) -> ChangeSet<O> {
        for (value, weight) in delta {
            if weight > 0 {
                self.left_value = Some(value);
            }
        }
        self.recompute()
    }

    fn apply_right(&mut self, delta: ChangeSet<R>) -> ChangeSet<O> {
        for (value, weight) in delta {
            if weight > 0 {
                self.right_value = Some(value);
            }
        }
        self.recompute()
    }

    fn out_slot(&self) -> SinkSlot<O> {
        self.sink.clone()
    }
}

impl<L: Data, R: Data, O: Data> Source<O> for Combine<L, R, O> {
    fn size(&self) -> usize {
        usize::from(self.current.is_some())
    }

    fn set_sink(&mut self, sink: SinkHandle<O>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, O>) -> ControlFlow<()> {
        self.left_value = None;
        self.right_value = None;
        self.current = None;

        let (left_up, right_up) = (self.left_up.clone(), self.right_up.clone());
        let left_value = &mut self.left_value;
        let _ = left_up.borrow_mut().pull(&mut |value: &L, weight| {
            if weight > 0 {
                *left_value = Some(value.clone());
            }
            ControlFlow::Continue(())
        });
        let right_value = &mut self.right_value;
        let _ = right_up.borrow_mut().pull(&mut |value: &R, weight| {
            if weight > 0 {
                *right_value = Some(value.clone());
            }
            ControlFlow::Continue(())
        });
        let _ = self.recompute();

        if let Some(current) = &self.current {
            each(current, 1)?;
        }
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.left_up.borrow_mut().disconnect();
        self.right_up.borrow_mut().disconnect();
    }
}

/// Pairs multi-row streams by the values of shared key columns.
///
/// Each side's rows live in a map keyed by the serialized key-column tuple. A push
/// updates its side and recomputes `merger(left, right)` for every affected key;
/// keys present on only one side produce nothing, and losing either side of a pair
/// retracts its result. Built for pairing per-group aggregations that share
/// grouping columns.
pub struct MultiRowCombine<L: Record, R: Record, O: Data> {
    left_up: SourceHandle<L>,
    right_up: SourceHandle<R>,
    key_columns: Rc<[String]>,
    merger: Box<dyn Fn(&L, &R) -> O>,
    left_rows: FnvHashMap<String, L>,
    right_rows: FnvHashMap<String, R>,
    current: FnvHashMap<String, O>,
    sink: SinkSlot<O>,
    left_port: Option<Rc<LeftPort<Self>>>,
    right_port: Option<Rc<RightPort<Self>>>,
}

impl<L: Record, R: Record, O: Data> MultiRowCombine<L, R, O> {
    /// Attaches a multi-row combine pairing rows on the named key columns.
    pub fn new(
        left: impl IntoSourceHandle<L>,
        right: impl IntoSourceHandle<R>,
        key_columns: &[&str],
        merger: impl Fn(&L, &R) -> O + 'static,
    ) -> Result<Rc<RefCell<Self>>> {
        let left = left.into_handle();
        let right = right.into_handle();
        let op = Rc::new(RefCell::new(MultiRowCombine {
            left_up: left.clone(),
            right_up: right.clone(),
            key_columns: key_columns.iter().map(|k| k.to_string()).collect(),
            merger: Box::new(merger),
            left_rows: FnvHashMap::default(),
            right_rows: FnvHashMap::default(),
            current: FnvHashMap::default(),
            sink: SinkSlot::new("multi-row combine"),
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

    fn key_of(key_columns: &[String], row: &impl Record) -> String {
        let tuple: Vec<Value> = key_columns.iter().map(|k| row.column(k)).collect();
        fingerprint(&tuple)
    }

    fn recompute_key(&mut self, key: &str, out: &mut ChangeSet<O>) {
        match (self.left_rows.get(key), self.right_rows.get(key)) {
            (Some(left), Some(right)) => {
                let next = (self.merger)(left, right);
                match self.current.get(key) {
                    Some(old) if fingerprint(old) == fingerprint(&next) => {}
                    Some(old) => {
                        out.append(old.clone(), -1);
                        out.append(next.clone(), 1);
                        self.current.insert(key.to_string(), next);
                    }
                    None => {
                        out.append(next.clone(), 1);
                        self.current.insert(key.to_string(), next);
                    }
                }
            }
            _ => {
                if let Some(old) = self.current.remove(key) {
                    out.append(old, -1);
                }
            }
        }
    }

    fn absorb<S: Record>(
        rows: &mut FnvHashMap<String, S>,
        key_columns: &[String],
        delta: ChangeSet<S>,
    ) -> Vec<String> {
        let mut affected = Vec::new();
        for (row, weight) in delta {
            let key = Self::key_of(key_columns, &row);
            if !affected.contains(&key) {
                affected.push(key.clone());
            }
            if weight > 0 {
                rows.insert(key, row);
            } else if weight < 0 {
                rows.remove(&key);
            }
        }
        affected
    }
}

impl<L: Record, R: Record, O: Data> BinaryOperator for MultiRowCombine<L, R, O> {
    type Left = L;
    type Right = R;
    type Out = O;

    fn apply_left(&mut self, delta: ChangeSet<L>) -> ChangeSet<O> {
        let key_columns = self.key_columns.clone();
        let affected = Self::absorb(&mut self.left_rows, &key_columns, delta);
        let mut out = ChangeSet::zero();
        for key in affected {
            self.recompute_key(&key, &mut out);
        }
        out
    }

    fn apply_right(&mut self, delta: ChangeSet<R>) -> ChangeSet<O> {
        let key_columns = self.key_columns.clone();
        let affected = Self::absorb(&mut self.right_rows, &key_columns, delta);
        let mut out = ChangeSet::zero();
        for key in affected {
            self.recompute_key(&key, &mut out);
        }
        out
    }

    fn out_slot(&self) -> SinkSlot<O> {
        self.sink.clone()
    }
}

impl<L: Record, R: Record, O: Data> Source<O> for MultiRowCombine<L, R, O> {
    fn size(&self) -> usize {
        self.current.len()
    }

    fn set_sink(&mut self, sink: SinkHandle<O>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, O>) -> ControlFlow<()> {
        self.left_rows.clear();
        self.right_rows.clear();
        self.current.clear();

        let (left_up, right_up) = (self.left_up.clone(), self.right_up.clone());
        let key_columns = self.key_columns.clone();
        let left_rows = &mut self.left_rows;
        let _ = left_up.borrow_mut().pull(&mut |row: &L, weight| {
            if weight > 0 {
                left_rows.insert(Self::key_of(&key_columns, row), row.clone());
            }
            ControlFlow::Continue(())
        });
        let right_rows = &mut self.right_rows;
        let _ = right_up.borrow_mut().pull(&mut |row: &R, weight| {
            if weight > 0 {
                right_rows.insert(Self::key_of(&key_columns, row), row.clone());
            }
            ControlFlow::Continue(())
        });

        let mut keys: Vec<String> = self.left_rows.keys().cloned().collect();
        keys.sort();
        let mut discard = ChangeSet::zero();
        for key in &keys {
            self.recompute_key(key, &mut discard);
        }
        for key in &keys {
            if let Some(result) = self.current.get(key) {
                each(result, 1)?;
            }
        }
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.left_up.borrow_mut().disconnect();
        self.right_up.borrow_mut().disconnect();
    }
}
