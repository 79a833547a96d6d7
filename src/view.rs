//! The materialization sink at the bottom of a pipeline.
//!
//! A [`View`] folds its source's change-sets into an ordered, duplicate-preserving
//! result: rows equal under the view's comparator are stored once with a
//! multiplicity and expanded on read, so non-injective upstreams (projections)
//! reproduce their duplicates faithfully. Subscribers receive the full current
//! snapshot after every change.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::{Rc, Weak};

use crate::btree::BTree;
use crate::changeset::{ChangeSet, Counted};
use crate::stream::{sink_handle, IntoSourceHandle, Sink, SourceHandle};
use crate::{Comparator, Data, Result, Weight};

/// A materialized, subscribable result set.
pub struct View<T: Data> {
    core: Rc<RefCell<ViewCore<T>>>,
}

struct ViewCore<T: Data> {
    upstream: SourceHandle<T>,
    state: BTree<Counted<T>>,
    subscribers: Vec<(u64, Rc<dyn Fn(&[T])>)>,
    next_subscriber: u64,
}

impl<T: Data> View<T> {
    /// Attaches a view to `upstream`, ordering results by `cmp`.
    ///
    /// `cmp` must distinguish rows the view should keep apart; rows comparing equal
    /// share one multiplicity slot.
    pub fn new(upstream: impl IntoSourceHandle<T>, cmp: Comparator<T>) -> Result<Self> {
        let upstream = upstream.into_handle();
        let counted_cmp: Comparator<Counted<T>> =
            Rc::new(move |a: &Counted<T>, b: &Counted<T>| cmp(&a.row, &b.row));
        let core = Rc::new(RefCell::new(ViewCore {
            upstream: upstream.clone(),
            state: BTree::new(counted_cmp),
            subscribers: Vec::new(),
            next_subscriber: 0,
        }));
        upstream.borrow_mut().set_sink(sink_handle(&core))?;
        Ok(View { core })
    }

    /// Cold-materializes the view: clears state, re-pulls the upstream, and returns
    /// the resulting rows in ascending comparator order.
    pub fn materialize(&self) -> Vec<T> {
        let mut core = self.core.borrow_mut();
        core.state.clear();
        let upstream = core.upstream.clone();
        let state = &mut core.state;
        let _ = upstream.borrow_mut().pull(&mut |row, weight| {
            ViewCore::apply(state, row.clone(), weight);
            ControlFlow::Continue(())
        });
        core.snapshot()
    }

    /// The current contents, without re-pulling.
    pub fn current_state(&self) -> Vec<T> {
        self.core.borrow().snapshot()
    }

    /// Registers a subscriber, immediately invokes it with the current snapshot,
    /// and returns a handle that removes it again.
    pub fn subscribe(&self, callback: impl Fn(&[T]) + 'static) -> Subscription<T> {
        let callback: Rc<dyn Fn(&[T])> = Rc::new(callback);
        let (id, snapshot) = {
            let mut core = self.core.borrow_mut();
            let id = core.next_subscriber;
            core.next_subscriber += 1;
            core.subscribers.push((id, callback.clone()));
            (id, core.snapshot())
        };
        callback(&snapshot);
        Subscription {
            core: Rc::downgrade(&self.core),
            id,
        }
    }

    /// Clears state and subscribers and detaches from the upstream pipeline.
    pub fn disconnect(&self) {
        let upstream = {
            let mut core = self.core.borrow_mut();
            core.state.clear();
            core.subscribers.clear();
            core.upstream.clone()
        };
        upstream.borrow_mut().disconnect();
    }
}

impl<T: Data> ViewCore<T> {
    fn apply(state: &mut BTree<Counted<T>>, row: T, weight: Weight) {
        let probe = Counted { row, count: 0 };
        match state.get(&probe).map(|c| c.count) {
            Some(count) => {
                let count = count + weight;
                if count > 0 {
                    state.add(Counted { row: probe.row, count });
                } else {
                    if count < 0 {
                        tracing::warn!("view multiplicity went negative; dropping row");
                    }
                    state.delete(&probe);
                }
            }
            None => {
                if weight > 0 {
                    state.add(Counted {
                        row: probe.row,
                        count: weight,
                    });
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.state.len());
        for counted in self.state.values() {
            for _ in 0..counted.count {
                out.push(counted.row.clone());
            }
        }
        out
    }
}

impl<T: Data> Sink<T> for RefCell<ViewCore<T>> {
    fn push(&self, delta: ChangeSet<T>) {
        let (snapshot, subscribers) = {
            let mut core = self.borrow_mut();
            for (row, weight) in delta {
                if weight != 0 {
                    ViewCore::apply(&mut core.state, row, weight);
                }
            }
            let subscribers: Vec<Rc<dyn Fn(&[T])>> =
                core.subscribers.iter().map(|(_, cb)| cb.clone()).collect();
            (core.snapshot(), subscribers)
        };
        for callback in subscribers {
            callback(&snapshot);
        }
    }
}

/// A handle to a registered subscriber.
pub struct Subscription<T: Data> {
    core: Weak<RefCell<ViewCore<T>>>,
    id: u64,
}

impl<T: Data> Subscription<T> {
    /// Removes the subscriber. Does nothing if the view is gone.
    pub fn unsubscribe(self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}
