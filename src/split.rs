//! Fan-out: N independent branches over one upstream source.
//!
//! A source feeds exactly one sink; [`SplitStream`] is the sanctioned way around
//! that. It attaches once to the upstream and hands out [`Branch`]es, each an
//! independent [`Source`] with its own sink slot. A push into the split is delivered
//! to every live branch; a branch pull re-reads the upstream.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::{Rc, Weak};

use crate::changeset::ChangeSet;
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::{Data, Result};

/// Splits one source into independently consumable branches.
pub struct SplitStream<T: Data> {
    core: Rc<RefCell<SplitCore<T>>>,
}

struct SplitCore<T: Data> {
    upstream: SourceHandle<T>,
    branches: Vec<Weak<RefCell<Branch<T>>>>,
    /// Branches handed out and not yet disconnected.
    active: usize,
}

impl<T: Data> SplitStream<T> {
    /// Attaches a splitter to `upstream`.
    pub fn new(upstream: impl IntoSourceHandle<T>) -> Result<Self> {
        let upstream = upstream.into_handle();
        let core = Rc::new(RefCell::new(SplitCore {
            upstream: upstream.clone(),
            branches: Vec::new(),
            active: 0,
        }));
        upstream.borrow_mut().set_sink(sink_handle(&core))?;
        Ok(SplitStream { core })
    }

    /// Opens a new independent branch.
    pub fn branch(&self) -> SourceHandle<T> {
        let branch = Rc::new(RefCell::new(Branch {
            core: self.core.clone(),
            sink: SinkSlot::new("split branch"),
            detached: false,
        }));
        let mut core = self.core.borrow_mut();
        core.branches.push(Rc::downgrade(&branch));
        core.active += 1;
        branch
    }
}

impl<T: Data> Sink<T> for RefCell<SplitCore<T>> {
    fn push(&self, delta: ChangeSet<T>) {
        let slots: Vec<SinkSlot<T>> = {
            let mut core = self.borrow_mut();
            core.branches.retain(|b| b.strong_count() > 0);
            core.branches
                .iter()
                .filter_map(Weak::upgrade)
                .map(|b| b.borrow().sink.clone())
                .collect()
        };
        for slot in slots {
            slot.push(delta.clone());
        }
    }
}

/// One independent reader over a split upstream.
pub struct Branch<T: Data> {
    core: Rc<RefCell<SplitCore<T>>>,
    sink: SinkSlot<T>,
    detached: bool,
}

impl<T: Data> Source<T> for Branch<T> {
    fn size(&self) -> usize {
        let upstream = self.core.borrow().upstream.clone();
        let size = upstream.borrow().size();
        size
    }

    fn set_sink(&mut self, sink: SinkHandle<T>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, T>) -> ControlFlow<()> {
        let upstream = self.core.borrow().upstream.clone();
        let flow = upstream.borrow_mut().pull(each);
        flow
    }

    fn disconnect(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.sink.clear();
        let upstream = {
            let mut core = self.core.borrow_mut();
            core.active -= 1;
            (core.active == 0).then(|| core.upstream.clone())
        };
        // The last branch to leave releases the upstream.
        if let Some(upstream) = upstream {
            upstream.borrow_mut().disconnect();
        }
    }
}
