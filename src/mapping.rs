// Synchronous element-wise transform with null-skip, `spec.md` §4.F. Not a
// buffered iterator: a mapping iterator has no internal queue of its own, it
// just drains its source on demand and re-shapes what comes out.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::core::{init_dual_mode, AsyncIterator, Core, Iter};
use crate::emitter::Cause;
use crate::state::IterState;

/// `S -> D | None`. Returning `None` tells the mapping iterator to keep
/// draining the source for the next candidate instead of yielding nothing.
pub type MapFn<S, D> = Box<dyn FnMut(S) -> Option<D>>;

pub struct MappingIterator<S: Clone + 'static, D: Clone + 'static> {
    core: Core<D>,
    source: Iter<S>,
    map: RefCell<MapFn<S, D>>,
    destroy_source: bool,
    self_weak: Weak<Self>,
}

impl<S: Clone + 'static, D: Clone + 'static> MappingIterator<S, D> {
    #[must_use]
    pub fn new(source: Iter<S>, map: MapFn<S, D>, destroy_source: bool) -> Rc<Self> {
        let already_done = source.done();
        let rc = Rc::new_cyclic(|weak| MappingIterator {
            core: Core::new(),
            source,
            map: RefCell::new(map),
            destroy_source,
            self_weak: weak.clone(),
        });
        rc.core.change_state(IterState::Open);
        init_dual_mode::<D, _>(&rc);

        if already_done {
            rc.close();
            return rc;
        }

        let weak_readable: Weak<Self> = rc.self_weak.clone();
        rc.source.0.core().events.on_readable(move || {
            if let Some(strong) = weak_readable.upgrade() {
                strong.core.set_readable(true);
            }
        });

        let weak_end: Weak<Self> = rc.self_weak.clone();
        rc.source.0.core().events.on_end(move || {
            if let Some(strong) = weak_end.upgrade() {
                strong.close();
            }
        });

        let weak_error: Weak<Self> = rc.self_weak.clone();
        rc.source.0.core().events.on_error(move |cause: &Cause| {
            if let Some(strong) = weak_error.upgrade() {
                strong.core.events.emit_error(cause);
            }
        });

        rc.core.set_readable(rc.source.readable());
        rc
    }
}

impl<S: Clone + 'static, D: Clone + 'static> AsyncIterator<D> for MappingIterator<S, D> {
    fn core(&self) -> &Core<D> {
        &self.core
    }

    /// Drains the source until the map yields `Some`, or the source is
    /// exhausted. `spec.md` §4.F.
    fn read(&self) -> Option<D> {
        if self.core.done() {
            return None;
        }
        loop {
            let Some(item) = self.source.read() else {
                if self.source.done() {
                    self.core.set_readable(false);
                }
                return None;
            };
            if let Some(mapped) = (self.map.borrow_mut())(item) {
                return Some(mapped);
            }
        }
    }

    fn weak_dyn(&self) -> Weak<dyn AsyncIterator<D>> {
        self.self_weak.clone()
    }

    fn on_end_hook(&self) {
        self.source.0.core().events.clear_all();
        if self.destroy_source {
            self.source.destroy(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::ArrayIter;
    use crate::scheduler::{self, QueueScheduler};
    use crate::testing::block_on;

    fn new_scheduler() -> Rc<QueueScheduler> {
        let sched = Rc::new(QueueScheduler::new());
        scheduler::set(sched.clone());
        sched
    }

    #[test]
    fn maps_every_item_in_order() {
        let sched = new_scheduler();
        let source = Iter::new(ArrayIter::new(vec![1, 2, 3], true, true) as Rc<dyn AsyncIterator<i32>>);
        let mapped = MappingIterator::new(source, Box::new(|x: i32| Some(x * 10)), true);
        let iter = Iter::new(mapped as Rc<dyn AsyncIterator<i32>>);

        let result = block_on(&sched, iter.to_array(None));
        assert_eq!(result, vec![10, 20, 30]);
    }

    #[test]
    fn skips_items_the_map_returns_none_for() {
        let sched = new_scheduler();
        let source = Iter::new(ArrayIter::new(vec![1, 2, 3, 4, 5], true, true) as Rc<dyn AsyncIterator<i32>>);
        let mapped = MappingIterator::new(
            source,
            Box::new(|x: i32| if x % 2 == 0 { Some(x) } else { None }),
            true,
        );
        let iter = Iter::new(mapped as Rc<dyn AsyncIterator<i32>>);

        let result = block_on(&sched, iter.to_array(None));
        assert_eq!(result, vec![2, 4]);
    }

    #[test]
    fn closes_immediately_when_source_is_already_done() {
        let sched = new_scheduler();
        let source = Iter::new(ArrayIter::<i32>::new(vec![], true, true) as Rc<dyn AsyncIterator<i32>>);
        sched.run_until_idle();
        assert!(source.done());

        let mapped = MappingIterator::new(source, Box::new(Some), true);
        sched.run_until_idle();
        assert!(mapped.done());
    }
}
