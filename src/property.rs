// Property store shared by every iterator. `spec.md` §3: "a mapping from
// string names to opaque values, plus a mapping from names to an ordered list
// of one-argument callbacks awaiting first assignment. On setProperty, queued
// callbacks for that name are scheduled (all of them) on the next tick, then
// removed."

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

use crate::scheduler;

type PropertyCallback = Box<dyn FnOnce(&Rc<dyn Any>)>;

#[derive(Default)]
pub struct PropertyStore {
    values: HashMap<String, Rc<dyn Any>>,
    pending: HashMap<String, Vec<PropertyCallback>>,
}

impl PropertyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to `value`, scheduling every callback queued against that
    /// name (in order, all on the next tick) and then forgetting them.
    pub fn set(&mut self, name: &str, value: Rc<dyn Any>) {
        self.values.insert(name.to_string(), value.clone());

        if let Some(callbacks) = self.pending.remove(name) {
            for cb in callbacks {
                let value = value.clone();
                scheduler::schedule(move || cb(&value));
            }
        }
    }

    pub fn set_many(&mut self, values: impl IntoIterator<Item = (String, Rc<dyn Any>)>) {
        for (name, value) in values {
            self.set(&name, value);
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.values.get(name).cloned()
    }

    /// Reads `name` if present; otherwise queues `cb` to fire (via the
    /// scheduler) the first time `name` is set.
    pub fn get_or_wait(&mut self, name: &str, cb: impl FnOnce(&Rc<dyn Any>) + 'static) {
        if let Some(value) = self.values.get(name).cloned() {
            scheduler::schedule(move || cb(&value));
            return;
        }
        self.pending
            .entry(name.to_string())
            .or_default()
            .push(Box::new(cb));
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Rc<dyn Any>> {
        self.values.clone()
    }

    pub fn copy_from(&mut self, source: &PropertyStore, names: &[&str]) {
        for name in names {
            if let Some(value) = source.get(name) {
                self.set(name, value);
            }
        }
    }

    /// Releases all stored values and any still-pending callbacks. Called on
    /// `_end` per `spec.md` §3: "Properties, buffers, and callbacks are
    /// released on `_end`."
    pub fn release(&mut self) {
        self.values.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::QueueScheduler;
    use std::cell::RefCell;

    #[test]
    fn set_then_get_round_trips() {
        let mut store = PropertyStore::new();
        store.set("name", Rc::new(42_i32));
        let got = store.get("name").unwrap();
        assert_eq!(*got.downcast_ref::<i32>().unwrap(), 42);
    }

    #[test]
    fn pending_callbacks_fire_once_on_first_set_and_are_forgotten() {
        let sched = Rc::new(QueueScheduler::new());
        scheduler::set(sched.clone());

        let mut store = PropertyStore::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen1 = seen.clone();
        store.get_or_wait("x", move |v| {
            seen1.borrow_mut().push(*v.downcast_ref::<i32>().unwrap())
        });
        let seen2 = seen.clone();
        store.get_or_wait("x", move |v| {
            seen2.borrow_mut().push(*v.downcast_ref::<i32>().unwrap())
        });

        store.set("x", Rc::new(7_i32));
        sched.run_until_idle();

        assert_eq!(*seen.borrow(), vec![7, 7]);

        // a second set must not re-trigger the already-delivered callbacks
        store.set("x", Rc::new(9_i32));
        sched.run_until_idle();
        assert_eq!(*seen.borrow(), vec![7, 7]);
    }

    #[test]
    fn release_clears_values_and_pending() {
        let sched = Rc::new(QueueScheduler::new());
        scheduler::set(sched.clone());

        let mut store = PropertyStore::new();
        store.set("a", Rc::new(1_i32));
        store.get_or_wait("b", |_| {});
        store.release();

        assert!(store.get("a").is_none());
        store.set("b", Rc::new(2_i32));
        sched.run_until_idle();
        // no panic, and the old pending callback for "b" is gone
    }
}
