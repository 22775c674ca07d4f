// Small named-event emitter specialized to the four events every iterator
// exposes (`spec.md` §6: "readable, data(item), end, error(e)") plus the
// internal `newListener` meta-notification §4.D's dual-mode machinery relies
// on. Grounded on `ewe_channels::broadcast`'s subscriber-list/delivery-loop
// shape, adapted from a multi-threaded `Mutex<Vec<_>>` to the single-threaded
// `RefCell<Vec<_>>` this crate's cooperative model calls for.
//
// `spec.md` §9 asks for a generic "named-event emitter"; this crate only ever
// needs these four channels; see `DESIGN.md` for why a fully generic
// string-keyed emitter was not built on top of that.

use std::cell::RefCell;
use std::rc::Rc;

pub type Cause = Rc<anyhow::Error>;

type ZeroArgListener = Box<dyn FnMut()>;
type DataListener<T> = Box<dyn FnMut(&T)>;
type ErrorListener = Box<dyn FnMut(&Cause)>;
type NewListenerHook = Box<dyn FnMut(&'static str)>;

struct Slot<F: ?Sized> {
    id: u64,
    listener: Box<F>,
}

pub struct Events<T> {
    next_id: RefCell<u64>,
    readable: RefCell<Vec<Slot<dyn FnMut()>>>,
    data: RefCell<Vec<Slot<dyn FnMut(&T)>>>,
    end: RefCell<Vec<Slot<dyn FnMut()>>>,
    error: RefCell<Vec<Slot<dyn FnMut(&Cause)>>>,
    new_listener: RefCell<Vec<Slot<dyn FnMut(&'static str)>>>,
    firing_new_listener: std::cell::Cell<bool>,
    pending_new_listener_removals: RefCell<Vec<u64>>,
}

impl<T> Default for Events<T> {
    fn default() -> Self {
        Self {
            next_id: RefCell::new(0),
            readable: RefCell::new(Vec::new()),
            data: RefCell::new(Vec::new()),
            end: RefCell::new(Vec::new()),
            error: RefCell::new(Vec::new()),
            new_listener: RefCell::new(Vec::new()),
            firing_new_listener: std::cell::Cell::new(false),
            pending_new_listener_removals: RefCell::new(Vec::new()),
        }
    }
}

impl<T> Events<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        let mut id = self.next_id.borrow_mut();
        *id += 1;
        *id
    }

    fn fire_new_listener(&self, name: &'static str) {
        // Take the list out so `self.new_listener` isn't borrowed while hooks
        // run: a hook may deregister itself (e.g. `arm_new_listener_hook`)
        // or register a new one mid-fire, and either would otherwise need a
        // second `borrow_mut` on the same `RefCell` we're iterating.
        let mut hooks = std::mem::take(&mut *self.new_listener.borrow_mut());
        self.firing_new_listener.set(true);
        for slot in hooks.iter_mut() {
            (slot.listener)(name);
        }
        self.firing_new_listener.set(false);

        let removed = std::mem::take(&mut *self.pending_new_listener_removals.borrow_mut());
        if !removed.is_empty() {
            hooks.retain(|s| !removed.contains(&s.id));
        }
        // `self.new_listener` may already hold hooks registered by a callback
        // above (those go straight to the live list since it was emptied);
        // put the fired hooks back ahead of them.
        let mut live = self.new_listener.borrow_mut();
        hooks.append(&mut live);
        *live = hooks;
    }

    pub fn on_readable(&self, cb: impl FnMut() + 'static) -> u64 {
        self.fire_new_listener("readable");
        let id = self.next_id();
        self.readable.borrow_mut().push(Slot {
            id,
            listener: Box::new(cb),
        });
        id
    }

    pub fn off_readable(&self, id: u64) {
        self.readable.borrow_mut().retain(|s| s.id != id);
    }

    pub fn on_data(&self, cb: impl FnMut(&T) + 'static) -> u64 {
        self.fire_new_listener("data");
        let id = self.next_id();
        self.data.borrow_mut().push(Slot {
            id,
            listener: Box::new(cb),
        });
        id
    }

    pub fn off_data(&self, id: u64) {
        self.data.borrow_mut().retain(|s| s.id != id);
    }

    #[must_use]
    pub fn data_listener_count(&self) -> usize {
        self.data.borrow().len()
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn readable_listener_count(&self) -> usize {
        self.readable.borrow().len()
    }

    pub fn on_end(&self, cb: impl FnMut() + 'static) -> u64 {
        self.fire_new_listener("end");
        let id = self.next_id();
        self.end.borrow_mut().push(Slot {
            id,
            listener: Box::new(cb),
        });
        id
    }

    pub fn off_end(&self, id: u64) {
        self.end.borrow_mut().retain(|s| s.id != id);
    }

    pub fn on_error(&self, cb: impl FnMut(&Cause) + 'static) -> u64 {
        self.fire_new_listener("error");
        let id = self.next_id();
        self.error.borrow_mut().push(Slot {
            id,
            listener: Box::new(cb),
        });
        id
    }

    pub fn off_error(&self, id: u64) {
        self.error.borrow_mut().retain(|s| s.id != id);
    }

    /// Subscribes a `newListener` meta-hook, fired just before any other
    /// `on_*` subscription is recorded, passing the event name it targets.
    pub fn on_new_listener(&self, cb: impl FnMut(&'static str) + 'static) -> u64 {
        let id = self.next_id();
        self.new_listener.borrow_mut().push(Slot {
            id,
            listener: Box::new(cb),
        });
        id
    }

    pub fn off_new_listener(&self, id: u64) {
        if self.firing_new_listener.get() {
            // Mid-fire: `new_listener` has been taken out by `fire_new_listener`,
            // so record the request and apply it once firing finishes instead.
            self.pending_new_listener_removals.borrow_mut().push(id);
        } else {
            self.new_listener.borrow_mut().retain(|s| s.id != id);
        }
    }

    pub fn emit_readable(&self) {
        for slot in self.readable.borrow_mut().iter_mut() {
            (slot.listener)();
        }
    }

    pub fn emit_data(&self, item: &T) {
        for slot in self.data.borrow_mut().iter_mut() {
            (slot.listener)(item);
        }
    }

    pub fn emit_end(&self) {
        for slot in self.end.borrow_mut().iter_mut() {
            (slot.listener)();
        }
    }

    pub fn emit_error(&self, cause: &Cause) {
        for slot in self.error.borrow_mut().iter_mut() {
            (slot.listener)(cause);
        }
    }

    /// Drops every listener. Called from `_end` per `spec.md` §3: a
    /// destination detaches all event subscriptions on `_end`.
    pub fn clear_all(&self) {
        self.readable.borrow_mut().clear();
        self.data.borrow_mut().clear();
        self.end.borrow_mut().clear();
        self.error.borrow_mut().clear();
        self.new_listener.borrow_mut().clear();
        self.pending_new_listener_removals.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn data_listeners_receive_emitted_items_in_order() {
        let events: Events<i32> = Events::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen1 = seen.clone();
        events.on_data(move |item| seen1.borrow_mut().push(*item));

        events.emit_data(&1);
        events.emit_data(&2);

        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn new_listener_fires_before_subscription_is_recorded() {
        let events: Events<i32> = Events::new();
        let fired_for = Rc::new(RefCell::new(None));

        let fired_for1 = fired_for.clone();
        events.on_new_listener(move |name| *fired_for1.borrow_mut() = Some(name));

        assert_eq!(events.data_listener_count(), 0);
        events.on_data(|_| {});
        assert_eq!(*fired_for.borrow(), Some("data"));
        assert_eq!(events.data_listener_count(), 1);
    }

    #[test]
    fn off_data_stops_future_emissions() {
        let events: Events<i32> = Events::new();
        let count = Rc::new(RefCell::new(0));

        let count1 = count.clone();
        let id = events.on_data(move |_| *count1.borrow_mut() += 1);
        events.emit_data(&1);
        events.off_data(id);
        events.emit_data(&2);

        assert_eq!(*count.borrow(), 1);
        assert_eq!(events.data_listener_count(), 0);
    }

    #[test]
    fn a_hook_may_deregister_itself_during_its_own_firing() {
        let events: Events<i32> = Events::new();
        let id_cell: Rc<RefCell<Option<u64>>> = Rc::new(RefCell::new(None));
        let fire_count = Rc::new(RefCell::new(0));

        let id_cell1 = id_cell.clone();
        let fire_count1 = fire_count.clone();
        let events_rc = Rc::new(events);
        let events_for_hook = events_rc.clone();
        let id = events_rc.on_new_listener(move |_name| {
            *fire_count1.borrow_mut() += 1;
            // Deregister synchronously, from inside the callback, mirroring
            // what `arm_new_listener_hook` does in `core.rs` -- this must not
            // panic with a reentrant `RefCell` borrow.
            events_for_hook.off_new_listener(id_cell1.borrow().unwrap());
        });
        *id_cell.borrow_mut() = Some(id);

        events_rc.on_data(|_| {});
        events_rc.on_data(|_| {});

        assert_eq!(*fire_count.borrow(), 1);
    }
}
