//! Slot bookkeeping shared by both loop backends.
//!
//! Event sources live in per-kind lists. Freeing marks a slot dead; the
//! owning backend sweeps dead slots only between dispatch phases, so a
//! callback can free any source (including its own) without the dispatcher
//! ever touching a released slot.

use std::{
    cell::{Cell, RefCell},
    os::fd::RawFd,
    rc::Rc,
};

use chorus_timing::Timeval;

use crate::api::{
    DeferEvent, DeferEventCb, DeferEventImpl, DestroyCb, IoEvent, IoEventCb, IoEventImpl, IoEvents,
    TimeEvent, TimeEventCb, TimeEventImpl,
};

pub(crate) struct IoSlot {
    pub fd: RawFd,
    pub interest: Cell<IoEvents>,
    pub dead: Cell<bool>,
    cb: RefCell<Option<IoEventCb>>,
    destroy: RefCell<Option<DestroyCb>>,
}

impl IoEventImpl for IoSlot {
    fn enable(&self, events: IoEvents) {
        self.interest.set(events);
    }

    fn free(&self) {
        self.dead.set(true);
    }

    fn set_destroy(&self, cb: DestroyCb) {
        *self.destroy.borrow_mut() = Some(cb);
    }
}

pub(crate) struct TimeSlot {
    pub deadline: Cell<Option<Timeval>>,
    pub dead: Cell<bool>,
    cb: RefCell<Option<TimeEventCb>>,
    destroy: RefCell<Option<DestroyCb>>,
}

impl TimeEventImpl for TimeSlot {
    fn restart(&self, deadline: Option<Timeval>) {
        self.deadline.set(deadline);
    }

    fn free(&self) {
        self.dead.set(true);
    }

    fn set_destroy(&self, cb: DestroyCb) {
        *self.destroy.borrow_mut() = Some(cb);
    }
}

pub(crate) struct DeferSlot {
    pub enabled: Cell<bool>,
    pub dead: Cell<bool>,
    cb: RefCell<Option<DeferEventCb>>,
    destroy: RefCell<Option<DestroyCb>>,
}

impl DeferEventImpl for DeferSlot {
    fn enable(&self, on: bool) {
        self.enabled.set(on);
    }

    fn free(&self) {
        self.dead.set(true);
    }

    fn set_destroy(&self, cb: DestroyCb) {
        *self.destroy.borrow_mut() = Some(cb);
    }
}

/// The callback is taken out of the slot for the duration of the call, so a
/// callback freeing or reconfiguring its own slot never observes a borrow.
pub(crate) fn fire_io(slot: &Rc<IoSlot>, events: IoEvents) {
    if slot.dead.get() {
        return;
    }
    let Some(mut cb) = slot.cb.borrow_mut().take() else { return };
    let handle = IoEvent::from_impl(Rc::clone(slot) as Rc<dyn IoEventImpl>);
    cb(&handle, slot.fd, events);
    if !slot.dead.get() {
        *slot.cb.borrow_mut() = Some(cb);
    }
}

pub(crate) fn fire_time(slot: &Rc<TimeSlot>, deadline: Timeval) {
    if slot.dead.get() {
        return;
    }
    let Some(mut cb) = slot.cb.borrow_mut().take() else { return };
    let handle = TimeEvent::from_impl(Rc::clone(slot) as Rc<dyn TimeEventImpl>);
    cb(&handle, deadline);
    if !slot.dead.get() {
        *slot.cb.borrow_mut() = Some(cb);
    }
}

pub(crate) fn fire_defer(slot: &Rc<DeferSlot>) {
    if slot.dead.get() || !slot.enabled.get() {
        return;
    }
    let Some(mut cb) = slot.cb.borrow_mut().take() else { return };
    let handle = DeferEvent::from_impl(Rc::clone(slot) as Rc<dyn DeferEventImpl>);
    cb(&handle);
    if !slot.dead.get() {
        *slot.cb.borrow_mut() = Some(cb);
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    ios: RefCell<Vec<Rc<IoSlot>>>,
    times: RefCell<Vec<Rc<TimeSlot>>>,
    defers: RefCell<Vec<Rc<DeferSlot>>>,
}

impl Registry {
    pub fn io_new(&self, fd: RawFd, events: IoEvents, cb: IoEventCb) -> IoEvent {
        let slot = Rc::new(IoSlot {
            fd,
            interest: Cell::new(events),
            dead: Cell::new(false),
            cb: RefCell::new(Some(cb)),
            destroy: RefCell::new(None),
        });
        self.ios.borrow_mut().push(Rc::clone(&slot));
        IoEvent::from_impl(slot)
    }

    pub fn time_new(&self, deadline: Timeval, cb: TimeEventCb) -> TimeEvent {
        let slot = Rc::new(TimeSlot {
            deadline: Cell::new(Some(deadline)),
            dead: Cell::new(false),
            cb: RefCell::new(Some(cb)),
            destroy: RefCell::new(None),
        });
        self.times.borrow_mut().push(Rc::clone(&slot));
        TimeEvent::from_impl(slot)
    }

    /// Defer events start enabled.
    pub fn defer_new(&self, cb: DeferEventCb) -> DeferEvent {
        let slot = Rc::new(DeferSlot {
            enabled: Cell::new(true),
            dead: Cell::new(false),
            cb: RefCell::new(Some(cb)),
            destroy: RefCell::new(None),
        });
        self.defers.borrow_mut().push(Rc::clone(&slot));
        DeferEvent::from_impl(slot)
    }

    pub fn snapshot_ios(&self) -> Vec<Rc<IoSlot>> {
        self.ios.borrow().clone()
    }

    pub fn snapshot_times(&self) -> Vec<Rc<TimeSlot>> {
        self.times.borrow().clone()
    }

    pub fn snapshot_defers(&self) -> Vec<Rc<DeferSlot>> {
        self.defers.borrow().clone()
    }

    pub fn next_deadline(&self) -> Option<Timeval> {
        self.times.borrow().iter().filter(|t| !t.dead.get()).filter_map(|t| t.deadline.get()).min()
    }

    pub fn any_defer_enabled(&self) -> bool {
        self.defers.borrow().iter().any(|d| !d.dead.get() && d.enabled.get())
    }

    /// Releases dead slots and runs their destroy callbacks. The lists are
    /// not borrowed while user code runs, so destroy callbacks may create
    /// or free further sources.
    pub fn sweep(&self) {
        fn extract<T>(list: &RefCell<Vec<Rc<T>>>, is_dead: impl Fn(&T) -> bool) -> Vec<Rc<T>> {
            let mut dead = Vec::new();
            list.borrow_mut().retain(|s| {
                if is_dead(s) {
                    dead.push(Rc::clone(s));
                    false
                } else {
                    true
                }
            });
            dead
        }

        for s in extract(&self.ios, |s| s.dead.get()) {
            s.cb.borrow_mut().take();
            if let Some(d) = s.destroy.borrow_mut().take() {
                d();
            }
        }
        for s in extract(&self.times, |s| s.dead.get()) {
            s.cb.borrow_mut().take();
            if let Some(d) = s.destroy.borrow_mut().take() {
                d();
            }
        }
        for s in extract(&self.defers, |s| s.dead.get()) {
            s.cb.borrow_mut().take();
            if let Some(d) = s.destroy.borrow_mut().take() {
                d();
            }
        }
    }
}
