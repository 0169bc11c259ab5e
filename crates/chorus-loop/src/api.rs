use std::{cell::RefCell, os::fd::RawFd, rc::Rc};

use bitflags::bitflags;
use chorus_timing::Timeval;

bitflags! {
    /// Readiness interest / report mask for an IO event source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoEvents: u32 {
        const INPUT = 1;
        const OUTPUT = 2;
        const HANGUP = 4;
        const ERROR = 8;
    }
}

pub type IoEventCb = Box<dyn FnMut(&IoEvent, RawFd, IoEvents)>;
pub type TimeEventCb = Box<dyn FnMut(&TimeEvent, Timeval)>;
pub type DeferEventCb = Box<dyn FnMut(&DeferEvent)>;
pub type DestroyCb = Box<dyn FnOnce()>;

/// Backend half of an IO event handle.
pub trait IoEventImpl {
    fn enable(&self, events: IoEvents);
    fn free(&self);
    fn set_destroy(&self, cb: DestroyCb);
}

/// Backend half of a timer handle. Timers are one-shot; a callback may
/// re-arm its own event with [`TimeEventImpl::restart`].
pub trait TimeEventImpl {
    /// Re-arms for `deadline`; `None` disarms without freeing.
    fn restart(&self, deadline: Option<Timeval>);
    fn free(&self);
    fn set_destroy(&self, cb: DestroyCb);
}

/// Backend half of a defer event handle.
pub trait DeferEventImpl {
    fn enable(&self, on: bool);
    fn free(&self);
    fn set_destroy(&self, cb: DestroyCb);
}

/// Handle to an IO event source. Cloning does not duplicate the source;
/// all clones refer to the same registration.
#[derive(Clone)]
pub struct IoEvent(Rc<dyn IoEventImpl>);

impl IoEvent {
    pub fn from_impl(imp: Rc<dyn IoEventImpl>) -> Self {
        Self(imp)
    }

    pub fn enable(&self, events: IoEvents) {
        self.0.enable(events);
    }

    /// Marks the source for removal. The backend retains it until the
    /// current dispatch phase ends, so freeing from inside a callback
    /// (including the source's own) is safe.
    pub fn free(&self) {
        self.0.free();
    }

    pub fn set_destroy(&self, cb: DestroyCb) {
        self.0.set_destroy(cb);
    }
}

/// Handle to a timer event source.
#[derive(Clone)]
pub struct TimeEvent(Rc<dyn TimeEventImpl>);

impl TimeEvent {
    pub fn from_impl(imp: Rc<dyn TimeEventImpl>) -> Self {
        Self(imp)
    }

    pub fn restart(&self, deadline: Option<Timeval>) {
        self.0.restart(deadline);
    }

    pub fn free(&self) {
        self.0.free();
    }

    pub fn set_destroy(&self, cb: DestroyCb) {
        self.0.set_destroy(cb);
    }
}

/// Handle to a defer event source.
#[derive(Clone)]
pub struct DeferEvent(Rc<dyn DeferEventImpl>);

impl DeferEvent {
    pub fn from_impl(imp: Rc<dyn DeferEventImpl>) -> Self {
        Self(imp)
    }

    pub fn enable(&self, on: bool) {
        self.0.enable(on);
    }

    pub fn free(&self) {
        self.0.free();
    }

    pub fn set_destroy(&self, cb: DestroyCb) {
        self.0.set_destroy(cb);
    }
}

/// The event-loop abstraction every other component is written against.
///
/// Scheduling contract, identical for all backends: single-threaded and
/// cooperative. Within one loop iteration, every defer event enabled at the
/// start of the iteration fires (in enablement order) before the loop blocks;
/// then expired timers fire in deadline order, then IO events in fd order.
/// Callbacks may create, enable, disable or free any event source, including
/// their own.
pub trait MainloopApi {
    fn io_new(&self, fd: RawFd, events: IoEvents, cb: IoEventCb) -> IoEvent;
    fn time_new(&self, deadline: Timeval, cb: TimeEventCb) -> TimeEvent;
    fn defer_new(&self, cb: DeferEventCb) -> DeferEvent;

    /// Asks the loop to stop. Externally driven backends cannot stop their
    /// host and implement this as a no-op.
    fn quit(&self, retval: i32);
}

/// Shared handle to a mainloop backend, passed to every component that
/// registers event sources.
pub type Api = Rc<dyn MainloopApi>;

/// Runs `f` from the loop exactly once, then releases the underlying
/// defer event.
pub fn once<F: FnOnce() + 'static>(api: &Api, f: F) {
    let slot = RefCell::new(Some(f));
    api.defer_new(Box::new(move |e| {
        e.free();
        if let Some(f) = slot.borrow_mut().take() {
            f();
        }
    }));
}
