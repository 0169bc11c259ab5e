use std::{os::fd::RawFd, rc::Rc};

use chorus_timing::Timeval;
use tracing::debug;

use crate::{
    api::{
        Api, DeferEvent, DeferEventCb, IoEvent, IoEventCb, IoEvents, MainloopApi, TimeEvent,
        TimeEventCb,
    },
    registry::{self, Registry},
};

struct ExtInner {
    registry: Registry,
}

impl MainloopApi for ExtInner {
    fn io_new(&self, fd: RawFd, events: IoEvents, cb: IoEventCb) -> IoEvent {
        self.registry.io_new(fd, events, cb)
    }

    fn time_new(&self, deadline: Timeval, cb: TimeEventCb) -> TimeEvent {
        self.registry.time_new(deadline, cb)
    }

    fn defer_new(&self, cb: DeferEventCb) -> DeferEvent {
        self.registry.defer_new(cb)
    }

    /// The host owns the outer loop; only the host can stop it.
    fn quit(&self, retval: i32) {
        debug!(retval, "quit ignored on externally driven loop");
    }
}

/// Backend for embedding into a foreign event loop.
///
/// The host polls the fds reported by [`interests`](Self::interests), tracks
/// the deadline from [`next_deadline`](Self::next_deadline), and feeds
/// readiness and time back through the `dispatch_*` entry points. Dispatch
/// ordering within one host cycle must be defers, then timers, then IO —
/// the same contract the built-in backend provides.
pub struct ExternalMainloop {
    inner: Rc<ExtInner>,
}

impl Default for ExternalMainloop {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalMainloop {
    pub fn new() -> Self {
        Self { inner: Rc::new(ExtInner { registry: Registry::default() }) }
    }

    pub fn api(&self) -> Api {
        Rc::clone(&self.inner) as Api
    }

    /// Earliest armed timer deadline, if any.
    pub fn next_deadline(&self) -> Option<Timeval> {
        self.inner.registry.next_deadline()
    }

    /// True while any defer event is enabled; the host must not block then.
    pub fn defer_pending(&self) -> bool {
        self.inner.registry.any_defer_enabled()
    }

    /// The fds and interest masks the host should poll.
    pub fn interests(&self) -> Vec<(RawFd, IoEvents)> {
        self.inner
            .registry
            .snapshot_ios()
            .into_iter()
            .filter(|s| !s.dead.get())
            .map(|s| (s.fd, s.interest.get()))
            .collect()
    }

    /// Fires every enabled defer event once. Returns the dispatch count.
    pub fn dispatch_defers(&self) -> usize {
        let mut n = 0;
        for d in self.inner.registry.snapshot_defers() {
            if !d.dead.get() && d.enabled.get() {
                registry::fire_defer(&d);
                n += 1;
            }
        }
        self.inner.registry.sweep();
        n
    }

    /// Fires timers whose deadline is at or before `now`, in deadline order.
    pub fn dispatch_timers(&self, now: Timeval) -> usize {
        let mut due: Vec<_> = self
            .inner
            .registry
            .snapshot_times()
            .into_iter()
            .filter(|t| !t.dead.get())
            .filter_map(|t| t.deadline.get().filter(|d| *d <= now).map(|d| (d, t)))
            .collect();
        due.sort_by_key(|(d, _)| *d);

        let mut n = 0;
        for (deadline, slot) in due {
            if slot.deadline.get() != Some(deadline) {
                continue;
            }
            slot.deadline.set(None);
            registry::fire_time(&slot, deadline);
            n += 1;
        }
        self.inner.registry.sweep();
        n
    }

    /// Reports fd readiness observed by the host.
    pub fn dispatch_io(&self, fd: RawFd, events: IoEvents) -> usize {
        let mut n = 0;
        for s in self.inner.registry.snapshot_ios() {
            if !s.dead.get() && s.fd == fd {
                registry::fire_io(&s, events);
                n += 1;
            }
        }
        self.inner.registry.sweep();
        n
    }
}
