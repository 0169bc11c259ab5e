use std::{cell::Cell, io, os::fd::RawFd, rc::Rc};

use chorus_timing::Timeval;
use tracing::debug;

use crate::{
    api::{
        Api, DeferEvent, DeferEventCb, IoEvent, IoEventCb, IoEvents, MainloopApi, TimeEvent,
        TimeEventCb,
    },
    registry::{self, Registry},
};

/// Outcome of a single loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iterate {
    /// Number of callbacks dispatched this iteration.
    Dispatched(usize),
    /// `quit(retval)` was observed.
    Quit(i32),
}

struct PollInner {
    registry: Registry,
    quit: Cell<Option<i32>>,
}

impl MainloopApi for PollInner {
    fn io_new(&self, fd: RawFd, events: IoEvents, cb: IoEventCb) -> IoEvent {
        self.registry.io_new(fd, events, cb)
    }

    fn time_new(&self, deadline: Timeval, cb: TimeEventCb) -> TimeEvent {
        self.registry.time_new(deadline, cb)
    }

    fn defer_new(&self, cb: DeferEventCb) -> DeferEvent {
        self.registry.defer_new(cb)
    }

    fn quit(&self, retval: i32) {
        self.quit.set(Some(retval));
    }
}

/// The built-in `poll(2)` loop backend.
///
/// Per iteration: pending defer events run first, then the loop blocks until
/// the earliest of timer deadline and fd readiness, then expired timers run
/// in deadline order followed by ready fds in fd order. See
/// [`MainloopApi`] for the full contract.
pub struct Mainloop {
    inner: Rc<PollInner>,
}

impl Default for Mainloop {
    fn default() -> Self {
        Self::new()
    }
}

impl Mainloop {
    pub fn new() -> Self {
        Self { inner: Rc::new(PollInner { registry: Registry::default(), quit: Cell::new(None) }) }
    }

    /// The polymorphic handle components register their event sources on.
    pub fn api(&self) -> Api {
        Rc::clone(&self.inner) as Api
    }

    /// Runs one iteration. With `block` false the poll timeout is zero.
    pub fn iterate(&self, block: bool) -> io::Result<Iterate> {
        let inner = &self.inner;

        inner.registry.sweep();
        if let Some(r) = inner.quit.get() {
            return Ok(Iterate::Quit(r));
        }

        let mut dispatched = 0;

        for d in inner.registry.snapshot_defers() {
            if !d.dead.get() && d.enabled.get() {
                registry::fire_defer(&d);
                dispatched += 1;
            }
        }
        inner.registry.sweep();
        if let Some(r) = inner.quit.get() {
            return Ok(Iterate::Quit(r));
        }

        let timeout_ms: i32 = if !block || inner.registry.any_defer_enabled() {
            0
        } else {
            match inner.registry.next_deadline() {
                Some(deadline) => {
                    let left = deadline.since(Timeval::now());
                    (left.0 / 1000).min(i32::MAX as u64) as i32
                }
                None => -1,
            }
        };

        let mut pfds: Vec<libc::pollfd> = Vec::new();
        let mut slots = Vec::new();
        for s in inner.registry.snapshot_ios() {
            if s.dead.get() {
                continue;
            }
            let interest = s.interest.get();
            let mut events: libc::c_short = 0;
            if interest.contains(IoEvents::INPUT) {
                events |= libc::POLLIN;
            }
            if interest.contains(IoEvents::OUTPUT) {
                events |= libc::POLLOUT;
            }
            pfds.push(libc::pollfd { fd: s.fd, events, revents: 0 });
            slots.push(s);
        }

        let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Iterate::Dispatched(dispatched));
            }
            return Err(err);
        }

        // Expired timers, earliest deadline first. A timer callback may
        // re-arm or free later entries, so each one is re-checked before it
        // fires.
        let now = Timeval::now();
        let mut due: Vec<_> = inner
            .registry
            .snapshot_times()
            .into_iter()
            .filter(|t| !t.dead.get())
            .filter_map(|t| t.deadline.get().filter(|d| *d <= now).map(|d| (d, t)))
            .collect();
        due.sort_by_key(|(d, _)| *d);
        for (deadline, slot) in due {
            if slot.deadline.get() != Some(deadline) {
                continue;
            }
            slot.deadline.set(None);
            registry::fire_time(&slot, deadline);
            dispatched += 1;
        }

        let mut ready: Vec<_> = slots
            .into_iter()
            .zip(&pfds)
            .filter(|(_, p)| p.revents != 0)
            .map(|(s, p)| {
                let mut ev = IoEvents::empty();
                if p.revents & libc::POLLIN != 0 {
                    ev |= IoEvents::INPUT;
                }
                if p.revents & libc::POLLOUT != 0 {
                    ev |= IoEvents::OUTPUT;
                }
                if p.revents & libc::POLLHUP != 0 {
                    ev |= IoEvents::HANGUP;
                }
                if p.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                    ev |= IoEvents::ERROR;
                }
                (s, ev)
            })
            .collect();
        ready.sort_by_key(|(s, _)| s.fd);
        for (slot, events) in ready {
            registry::fire_io(&slot, events);
            dispatched += 1;
        }

        inner.registry.sweep();
        if let Some(r) = inner.quit.get() {
            return Ok(Iterate::Quit(r));
        }
        Ok(Iterate::Dispatched(dispatched))
    }

    /// Iterates until `quit` is observed, returning the quit value.
    pub fn run(&self) -> io::Result<i32> {
        loop {
            if let Iterate::Quit(r) = self.iterate(true)? {
                debug!(retval = r, "mainloop quitting");
                return Ok(r);
            }
        }
    }

    pub fn quit(&self, retval: i32) {
        self.inner.quit.set(Some(retval));
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, time::Duration};

    use chorus_timing::MicroSeconds;

    use super::*;
    use crate::api::once;

    #[test]
    fn once_fires_exactly_once() {
        let ml = Mainloop::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        once(&ml.api(), move || h.set(h.get() + 1));

        for _ in 0..3 {
            ml.iterate(false).unwrap();
        }
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn defer_fires_until_disabled() {
        let ml = Mainloop::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        ml.api().defer_new(Box::new(move |e| {
            h.set(h.get() + 1);
            if h.get() == 2 {
                e.enable(false);
            }
        }));

        for _ in 0..4 {
            ml.iterate(false).unwrap();
        }
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let ml = Mainloop::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let now = Timeval::now();

        for (label, offset) in [("b", 2_000u64), ("a", 1_000), ("c", 3_000)] {
            let order = Rc::clone(&order);
            ml.api().time_new(
                now.add_usec(MicroSeconds(offset)),
                Box::new(move |e, _| {
                    order.borrow_mut().push(label);
                    e.free();
                }),
            );
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while order.borrow().len() < 3 {
            assert!(std::time::Instant::now() < deadline, "timers never fired");
            ml.iterate(true).unwrap();
        }
        assert_eq!(*order.borrow(), ["a", "b", "c"]);
    }

    #[test]
    fn timer_restart_rearms() {
        let ml = Mainloop::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        ml.api().time_new(
            Timeval::now(),
            Box::new(move |e, _| {
                h.set(h.get() + 1);
                if h.get() < 3 {
                    e.restart(Some(Timeval::now()));
                } else {
                    e.free();
                }
            }),
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hits.get() < 3 {
            assert!(std::time::Instant::now() < deadline, "timer never re-fired");
            ml.iterate(true).unwrap();
        }
        ml.iterate(false).unwrap();
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn quit_stops_run() {
        let ml = Mainloop::new();
        let api = ml.api();
        let for_quit = Api::clone(&api);
        once(&api, move || for_quit.quit(7));
        assert_eq!(ml.run().unwrap(), 7);
    }

    #[test]
    fn freeing_sibling_source_mid_dispatch_is_safe() {
        let ml = Mainloop::new();
        let victim = Rc::new(RefCell::new(None));
        let fired = Rc::new(Cell::new(false));

        let v = Rc::clone(&victim);
        ml.api().defer_new(Box::new(move |e| {
            if let Some(other) = v.borrow_mut().take() {
                let other: DeferEvent = other;
                other.free();
            }
            e.free();
        }));

        let f = Rc::clone(&fired);
        let destroyed = Rc::new(Cell::new(false));
        let d = Rc::clone(&destroyed);
        let other = ml.api().defer_new(Box::new(move |_| f.set(true)));
        other.set_destroy(Box::new(move || d.set(true)));
        *victim.borrow_mut() = Some(other);

        for _ in 0..3 {
            ml.iterate(false).unwrap();
        }
        assert!(destroyed.get());
    }
}
