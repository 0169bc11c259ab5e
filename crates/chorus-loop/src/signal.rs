//! Bridges POSIX signals into the event loop.
//!
//! Signal handlers may only perform async-signal-safe work, so the handler
//! installed here does exactly one thing: write the signal number to a
//! non-blocking self-pipe. An IO event on the read end picks the numbers up
//! on the loop thread and dispatches to the registered callbacks.

use std::{
    cell::{Cell, RefCell},
    io,
    os::fd::RawFd,
    rc::{Rc, Weak},
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
};

use signal_hook::SigId;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{Api, DestroyCb, IoEvent, IoEvents};

pub type SignalCb = Box<dyn FnMut(i32)>;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("signal bridge already initialized in this process")]
    AlreadyInitialized,
    #[error("signal {0} already has a handler registered")]
    DuplicateSignal(i32),
    #[error("self-pipe setup failed")]
    Pipe(#[source] io::Error),
    #[error("installing handler for signal {signal} failed")]
    Register {
        signal: i32,
        #[source]
        source: io::Error,
    },
}

// The handler side of the bridge. Only the write end crosses the
// signal-handler boundary, and only through the atomic.
static BRIDGE_ACTIVE: AtomicBool = AtomicBool::new(false);
static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

struct SignalSlot {
    signal: i32,
    sig_id: Cell<Option<SigId>>,
    bridge: Weak<BridgeInner>,
    cb: RefCell<Option<SignalCb>>,
    destroy: RefCell<Option<DestroyCb>>,
}

impl SignalSlot {
    fn release(&self) {
        if let Some(id) = self.sig_id.take() {
            signal_hook::low_level::unregister(id);
        }
        self.cb.borrow_mut().take();
        if let Some(d) = self.destroy.borrow_mut().take() {
            d();
        }
    }
}

/// Handle to one registered signal callback.
pub struct SignalEvent {
    slot: Rc<SignalSlot>,
}

impl SignalEvent {
    /// Uninstalls the handler and runs the destroy callback.
    pub fn free(self) {
        if let Some(bridge) = self.slot.bridge.upgrade() {
            bridge.handlers.borrow_mut().retain(|s| !Rc::ptr_eq(s, &self.slot));
        }
        self.slot.release();
    }

    pub fn set_destroy(&self, cb: DestroyCb) {
        *self.slot.destroy.borrow_mut() = Some(cb);
    }
}

struct BridgeInner {
    pipe: [RawFd; 2],
    io: RefCell<Option<IoEvent>>,
    handlers: RefCell<Vec<Rc<SignalSlot>>>,
}

impl BridgeInner {
    fn dispatch(&self, signal: i32) {
        let slot = self.handlers.borrow().iter().find(|s| s.signal == signal).cloned();
        match slot {
            Some(slot) => {
                if let Some(cb) = slot.cb.borrow_mut().as_mut() {
                    cb(signal);
                }
            }
            None => debug!(signal, "signal with no registered handler"),
        }
    }

    fn drain_pipe(&self) {
        let mut buf = [0u8; 4];
        loop {
            let n = unsafe {
                libc::read(self.pipe[0], buf.as_mut_ptr().cast::<libc::c_void>(), buf.len())
            };
            if n != buf.len() as isize {
                if n > 0 {
                    warn!("short read from signal pipe");
                }
                return;
            }
            self.dispatch(i32::from_ne_bytes(buf));
        }
    }
}

fn pipe2_nonblock_cloexec() -> io::Result<[RawFd; 2]> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fds)
}

/// Owns the self-pipe, its IO event and the per-signal handler table.
///
/// Signal handlers are process-wide, so at most one bridge may exist at a
/// time; construction is gated accordingly. Dropping the bridge uninstalls
/// every handler and closes the pipe.
pub struct SignalBridge {
    inner: Rc<BridgeInner>,
}

impl SignalBridge {
    pub fn new(api: &Api) -> Result<Self, SignalError> {
        if BRIDGE_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(SignalError::AlreadyInitialized);
        }

        let pipe = match pipe2_nonblock_cloexec() {
            Ok(p) => p,
            Err(e) => {
                BRIDGE_ACTIVE.store(false, Ordering::SeqCst);
                return Err(SignalError::Pipe(e));
            }
        };
        PIPE_WR.store(pipe[1], Ordering::SeqCst);

        let inner = Rc::new(BridgeInner {
            pipe,
            io: RefCell::new(None),
            handlers: RefCell::new(Vec::new()),
        });

        let weak = Rc::downgrade(&inner);
        let io = api.io_new(
            pipe[0],
            IoEvents::INPUT,
            Box::new(move |_, _, _| {
                if let Some(inner) = weak.upgrade() {
                    inner.drain_pipe();
                }
            }),
        );
        *inner.io.borrow_mut() = Some(io);

        Ok(Self { inner })
    }

    /// Installs a handler for `signal`; at most one callback per signal.
    pub fn register(&self, signal: i32, cb: SignalCb) -> Result<SignalEvent, SignalError> {
        if self.inner.handlers.borrow().iter().any(|s| s.signal == signal) {
            return Err(SignalError::DuplicateSignal(signal));
        }

        // Async-signal-safe: one atomic load and one write(2).
        let action = move || {
            let fd = PIPE_WR.load(Ordering::Relaxed);
            if fd >= 0 {
                let bytes = signal.to_ne_bytes();
                unsafe {
                    libc::write(fd, bytes.as_ptr().cast::<libc::c_void>(), bytes.len());
                }
            }
        };
        let sig_id = unsafe { signal_hook::low_level::register(signal, action) }
            .map_err(|source| SignalError::Register { signal, source })?;

        let slot = Rc::new(SignalSlot {
            signal,
            sig_id: Cell::new(Some(sig_id)),
            bridge: Rc::downgrade(&self.inner),
            cb: RefCell::new(Some(cb)),
            destroy: RefCell::new(None),
        });
        self.inner.handlers.borrow_mut().push(Rc::clone(&slot));
        Ok(SignalEvent { slot })
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for slot in self.inner.handlers.borrow_mut().drain(..) {
            slot.release();
        }
        if let Some(io) = self.inner.io.borrow_mut().take() {
            io.free();
        }
        PIPE_WR.store(-1, Ordering::SeqCst);
        unsafe {
            libc::close(self.inner.pipe[0]);
            libc::close(self.inner.pipe[1]);
        }
        BRIDGE_ACTIVE.store(false, Ordering::SeqCst);
    }
}
