//! Duplex byte pipe over one or two file descriptors.
//!
//! The channel watches its fds on the event loop and latches three edge
//! flags: readable, writable, hungup. One user callback fires whenever any
//! flag newly becomes set. Reading clears the readable latch and re-arms
//! input interest; writing does the same for output. Interest in a
//! condition is dropped while its latch is set, so an unconsumed edge never
//! spins the loop.

use std::{
    cell::{Cell, RefCell},
    io,
    net::SocketAddr,
    os::fd::RawFd,
    rc::{Rc, Weak},
};

use chorus_loop::{Api, IoEvent, IoEvents};
use tracing::debug;

struct ChannelInner {
    ifd: RawFd,
    ofd: RawFd,
    readable: Cell<bool>,
    writable: Cell<bool>,
    hungup: Cell<bool>,
    no_close: Cell<bool>,
    input_event: RefCell<Option<IoEvent>>,
    output_event: RefCell<Option<IoEvent>>,
    callback: RefCell<Option<Box<dyn FnMut()>>>,
}

impl ChannelInner {
    fn update_interest(&self) {
        let mut input = IoEvents::empty();
        if !self.readable.get() && !self.hungup.get() {
            input |= IoEvents::INPUT;
        }
        let mut output = IoEvents::empty();
        if !self.writable.get() && !self.hungup.get() {
            output |= IoEvents::OUTPUT;
        }

        if self.ifd == self.ofd {
            if let Some(e) = self.input_event.borrow().as_ref() {
                e.enable(input | output);
            }
        } else {
            if let Some(e) = self.input_event.borrow().as_ref() {
                e.enable(input);
            }
            if let Some(e) = self.output_event.borrow().as_ref() {
                e.enable(output);
            }
        }
    }

    fn on_ready(&self, events: IoEvents) {
        let mut changed = false;
        if events.contains(IoEvents::INPUT) && !self.readable.replace(true) {
            changed = true;
        }
        if events.contains(IoEvents::OUTPUT) && !self.writable.replace(true) {
            changed = true;
        }
        if events.intersects(IoEvents::HANGUP | IoEvents::ERROR) && !self.hungup.replace(true) {
            // A hangup with pending data still reports readable so the tail
            // can be drained.
            self.readable.set(true);
            changed = true;
        }
        self.update_interest();

        if changed {
            if let Some(cb) = self.callback.borrow_mut().as_mut() {
                cb();
            }
        }
    }
}

fn set_nonblock(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Owns the fd pair (possibly one fd twice, as for sockets) and its
/// event-loop registrations. The fds are closed on drop unless
/// [`set_noclose`](Self::set_noclose) was called.
pub struct IoChannel {
    inner: Rc<ChannelInner>,
}

impl IoChannel {
    pub fn new(api: &Api, ifd: RawFd, ofd: RawFd) -> Self {
        set_nonblock(ifd);
        if ofd != ifd {
            set_nonblock(ofd);
        }

        let inner = Rc::new(ChannelInner {
            ifd,
            ofd,
            readable: Cell::new(false),
            writable: Cell::new(false),
            hungup: Cell::new(false),
            no_close: Cell::new(false),
            input_event: RefCell::new(None),
            output_event: RefCell::new(None),
            callback: RefCell::new(None),
        });

        let hook = |weak: Weak<ChannelInner>| {
            Box::new(move |_: &IoEvent, _: RawFd, events: IoEvents| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_ready(events);
                }
            })
        };

        if ifd == ofd {
            let e = api.io_new(
                ifd,
                IoEvents::INPUT | IoEvents::OUTPUT,
                hook(Rc::downgrade(&inner)),
            );
            *inner.input_event.borrow_mut() = Some(e);
        } else {
            let ein = api.io_new(ifd, IoEvents::INPUT, hook(Rc::downgrade(&inner)));
            let eout = api.io_new(ofd, IoEvents::OUTPUT, hook(Rc::downgrade(&inner)));
            *inner.input_event.borrow_mut() = Some(ein);
            *inner.output_event.borrow_mut() = Some(eout);
        }

        Self { inner }
    }

    pub fn set_callback(&self, cb: Box<dyn FnMut()>) {
        *self.inner.callback.borrow_mut() = Some(cb);
    }

    /// Reads into `buf`, clearing the readable latch. `Ok(0)` means EOF.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.readable.set(false);
        self.inner.update_interest();

        let n = unsafe {
            libc::read(self.inner.ifd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Writes from `buf`, clearing the writable latch. Short writes are
    /// expected; the remainder stays with the caller.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.writable.set(false);
        self.inner.update_interest();

        let n = unsafe {
            libc::write(self.inner.ofd, buf.as_ptr().cast::<libc::c_void>(), buf.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn is_readable(&self) -> bool {
        self.inner.readable.get()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable.get()
    }

    pub fn is_hungup(&self) -> bool {
        self.inner.hungup.get()
    }

    /// Leaves the fds open at destruction; for fds also owned elsewhere.
    pub fn set_noclose(&self, b: bool) {
        self.inner.no_close.set(b);
    }

    /// Peer address when the fd is a connected socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let r = unsafe {
            libc::getpeername(
                self.inner.ifd,
                std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr>(),
                &mut len,
            )
        };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        match i32::from(storage.ss_family) {
            libc::AF_INET => {
                let sin = unsafe { *std::ptr::addr_of!(storage).cast::<libc::sockaddr_in>() };
                let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Ok(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { *std::ptr::addr_of!(storage).cast::<libc::sockaddr_in6>() };
                let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(SocketAddr::from((ip, u16::from_be(sin6.sin6_port))))
            }
            family => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("peer address family {family} has no socket address"),
            )),
        }
    }

    pub fn set_sndbuf(&self, size: usize) -> io::Result<()> {
        set_socket_buf(self.inner.ofd, libc::SO_SNDBUF, size)
    }

    pub fn set_rcvbuf(&self, size: usize) -> io::Result<()> {
        set_socket_buf(self.inner.ifd, libc::SO_RCVBUF, size)
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        if let Some(e) = self.inner.input_event.borrow_mut().take() {
            e.free();
        }
        if let Some(e) = self.inner.output_event.borrow_mut().take() {
            e.free();
        }
        if !self.inner.no_close.get() {
            debug!(ifd = self.inner.ifd, "closing io channel");
            unsafe {
                libc::close(self.inner.ifd);
                if self.inner.ofd != self.inner.ifd {
                    libc::close(self.inner.ofd);
                }
            }
        }
    }
}

/// Sets kernel SO_SNDBUF / SO_RCVBUF on a raw fd.
fn set_socket_buf(fd: RawFd, opt: libc::c_int, size: usize) -> io::Result<()> {
    let size = size as libc::c_int;
    let r = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            std::ptr::addr_of!(size).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if r < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}
