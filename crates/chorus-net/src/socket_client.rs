//! Asynchronous non-blocking connect.
//!
//! The socket is created non-blocking, the connect is initiated, and an IO
//! event watches for writability. When the edge arrives, SO_ERROR decides
//! between delivering a fresh [`IoChannel`] and delivering `None`.

use std::{
    cell::RefCell,
    io,
    net::{SocketAddr, ToSocketAddrs},
    os::fd::{AsRawFd, IntoRawFd, RawFd},
    path::Path,
    rc::Rc,
};

use chorus_loop::{Api, IoEvent, IoEvents};
use mio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

use crate::iochannel::IoChannel;

pub type ConnectCb = Box<dyn FnOnce(Option<IoChannel>)>;

enum Sock {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Sock {
    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Self::Tcp(s) => s.take_error(),
            Self::Unix(s) => s.take_error(),
        }
    }

    fn into_raw_fd(self) -> RawFd {
        match self {
            Self::Tcp(s) => s.into_raw_fd(),
            Self::Unix(s) => s.into_raw_fd(),
        }
    }
}

struct ClientInner {
    api: Api,
    event: RefCell<Option<IoEvent>>,
    sock: RefCell<Option<Sock>>,
    callback: RefCell<Option<ConnectCb>>,
    local: bool,
}

impl ClientInner {
    fn on_writable(&self) {
        let Some(sock) = self.sock.borrow_mut().take() else { return };

        let io = match sock.take_error() {
            Ok(None) => {
                let fd = sock.into_raw_fd();
                Some(IoChannel::new(&self.api, fd, fd))
            }
            Ok(Some(e)) => {
                debug!(error = %e, "connect failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "could not query socket error");
                None
            }
        };

        if let Some(cb) = self.callback.borrow_mut().take() {
            cb(io);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(e) = self.event.borrow_mut().take() {
            e.free();
        }
    }
}

/// Reference-counted handle to an in-flight connect. The result is
/// delivered once through the callback; releasing every handle before that
/// abandons the attempt.
#[derive(Clone)]
pub struct SocketClient {
    inner: Rc<ClientInner>,
}

impl SocketClient {
    pub fn new_unix(api: &Api, path: impl AsRef<Path>) -> io::Result<Self> {
        let sock = UnixStream::connect(path)?;
        Self::watch(api, Sock::Unix(sock), true)
    }

    pub fn new_tcp(api: &Api, addr: SocketAddr) -> io::Result<Self> {
        let local = addr.ip().is_loopback();
        let sock = TcpStream::connect(addr)?;
        Self::watch(api, Sock::Tcp(sock), local)
    }

    pub fn new_ipv4(api: &Api, addr: std::net::Ipv4Addr, port: u16) -> io::Result<Self> {
        Self::new_tcp(api, SocketAddr::from((addr, port)))
    }

    pub fn new_ipv6(api: &Api, addr: std::net::Ipv6Addr, port: u16) -> io::Result<Self> {
        Self::new_tcp(api, SocketAddr::from((addr, port)))
    }

    /// Connects to `"path"`, `"host"` or `"host:port"`.
    ///
    /// Name resolution is synchronous and runs on the loop thread; a slow
    /// resolver stalls the loop for the duration.
    pub fn from_string(api: &Api, server: &str, default_port: u16) -> io::Result<Self> {
        if server.starts_with('/') {
            return Self::new_unix(api, server);
        }

        // A bare IPv6 literal is all colons and carries no port.
        let (host, port) = if server.parse::<std::net::Ipv6Addr>().is_ok() {
            (server, default_port)
        } else {
            match server.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() => (
                    host,
                    port.parse::<u16>().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "invalid port number")
                    })?,
                ),
                _ => (server, default_port),
            }
        };

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host name resolved to nothing"))?;
        Self::new_tcp(api, addr)
    }

    fn watch(api: &Api, sock: Sock, local: bool) -> io::Result<Self> {
        let fd = sock.raw_fd();
        let inner = Rc::new(ClientInner {
            api: Api::clone(api),
            event: RefCell::new(None),
            sock: RefCell::new(Some(sock)),
            callback: RefCell::new(None),
            local,
        });

        let weak = Rc::downgrade(&inner);
        let event = api.io_new(
            fd,
            IoEvents::OUTPUT,
            Box::new(move |e, _, _| {
                // One-shot: success or failure, the watch is done.
                e.free();
                if let Some(inner) = weak.upgrade() {
                    inner.on_writable();
                }
            }),
        );
        *inner.event.borrow_mut() = Some(event);

        Ok(Self { inner })
    }

    /// `cb` receives the connected channel, or `None` on failure.
    pub fn set_callback(&self, cb: ConnectCb) {
        *self.inner.callback.borrow_mut() = Some(cb);
    }

    /// True for UNIX and loopback connections.
    pub fn is_local(&self) -> bool {
        self.inner.local
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use chorus_loop::Mainloop;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn unix_connect_delivers_channel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("native");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let ml = Mainloop::new();
        let client = SocketClient::new_unix(&ml.api(), &path).unwrap();
        assert!(client.is_local());

        let got = Rc::new(Cell::new(None));
        let g = Rc::clone(&got);
        client.set_callback(Box::new(move |io| g.set(Some(io.is_some()))));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while got.get().is_none() {
            assert!(std::time::Instant::now() < deadline, "connect never completed");
            ml.iterate(true).unwrap();
        }
        assert_eq!(got.get(), Some(true));
        drop(listener);
    }

    #[test]
    fn missing_unix_socket_fails_synchronously() {
        let ml = Mainloop::new();
        assert!(SocketClient::new_unix(&ml.api(), "/nonexistent/chorus/native").is_err());
    }

    #[test]
    fn refused_tcp_connect_delivers_none() {
        let ml = Mainloop::new();
        // Bind a listener to get a free port, then close it again.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let client = SocketClient::new_tcp(&ml.api(), addr).unwrap();
        let got = Rc::new(Cell::new(None));
        let g = Rc::clone(&got);
        client.set_callback(Box::new(move |io| g.set(Some(io.is_some()))));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while got.get().is_none() {
            assert!(std::time::Instant::now() < deadline, "connect never completed");
            ml.iterate(true).unwrap();
        }
        assert_eq!(got.get(), Some(false));
    }
}
