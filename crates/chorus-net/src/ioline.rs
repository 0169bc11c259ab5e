//! Line-buffered overlay on an I/O channel, for the textual control CLI.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    rc::Rc,
};

use tracing::debug;

use crate::iochannel::IoChannel;

/// Hard cap on both directions of buffering.
const BUFFER_LIMIT: usize = 64 * 1024;
const READ_SIZE: usize = 1024;

/// Receives each complete line without its newline; `None` exactly once on
/// EOF or transport error.
pub type LineCb = Box<dyn FnMut(Option<&str>)>;

struct LineInner {
    io: RefCell<Option<IoChannel>>,
    dead: Cell<bool>,
    wbuf: RefCell<VecDeque<u8>>,
    rbuf: RefCell<Vec<u8>>,
    callback: RefCell<Option<LineCb>>,
}

impl LineInner {
    fn fail(&self) {
        if self.dead.replace(true) {
            return;
        }
        self.io.borrow_mut().take();
        if let Some(cb) = self.callback.borrow_mut().as_mut() {
            cb(None);
        }
    }

    fn do_write(&self) -> io::Result<()> {
        loop {
            let chunk = {
                let io = self.io.borrow();
                let Some(io) = io.as_ref() else { return Ok(()) };
                if !io.is_writable() {
                    return Ok(());
                }
                let wbuf = self.wbuf.borrow();
                if wbuf.is_empty() {
                    return Ok(());
                }
                let (head, _) = wbuf.as_slices();
                match io.write(head) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                }
            };
            self.wbuf.borrow_mut().drain(..chunk);
        }
    }

    fn do_read(&self) -> io::Result<()> {
        loop {
            let mut tmp = [0u8; READ_SIZE];
            let n = {
                let io = self.io.borrow();
                let Some(io) = io.as_ref() else { return Ok(()) };
                if !io.is_readable() {
                    return Ok(());
                }
                match io.read(&mut tmp) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                }
            };

            {
                let mut rbuf = self.rbuf.borrow_mut();
                let room = BUFFER_LIMIT - rbuf.len();
                if n > room {
                    debug!("line buffer overflow, truncating");
                }
                rbuf.extend_from_slice(&tmp[..n.min(room)]);
            }
            self.emit_lines();
        }
    }

    fn emit_lines(&self) {
        loop {
            let line = {
                let mut rbuf = self.rbuf.borrow_mut();
                let take = match rbuf.iter().position(|b| *b == b'\n') {
                    Some(i) => i + 1,
                    // A full buffer with no newline is delivered as-is.
                    None if rbuf.len() >= BUFFER_LIMIT => rbuf.len(),
                    None => return,
                };
                let mut raw: Vec<u8> = rbuf.drain(..take).collect();
                if raw.last() == Some(&b'\n') {
                    raw.pop();
                }
                raw
            };

            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(cb) = self.callback.borrow_mut().as_mut() {
                cb(Some(&line));
            }
            if self.dead.get() {
                return;
            }
        }
    }

    fn on_io(&self) {
        if self.dead.get() {
            return;
        }
        if self.do_write().is_err() {
            self.fail();
            return;
        }
        if self.do_read().is_err() {
            self.fail();
        }
    }
}

/// Line-oriented wrapper owning the underlying channel.
pub struct IoLine {
    inner: Rc<LineInner>,
}

impl IoLine {
    pub fn new(io: IoChannel) -> Self {
        let inner = Rc::new(LineInner {
            io: RefCell::new(None),
            dead: Cell::new(false),
            wbuf: RefCell::new(VecDeque::new()),
            rbuf: RefCell::new(Vec::new()),
            callback: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        io.set_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_io();
            }
        }));
        *inner.io.borrow_mut() = Some(io);

        Self { inner }
    }

    pub fn set_callback(&self, cb: LineCb) {
        *self.inner.callback.borrow_mut() = Some(cb);
    }

    /// Queues `line` (newline included by the caller if wanted) and writes
    /// through as far as the channel allows. Bytes beyond the buffer cap
    /// are discarded.
    pub fn puts(&self, line: &str) {
        if self.inner.dead.get() {
            return;
        }
        {
            let mut wbuf = self.inner.wbuf.borrow_mut();
            let room = BUFFER_LIMIT - wbuf.len();
            for b in line.bytes().take(room) {
                wbuf.push_back(b);
            }
        }
        if self.inner.do_write().is_err() {
            self.inner.fail();
        }
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.get()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::fd::IntoRawFd,
    };

    use chorus_loop::Mainloop;

    use super::*;

    fn line_over_socketpair(ml: &Mainloop) -> (IoLine, std::os::unix::net::UnixStream) {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let ch = IoChannel::new(&ml.api(), a.try_clone().unwrap().into_raw_fd(), a.into_raw_fd());
        (IoLine::new(ch), b)
    }

    #[test]
    fn reassembles_lines_across_reads() {
        let ml = Mainloop::new();
        let (line, mut peer) = line_over_socketpair(&ml);

        let lines = Rc::new(RefCell::new(Vec::<Option<String>>::new()));
        let l = Rc::clone(&lines);
        line.set_callback(Box::new(move |s| l.borrow_mut().push(s.map(str::to_owned))));

        peer.write_all(b"first\nsec").unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while lines.borrow().len() < 1 {
            assert!(std::time::Instant::now() < deadline);
            ml.iterate(true).unwrap();
        }
        assert_eq!(lines.borrow()[0].as_deref(), Some("first"));

        peer.write_all(b"ond\n").unwrap();
        while lines.borrow().len() < 2 {
            assert!(std::time::Instant::now() < deadline);
            ml.iterate(true).unwrap();
        }
        assert_eq!(lines.borrow()[1].as_deref(), Some("second"));

        // EOF delivers the final None.
        drop(peer);
        while lines.borrow().len() < 3 {
            assert!(std::time::Instant::now() < deadline);
            ml.iterate(true).unwrap();
        }
        assert_eq!(lines.borrow()[2], None);
        assert!(line.is_dead());
    }

    #[test]
    fn puts_writes_through() {
        let ml = Mainloop::new();
        let (line, mut peer) = line_over_socketpair(&ml);

        line.puts("status\n");
        // Flush happens once the writable edge has been observed.
        for _ in 0..20 {
            ml.iterate(false).unwrap();
        }

        peer.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"status\n");
    }
}
