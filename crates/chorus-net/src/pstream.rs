//! Framed packet transport over one I/O channel.
//!
//! Outbound control packets and bulk audio sends share a single FIFO; each
//! item is emitted as a 20-byte descriptor followed by its payload, resumed
//! across short writes, and the next item starts only once the previous is
//! fully flushed. Inbound, a small state machine assembles one frame at a
//! time and hands control frames to the packet callback and bulk frames to
//! the memblock callback.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    rc::Rc,
};

use chorus_loop::{Api, DeferEvent};
use chorus_wire::{
    CHANNEL_CONTROL, DESCRIPTOR_SIZE, FRAME_SIZE_MAX, FrameDescriptor, Memblock, MemblockStat,
    Memchunk, PACKET_SIZE_MAX, Packet, TagstructWriter,
};
use tracing::{debug, warn};

use crate::iochannel::IoChannel;

enum SendItem {
    Packet(Packet),
    Memblock { channel: u32, offset: i64, chunk: Memchunk },
}

impl SendItem {
    fn descriptor(&self) -> FrameDescriptor {
        match self {
            Self::Packet(p) => FrameDescriptor::control(p.len() as u32),
            Self::Memblock { channel, offset, chunk } => {
                FrameDescriptor::bulk(chunk.length as u32, *channel, *offset)
            }
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Packet(p) => p.data(),
            Self::Memblock { chunk, .. } => chunk.as_slice(),
        }
    }
}

/// In-flight outbound frame: descriptor plus payload, single write cursor.
struct WriteState {
    descriptor: [u8; DESCRIPTOR_SIZE],
    item: SendItem,
    index: usize,
}

enum ReadState {
    Descriptor { buf: [u8; DESCRIPTOR_SIZE], have: usize },
    Body { descriptor: FrameDescriptor, buf: Vec<u8>, have: usize },
}

impl ReadState {
    fn fresh() -> Self {
        Self::Descriptor { buf: [0; DESCRIPTOR_SIZE], have: 0 }
    }
}

pub type PacketCb = Box<dyn FnMut(&Packet)>;
pub type MemblockCb = Box<dyn FnMut(u32, i64, &Memchunk)>;

struct PstreamInner {
    io: RefCell<Option<IoChannel>>,
    defer: RefCell<Option<DeferEvent>>,
    stat: MemblockStat,
    dead: Cell<bool>,

    send_queue: RefCell<VecDeque<SendItem>>,
    write: RefCell<Option<WriteState>>,
    read: RefCell<ReadState>,

    recv_packet_cb: RefCell<Option<PacketCb>>,
    recv_memblock_cb: RefCell<Option<MemblockCb>>,
    drain_cb: RefCell<Option<Box<dyn FnMut()>>>,
    die_cb: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl PstreamInner {
    fn die(&self) {
        if self.dead.replace(true) {
            return;
        }
        if let Some(d) = self.defer.borrow_mut().take() {
            d.free();
        }
        self.io.borrow_mut().take();
        self.send_queue.borrow_mut().clear();
        self.write.borrow_mut().take();
        if let Some(cb) = self.die_cb.borrow_mut().take() {
            cb();
        }
    }

    fn is_pending(&self) -> bool {
        self.write.borrow().is_some() || !self.send_queue.borrow().is_empty()
    }

    fn do_write(&self) {
        let mut completed = false;
        loop {
            if self.dead.get() {
                return;
            }

            if self.write.borrow().is_none() {
                let next = self.send_queue.borrow_mut().pop_front();
                let Some(item) = next else {
                    // Queue ran dry; report a drain only when this call
                    // actually finished flushing something.
                    if completed {
                        if let Some(cb) = self.drain_cb.borrow_mut().as_mut() {
                            cb();
                        }
                    }
                    return;
                };
                *self.write.borrow_mut() = Some(WriteState {
                    descriptor: item.descriptor().encode(),
                    item,
                    index: 0,
                });
            }

            enum Step {
                More,
                Blocked,
                Dead,
            }

            let step = {
                let io = self.io.borrow();
                let Some(io) = io.as_ref() else { return };
                if !io.is_writable() {
                    return;
                }

                let mut write = self.write.borrow_mut();
                let state = write.as_mut().unwrap();
                let chunk = if state.index < DESCRIPTOR_SIZE {
                    &state.descriptor[state.index..]
                } else {
                    &state.item.payload()[state.index - DESCRIPTOR_SIZE..]
                };

                match io.write(chunk) {
                    Ok(0) => {
                        warn!("zero-length write on packet stream, connection is dead");
                        Step::Dead
                    }
                    Ok(n) => {
                        state.index += n;
                        if state.index == DESCRIPTOR_SIZE + state.item.payload().len() {
                            *write = None;
                            completed = true;
                        }
                        Step::More
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Blocked,
                    Err(e) => {
                        debug!(error = %e, "write error on packet stream");
                        Step::Dead
                    }
                }
            };

            match step {
                Step::More => {}
                Step::Blocked => return,
                Step::Dead => {
                    self.die();
                    return;
                }
            }
        }
    }

    fn do_read(&self) {
        loop {
            if self.dead.get() {
                return;
            }

            enum Step {
                More,
                Blocked,
                Dead,
                Deliver(FrameDescriptor, Vec<u8>),
            }

            let step = {
                let io = self.io.borrow();
                let Some(io) = io.as_ref() else { return };
                if !io.is_readable() {
                    return;
                }

                let mut read = self.read.borrow_mut();
                match &mut *read {
                    ReadState::Descriptor { buf, have } => match io.read(&mut buf[*have..]) {
                        Ok(0) => Step::Dead,
                        Ok(n) => {
                            *have += n;
                            if *have == DESCRIPTOR_SIZE {
                                let descriptor = FrameDescriptor::decode(buf);
                                if descriptor.length == 0
                                    || descriptor.length > FRAME_SIZE_MAX
                                    || (descriptor.is_control()
                                        && descriptor.length > PACKET_SIZE_MAX as u32)
                                {
                                    warn!(
                                        length = descriptor.length,
                                        "frame exceeds cap, failing connection"
                                    );
                                    Step::Dead
                                } else {
                                    *read = ReadState::Body {
                                        descriptor,
                                        buf: vec![0; descriptor.length as usize],
                                        have: 0,
                                    };
                                    Step::More
                                }
                            } else {
                                Step::More
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Blocked,
                        Err(e) => {
                            debug!(error = %e, "read error on packet stream");
                            Step::Dead
                        }
                    },
                    ReadState::Body { descriptor, buf, have } => match io.read(&mut buf[*have..]) {
                        Ok(0) => Step::Dead,
                        Ok(n) => {
                            *have += n;
                            if *have == buf.len() {
                                Step::Deliver(*descriptor, std::mem::take(buf))
                            } else {
                                Step::More
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Blocked,
                        Err(e) => {
                            debug!(error = %e, "read error on packet stream");
                            Step::Dead
                        }
                    },
                }
            };

            match step {
                Step::More => {}
                Step::Blocked => return,
                Step::Dead => {
                    self.die();
                    return;
                }
                Step::Deliver(descriptor, body) => {
                    *self.read.borrow_mut() = ReadState::fresh();
                    self.deliver(descriptor, body);
                }
            }
        }
    }

    fn deliver(&self, descriptor: FrameDescriptor, body: Vec<u8>) {
        if descriptor.is_control() {
            match Packet::from_vec(body) {
                Ok(packet) => {
                    if let Some(cb) = self.recv_packet_cb.borrow_mut().as_mut() {
                        cb(&packet);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "oversized control frame");
                    self.die();
                }
            }
        } else {
            let block = Memblock::from_vec(body, Some(&self.stat));
            let chunk = Memchunk::from_block(block);
            if let Some(cb) = self.recv_memblock_cb.borrow_mut().as_mut() {
                cb(descriptor.channel, descriptor.offset, &chunk);
            }
        }
    }
}

/// Reference-counted handle to the framed transport.
#[derive(Clone)]
pub struct Pstream {
    inner: Rc<PstreamInner>,
}

impl Pstream {
    pub fn new(api: &Api, io: IoChannel, stat: &MemblockStat) -> Self {
        let inner = Rc::new(PstreamInner {
            io: RefCell::new(None),
            defer: RefCell::new(None),
            stat: stat.clone(),
            dead: Cell::new(false),
            send_queue: RefCell::new(VecDeque::new()),
            write: RefCell::new(None),
            read: RefCell::new(ReadState::fresh()),
            recv_packet_cb: RefCell::new(None),
            recv_memblock_cb: RefCell::new(None),
            drain_cb: RefCell::new(None),
            die_cb: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        io.set_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.do_write();
                inner.do_read();
            }
        }));
        *inner.io.borrow_mut() = Some(io);

        let weak = Rc::downgrade(&inner);
        let defer = api.defer_new(Box::new(move |e| {
            e.enable(false);
            if let Some(inner) = weak.upgrade() {
                inner.do_write();
            }
        }));
        defer.enable(false);
        *inner.defer.borrow_mut() = Some(defer);

        Self { inner }
    }

    fn kick_flush(&self) {
        if let Some(d) = self.inner.defer.borrow().as_ref() {
            d.enable(true);
        }
    }

    /// Queues a control packet behind everything already queued.
    pub fn send_packet(&self, packet: Packet) {
        if self.inner.dead.get() {
            return;
        }
        self.inner.send_queue.borrow_mut().push_back(SendItem::Packet(packet));
        self.kick_flush();
    }

    /// Serializes `ts` into a control packet and queues it.
    pub fn send_tagstruct(&self, ts: TagstructWriter) {
        match Packet::from_vec(ts.into_vec()) {
            Ok(packet) => self.send_packet(packet),
            Err(e) => {
                warn!(error = %e, "control message exceeds packet cap");
                self.inner.die();
            }
        }
    }

    /// Queues bulk audio for `channel`, `offset` relative to the receiver's
    /// playback cursor. The chunk's block is retained until fully flushed.
    pub fn send_memblock(&self, channel: u32, offset: i64, chunk: Memchunk) {
        debug_assert_ne!(channel, CHANNEL_CONTROL);
        if self.inner.dead.get() || chunk.length == 0 {
            return;
        }
        self.inner
            .send_queue
            .borrow_mut()
            .push_back(SendItem::Memblock { channel, offset, chunk });
        self.kick_flush();
    }

    pub fn set_recv_packet_callback(&self, cb: PacketCb) {
        *self.inner.recv_packet_cb.borrow_mut() = Some(cb);
    }

    pub fn set_recv_memblock_callback(&self, cb: MemblockCb) {
        *self.inner.recv_memblock_cb.borrow_mut() = Some(cb);
    }

    /// `cb` fires every time the send queue empties.
    pub fn set_drain_callback(&self, cb: Option<Box<dyn FnMut()>>) {
        *self.inner.drain_cb.borrow_mut() = cb;
    }

    /// `cb` fires once when a transport error makes the connection unusable.
    pub fn set_die_callback(&self, cb: Box<dyn FnOnce()>) {
        *self.inner.die_cb.borrow_mut() = Some(cb);
    }

    /// Any outbound bytes still queued or partially written?
    pub fn is_pending(&self) -> bool {
        self.inner.is_pending()
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.get()
    }

    /// Tears the transport down without invoking the die callback.
    pub fn close(&self) {
        self.inner.die_cb.borrow_mut().take();
        self.inner.die();
    }
}
