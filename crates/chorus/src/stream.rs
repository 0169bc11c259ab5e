//! Per-stream state machine: creation handshake, the playback credit
//! protocol, the latency estimator and the control commands.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::{Rc, Weak},
};

use chorus_loop::{Api, TimeEvent};
use chorus_timing::{MicroSeconds, Timeval};
use chorus_wire::{
    ChannelMap, ChannelVolumes, Command, ErrorCode, Memblock, Memblockq, Memchunk, SampleSpec,
    TagstructReader, TagstructWriter,
};
use tracing::{debug, warn};

use crate::{
    context::{AckCb, ContextInner},
    operation::OperationInner,
    types::{BufferAttr, Direction, INVALID_INDEX, LatencyInfo, StreamFlags, StreamState},
    Context, Operation,
};

/// How often the background latency poller refreshes the snapshot.
const LATENCY_IPOL_INTERVAL: MicroSeconds = MicroSeconds(100_000);

pub type StreamStateCb = Box<dyn FnMut(StreamState)>;
pub type ReadCb = Box<dyn FnMut(&Memchunk)>;
pub type WriteCb = Box<dyn FnMut(usize)>;
pub type LatencyCb = Box<dyn FnOnce(Option<&LatencyInfo>)>;

/// Audio accepted by `write` but still waiting for server credit.
struct PendingWrite {
    chunk: Memchunk,
    delta: i64,
}

pub(crate) struct StreamInner {
    context: Weak<ContextInner>,
    api: Api,
    name: String,
    sample_spec: SampleSpec,
    channel_map: ChannelMap,

    direction: Cell<Direction>,
    state: Cell<StreamState>,
    flags: Cell<StreamFlags>,
    buffer_attr: Cell<BufferAttr>,

    channel: Cell<u32>,
    channel_valid: Cell<bool>,
    device_index: Cell<u32>,

    requested_bytes: Cell<usize>,
    queued_bytes: Cell<usize>,
    sendq: RefCell<VecDeque<PendingWrite>>,
    counter: Cell<u64>,
    upload_remaining: Cell<u64>,

    previous_time: Cell<MicroSeconds>,
    corked: Cell<bool>,
    interpolate: Cell<bool>,
    ipol_usec: Cell<MicroSeconds>,
    ipol_timestamp: Cell<Timeval>,
    ipol_event: RefCell<Option<TimeEvent>>,

    recvq: RefCell<Option<Memblockq>>,

    state_callback: RefCell<Option<StreamStateCb>>,
    read_callback: RefCell<Option<ReadCb>>,
    write_callback: RefCell<Option<WriteCb>>,
}

impl StreamInner {
    pub(crate) fn owner_token(self: &Rc<Self>) -> usize {
        Rc::as_ptr(self) as usize
    }

    fn context(&self) -> Result<Rc<ContextInner>, ErrorCode> {
        self.context.upgrade().ok_or(ErrorCode::ConnectionTerminated)
    }

    pub(crate) fn set_state(this: &Rc<Self>, st: StreamState) {
        if this.state.get() == st {
            return;
        }
        let _guard = Rc::clone(this);
        this.state.set(st);
        debug!(state = ?st, channel = this.channel.get(), "stream state");

        if st.is_terminal() {
            if let Some(ctx) = this.context.upgrade() {
                if this.channel_valid.get() {
                    let map = if this.direction.get() == Direction::Record {
                        &ctx.record_streams
                    } else {
                        &ctx.playback_streams
                    };
                    map.borrow_mut().remove(&this.channel.get());
                }
                if let Some(pd) = ctx.pdispatch() {
                    pd.unregister_replies(this.owner_token());
                }
                ctx.streams.borrow_mut().swap_remove(&this.owner_token());
            }
            if let Some(e) = this.ipol_event.borrow_mut().take() {
                e.free();
            }
            this.sendq.borrow_mut().clear();
            this.queued_bytes.set(0);
        }

        if let Some(cb) = this.state_callback.borrow_mut().as_mut() {
            cb(st);
        }
    }

    /// The server granted playback credit: flush queued audio first, then
    /// report any credit left over to the writer.
    pub(crate) fn on_request(this: &Rc<Self>, bytes: usize) {
        if this.state.get() != StreamState::Ready {
            return;
        }
        let _guard = Rc::clone(this);
        this.requested_bytes.set(this.requested_bytes.get() + bytes);
        Self::flush_pending(this);

        let free = this.requested_bytes.get();
        if free > 0 {
            if let Some(cb) = this.write_callback.borrow_mut().as_mut() {
                cb(free);
            }
        }
    }

    /// Emits queued writes as far as the current credit allows. A write is
    /// split when only part of it fits; the tail keeps its place at the
    /// head of the queue with its seek already applied.
    fn flush_pending(this: &Rc<Self>) {
        let Some(ctx) = this.context.upgrade() else { return };
        let Some(pstream) = ctx.pstream() else { return };

        loop {
            let credit = this.requested_bytes.get();
            if credit == 0 {
                return;
            }

            let (chunk, delta) = {
                let mut q = this.sendq.borrow_mut();
                let Some(front) = q.front_mut() else { return };
                if front.chunk.length <= credit {
                    let item = q.pop_front().unwrap();
                    (item.chunk, item.delta)
                } else {
                    let head =
                        Memchunk::new(front.chunk.block.clone(), front.chunk.index, credit);
                    let delta = front.delta;
                    front.chunk.consume(credit);
                    front.delta = 0;
                    (head, delta)
                }
            };

            let length = chunk.length;
            pstream.send_memblock(this.channel.get(), delta, chunk);
            this.queued_bytes.set(this.queued_bytes.get() - length);
            this.requested_bytes.set(this.requested_bytes.get() - length);
            this.counter.set(this.counter.get() + length as u64);
            if this.direction.get() == Direction::Upload {
                let left = this.upload_remaining.get().saturating_sub(length as u64);
                this.upload_remaining.set(left);
            }
        }
    }

    /// Bulk audio arrived for this (record) stream.
    pub(crate) fn on_record_data(&self, chunk: &Memchunk) {
        if self.state.get() != StreamState::Ready {
            return;
        }
        if let Some(cb) = self.read_callback.borrow_mut().as_mut() {
            cb(chunk);
            return;
        }
        if let Some(q) = self.recvq.borrow_mut().as_mut() {
            if q.push(chunk.clone()).is_err() {
                debug!(channel = self.channel.get(), "record queue overrun, dropping fragment");
            }
        }
    }

    fn create_reply(this: &Rc<Self>, command: Command, ts: Option<&mut TagstructReader<'_>>) {
        let Some(ctx) = this.context.upgrade() else { return };
        let _guard = Rc::clone(this);
        let _ctx_guard = Rc::clone(&ctx);

        if this.state.get() != StreamState::Creating {
            return;
        }

        if command != Command::Reply {
            if ctx.handle_reply_error(command, ts).is_ok() {
                Self::set_state(this, StreamState::Failed);
            }
            return;
        }

        let direction = this.direction.get();
        let Some(ts) = ts else {
            ctx.fail(ErrorCode::Protocol);
            return;
        };
        let parsed = (|| -> Result<(), chorus_wire::TagstructError> {
            this.channel.set(ts.get_u32()?);
            if direction != Direction::Upload {
                this.device_index.set(ts.get_u32()?);
            }
            if direction != Direction::Record {
                this.requested_bytes.set(ts.get_u32()? as usize);
            }
            ts.expect_eof()
        })();
        if parsed.is_err() {
            ctx.fail(ErrorCode::Protocol);
            return;
        }

        this.channel_valid.set(true);
        let map = if direction == Direction::Record {
            &ctx.record_streams
        } else {
            &ctx.playback_streams
        };
        map.borrow_mut().insert(this.channel.get(), Rc::downgrade(this));

        if direction == Direction::Record {
            let attr = this.buffer_attr.get();
            *this.recvq.borrow_mut() =
                Some(Memblockq::new(attr.maxlength as usize, attr.maxlength as usize, 0, 1));
        }

        Self::set_state(this, StreamState::Ready);

        if this.interpolate.get() {
            let handle = Stream { inner: Rc::clone(this) };
            let _ = handle.get_latency_info(None);
            Self::arm_ipol_timer(this);
        }

        let credit = this.requested_bytes.get();
        if credit > 0 {
            if let Some(cb) = this.write_callback.borrow_mut().as_mut() {
                cb(credit);
            }
        }
    }

    fn arm_ipol_timer(this: &Rc<Self>) {
        debug_assert!(this.ipol_event.borrow().is_none());
        let weak = Rc::downgrade(this);
        let e = this.api.time_new(
            Timeval::now().add_usec(LATENCY_IPOL_INTERVAL),
            Box::new(move |e, _| {
                let Some(inner) = weak.upgrade() else {
                    e.free();
                    return;
                };
                let handle = Stream { inner: Rc::clone(&inner) };
                let _ = handle.get_latency_info(None);
                e.restart(Some(Timeval::now().add_usec(LATENCY_IPOL_INTERVAL)));
            }),
        );
        *this.ipol_event.borrow_mut() = Some(e);
    }

    fn latency_reply(
        this: &Rc<Self>,
        op: &Rc<OperationInner>,
        user: Option<LatencyCb>,
        command: Command,
        ts: Option<&mut TagstructReader<'_>>,
    ) {
        let Some(ctx) = this.context.upgrade() else { return };
        let _guard = Rc::clone(this);
        let _ctx_guard = Rc::clone(&ctx);

        if command != Command::Reply {
            let failed = ctx.handle_reply_error(command, ts).is_err();
            if !failed && op.is_running() {
                if let Some(cb) = user {
                    cb(None);
                }
            }
            op.done();
            return;
        }

        let mut info = LatencyInfo::default();
        let parsed = ts.ok_or(chorus_wire::TagstructError::ShortBuffer).and_then(|ts| {
            info.buffer_usec = ts.get_usec()?;
            info.sink_usec = ts.get_usec()?;
            info.source_usec = ts.get_usec()?;
            info.playing = ts.get_boolean()?;
            info.queue_length = ts.get_u32()?;
            let local = ts.get_timeval()?;
            let remote = ts.get_timeval()?;
            info.counter = ts.get_u64()?;
            ts.expect_eof()?;
            Ok((local, remote))
        });
        let Ok((local, remote)) = parsed else {
            ctx.fail(ErrorCode::Protocol);
            op.done();
            return;
        };

        let now = Timeval::now();
        if local < remote && remote < now {
            // The two clocks look synchronized; the one-way delay can be
            // read off directly.
            info.transport_usec = if this.direction.get() == Direction::Playback {
                remote.since(local)
            } else {
                now.since(remote)
            };
            info.synchronized_clocks = true;
            info.timestamp = remote;
        } else {
            // No agreement; assume the round trip was symmetric.
            info.transport_usec = now.since(local) / 2;
            info.synchronized_clocks = false;
            info.timestamp = local.add_usec(info.transport_usec);
        }

        if this.interpolate.get() {
            this.ipol_timestamp.set(now);
            let t = Self::stream_time(this, Some(&info));
            this.ipol_usec.set(t);
        }

        if op.is_running() {
            if let Some(cb) = user {
                cb(Some(&info));
            }
        }
        op.done();
    }

    /// Current playback (or record) time, monotonically clamped.
    fn stream_time(this: &Rc<Self>, info: Option<&LatencyInfo>) -> MicroSeconds {
        let mut usec = this.sample_spec.bytes_to_usec(this.counter.get());

        if let Some(i) = info {
            match this.direction.get() {
                Direction::Playback => {
                    let latency = i.transport_usec + i.buffer_usec + i.sink_usec;
                    usec = usec.saturating_sub(latency);
                }
                Direction::Record => {
                    usec += i.source_usec + i.buffer_usec + i.transport_usec;
                    usec = usec.saturating_sub(i.sink_usec);
                }
                Direction::Upload => {}
            }
        }

        if usec < this.previous_time.get() {
            usec = this.previous_time.get();
        }
        this.previous_time.set(usec);
        usec
    }
}

/// Handle to one logical audio stream. Cloning shares the stream.
#[derive(Clone)]
pub struct Stream {
    pub(crate) inner: Rc<StreamInner>,
}

impl Stream {
    /// A new disconnected stream on `context`. The channel map defaults to
    /// the conventional layout for the spec's channel count.
    pub fn new(
        context: &Context,
        name: &str,
        spec: &SampleSpec,
        map: Option<ChannelMap>,
    ) -> Result<Self, ErrorCode> {
        if !spec.is_valid() {
            return Err(ErrorCode::Invalid);
        }
        let map = match map {
            Some(m) => {
                if m.len() != usize::from(spec.channels) {
                    return Err(ErrorCode::Invalid);
                }
                m
            }
            None => ChannelMap::default_for(spec.channels),
        };

        let inner = Rc::new(StreamInner {
            context: Rc::downgrade(&context.inner),
            api: Api::clone(&context.inner.api),
            name: name.to_owned(),
            sample_spec: *spec,
            channel_map: map,
            direction: Cell::new(Direction::Playback),
            state: Cell::new(StreamState::Disconnected),
            flags: Cell::new(StreamFlags::empty()),
            buffer_attr: Cell::new(BufferAttr::default()),
            channel: Cell::new(0),
            channel_valid: Cell::new(false),
            device_index: Cell::new(INVALID_INDEX),
            requested_bytes: Cell::new(0),
            queued_bytes: Cell::new(0),
            sendq: RefCell::new(VecDeque::new()),
            counter: Cell::new(0),
            upload_remaining: Cell::new(0),
            previous_time: Cell::new(MicroSeconds::ZERO),
            corked: Cell::new(false),
            interpolate: Cell::new(false),
            ipol_usec: Cell::new(MicroSeconds::ZERO),
            ipol_timestamp: Cell::new(Timeval::ZERO),
            ipol_event: RefCell::new(None),
            recvq: RefCell::new(None),
            state_callback: RefCell::new(None),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
        });

        context
            .inner
            .streams
            .borrow_mut()
            .insert(inner.owner_token(), Rc::clone(&inner));
        Ok(Self { inner })
    }

    pub fn state(&self) -> StreamState {
        self.inner.state.get()
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction.get()
    }

    pub fn sample_spec(&self) -> &SampleSpec {
        &self.inner.sample_spec
    }

    /// The channel id assigned by the server, valid once `Ready`.
    pub fn channel(&self) -> u32 {
        self.inner.channel.get()
    }

    /// The server-side object index, valid once `Ready`.
    pub fn device_index(&self) -> u32 {
        self.inner.device_index.get()
    }

    /// Total bytes written since creation.
    pub fn counter(&self) -> u64 {
        self.inner.counter.get()
    }

    pub fn buffer_attr(&self) -> BufferAttr {
        self.inner.buffer_attr.get()
    }

    pub fn flags(&self) -> StreamFlags {
        self.inner.flags.get()
    }

    pub fn set_state_callback(&self, cb: StreamStateCb) {
        *self.inner.state_callback.borrow_mut() = Some(cb);
    }

    pub fn set_read_callback(&self, cb: ReadCb) {
        *self.inner.read_callback.borrow_mut() = Some(cb);
    }

    /// `cb` receives the writable byte count whenever credit is positive.
    pub fn set_write_callback(&self, cb: WriteCb) {
        *self.inner.write_callback.borrow_mut() = Some(cb);
    }

    fn connect_common(
        &self,
        direction: Direction,
        attr: Option<&BufferAttr>,
        flags: StreamFlags,
    ) -> Result<Rc<ContextInner>, ErrorCode> {
        let s = &self.inner;
        let ctx = s.context()?;
        ctx.ensure_ready()?;
        if s.state.get() != StreamState::Disconnected {
            return Err(ErrorCode::Exist);
        }

        s.direction.set(direction);
        s.flags.set(flags);
        s.interpolate.set(flags.contains(StreamFlags::INTERPOLATE_LATENCY));
        s.corked.set(flags.contains(StreamFlags::START_CORKED));
        if let Some(a) = attr {
            s.buffer_attr.set(*a);
        }
        s.previous_time.set(MicroSeconds::ZERO);
        s.ipol_usec.set(MicroSeconds::ZERO);
        s.ipol_timestamp.set(Timeval::ZERO);

        StreamInner::set_state(&self.inner, StreamState::Creating);
        Ok(ctx)
    }

    /// Attaches the stream to a sink for playback. `dev` of `None` selects
    /// the configured or server default sink.
    pub fn connect_playback(
        &self,
        dev: Option<&str>,
        attr: Option<&BufferAttr>,
        flags: StreamFlags,
        volume: ChannelVolumes,
    ) -> Result<(), ErrorCode> {
        let s = &self.inner;
        let ctx = self.connect_common(Direction::Playback, attr, flags)?;

        let dev = dev.map(str::to_owned).or_else(|| ctx.conf.default_sink.clone());
        let a = s.buffer_attr.get();
        let weak = Rc::downgrade(s);
        ctx.request(
            Command::CreatePlaybackStream,
            ctx.reply_timeout(),
            s.owner_token(),
            |w| {
                w.put_string(Some(&s.name));
                w.put_sample_spec(&s.sample_spec);
                w.put_channel_map(&s.channel_map);
                w.put_u32(INVALID_INDEX);
                w.put_string(dev.as_deref());
                w.put_u32(a.maxlength);
                w.put_boolean(flags.contains(StreamFlags::START_CORKED));
                w.put_u32(a.tlength);
                w.put_u32(a.prebuf);
                w.put_u32(a.minreq);
                w.put_cvolume(&volume);
            },
            Box::new(move |command, _tag, ts| {
                if let Some(s) = weak.upgrade() {
                    StreamInner::create_reply(&s, command, ts);
                }
            }),
        )?;
        Ok(())
    }

    /// Attaches the stream to a source for recording.
    pub fn connect_record(
        &self,
        dev: Option<&str>,
        attr: Option<&BufferAttr>,
        flags: StreamFlags,
    ) -> Result<(), ErrorCode> {
        let s = &self.inner;
        let ctx = self.connect_common(Direction::Record, attr, flags)?;

        let dev = dev.map(str::to_owned).or_else(|| ctx.conf.default_source.clone());
        let a = s.buffer_attr.get();
        let weak = Rc::downgrade(s);
        ctx.request(
            Command::CreateRecordStream,
            ctx.reply_timeout(),
            s.owner_token(),
            |w| {
                w.put_string(Some(&s.name));
                w.put_sample_spec(&s.sample_spec);
                w.put_channel_map(&s.channel_map);
                w.put_u32(INVALID_INDEX);
                w.put_string(dev.as_deref());
                w.put_u32(a.maxlength);
                w.put_boolean(flags.contains(StreamFlags::START_CORKED));
                w.put_u32(a.fragsize);
            },
            Box::new(move |command, _tag, ts| {
                if let Some(s) = weak.upgrade() {
                    StreamInner::create_reply(&s, command, ts);
                }
            }),
        )?;
        Ok(())
    }

    /// Opens a sample-upload stream of exactly `length` bytes; finish with
    /// [`finish_upload`](Self::finish_upload) once everything is written.
    pub fn connect_upload(&self, length: u32) -> Result<(), ErrorCode> {
        let s = &self.inner;
        let ctx = self.connect_common(Direction::Upload, None, StreamFlags::empty())?;
        if length == 0 {
            StreamInner::set_state(s, StreamState::Failed);
            return Err(ErrorCode::Invalid);
        }
        s.upload_remaining.set(u64::from(length));

        let weak = Rc::downgrade(s);
        ctx.request(
            Command::CreateUploadStream,
            ctx.reply_timeout(),
            s.owner_token(),
            |w| {
                w.put_string(Some(&s.name));
                w.put_sample_spec(&s.sample_spec);
                w.put_u32(length);
            },
            Box::new(move |command, _tag, ts| {
                if let Some(s) = weak.upgrade() {
                    StreamInner::create_reply(&s, command, ts);
                }
            }),
        )?;
        Ok(())
    }

    /// Writes audio, copying `data` into a fresh memblock. `delta` shifts
    /// the server-side write pointer relative to the playback cursor.
    pub fn write(&self, data: &[u8], delta: i64) -> Result<(), ErrorCode> {
        if data.is_empty() {
            return Ok(());
        }
        let ctx = self.inner.context()?;
        let block = Memblock::new_copied(data, Some(&ctx.stat));
        self.write_block(block, delta)
    }

    /// Writes caller-owned audio without copying; the owner is released
    /// once the bytes have left the process.
    pub fn write_owned<T>(&self, data: T, delta: i64) -> Result<(), ErrorCode>
    where
        T: AsRef<[u8]> + Send + 'static,
    {
        let ctx = self.inner.context()?;
        let block = Memblock::from_owner(data, Some(&ctx.stat));
        self.write_block(block, delta)
    }

    fn write_block(&self, block: Memblock, delta: i64) -> Result<(), ErrorCode> {
        let s = &self.inner;
        if s.state.get() != StreamState::Ready {
            return Err(ErrorCode::Invalid);
        }

        let length = block.len();
        s.sendq
            .borrow_mut()
            .push_back(PendingWrite { chunk: Memchunk::from_block(block), delta });
        s.queued_bytes.set(s.queued_bytes.get() + length);
        StreamInner::flush_pending(s);
        Ok(())
    }

    /// Unspent playback credit, net of audio already queued against it.
    pub fn writable_size(&self) -> usize {
        self.inner.requested_bytes.get().saturating_sub(self.inner.queued_bytes.get())
    }

    /// Bytes buffered on a record stream that has no read callback.
    pub fn readable_size(&self) -> usize {
        self.inner.recvq.borrow().as_ref().map_or(0, Memblockq::length)
    }

    /// The next buffered record fragment, if any.
    pub fn peek(&self) -> Option<Memchunk> {
        self.inner.recvq.borrow().as_ref().and_then(|q| q.peek().cloned())
    }

    /// Discards `n` buffered record bytes.
    pub fn discard(&self, n: usize) {
        if let Some(q) = self.inner.recvq.borrow_mut().as_mut() {
            q.drop_bytes(n);
        }
    }

    fn command(
        &self,
        command: Command,
        extra: impl FnOnce(&mut TagstructWriter),
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        let s = &self.inner;
        let ctx = s.context()?;
        ctx.ensure_ready()?;
        if s.state.get() != StreamState::Ready {
            return Err(ErrorCode::Invalid);
        }

        let op = OperationInner::start(&ctx);
        let reply = ctx.ack_reply(Rc::clone(&op), cb);
        ctx.request(
            command,
            ctx.reply_timeout(),
            s.owner_token(),
            |w| {
                w.put_u32(s.channel.get());
                extra(w);
            },
            reply,
        )?;
        Ok(Operation::new(op))
    }

    /// Completes once the server has played everything written so far.
    pub fn drain(&self, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        if self.inner.direction.get() != Direction::Playback {
            return Err(ErrorCode::Invalid);
        }
        self.command(Command::DrainPlaybackStream, |_| {}, cb)
    }

    /// Pauses (`true`) or resumes (`false`) the stream.
    pub fn cork(&self, b: bool, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        let s = &self.inner;
        if s.direction.get() == Direction::Upload {
            return Err(ErrorCode::Invalid);
        }

        // Re-baseline the interpolation snapshot across the transition:
        // freezing keeps the last interpolated value, resuming restarts
        // the clock from now.
        if s.interpolate.get() {
            if !s.corked.get() && b {
                let t = self.get_interpolated_time();
                s.ipol_usec.set(t);
            } else if s.corked.get() && !b {
                s.ipol_timestamp.set(Timeval::now());
            }
        }
        s.corked.set(b);

        let command = if s.direction.get() == Direction::Playback {
            Command::CorkPlaybackStream
        } else {
            Command::CorkRecordStream
        };
        let op = self.command(command, |w| w.put_boolean(b), cb)?;
        self.poll_latency_quietly();
        Ok(op)
    }

    /// Drops all queued audio server-side.
    pub fn flush(&self, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        let command = match self.inner.direction.get() {
            Direction::Playback => Command::FlushPlaybackStream,
            Direction::Record => Command::FlushRecordStream,
            Direction::Upload => return Err(ErrorCode::Invalid),
        };
        let op = self.command(command, |_| {}, cb)?;
        self.poll_latency_quietly();
        Ok(op)
    }

    /// Re-enters the prebuffer state.
    pub fn prebuf(&self, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        if self.inner.direction.get() != Direction::Playback {
            return Err(ErrorCode::Invalid);
        }
        let op = self.command(Command::PrebufPlaybackStream, |_| {}, cb)?;
        self.poll_latency_quietly();
        Ok(op)
    }

    /// Starts playback immediately, ignoring the prebuffer threshold.
    pub fn trigger(&self, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        if self.inner.direction.get() != Direction::Playback {
            return Err(ErrorCode::Invalid);
        }
        let op = self.command(Command::TriggerPlaybackStream, |_| {}, cb)?;
        self.poll_latency_quietly();
        Ok(op)
    }

    /// Renames the stream server-side.
    pub fn set_name(&self, name: &str, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        let command = match self.inner.direction.get() {
            Direction::Playback => Command::SetPlaybackStreamName,
            Direction::Record => Command::SetRecordStreamName,
            Direction::Upload => return Err(ErrorCode::Invalid),
        };
        let name = name.to_owned();
        self.command(command, move |w| w.put_string(Some(&name)), cb)
    }

    /// Declares the upload complete; the stream terminates on success.
    pub fn finish_upload(&self, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        let s = &self.inner;
        if s.direction.get() != Direction::Upload {
            return Err(ErrorCode::Invalid);
        }
        if s.upload_remaining.get() > 0 {
            warn!(missing = s.upload_remaining.get(), "upload finished short of announced length");
        }
        let ctx = s.context()?;
        ctx.ensure_ready()?;
        if s.state.get() != StreamState::Ready {
            return Err(ErrorCode::Invalid);
        }

        let op = OperationInner::start(&ctx);
        let weak = Rc::downgrade(s);
        let opc = Rc::clone(&op);
        ctx.request(
            Command::FinishUploadStream,
            ctx.reply_timeout(),
            s.owner_token(),
            |w| w.put_u32(s.channel.get()),
            Box::new(move |command, _tag, ts| {
                let Some(s) = weak.upgrade() else { return };
                let Some(ctx) = s.context.upgrade() else { return };
                let _guard = Rc::clone(&s);

                let mut success = true;
                if command != Command::Reply {
                    if ctx.handle_reply_error(command, ts).is_err() {
                        opc.done();
                        return;
                    }
                    success = false;
                } else if ts.is_none_or(|t| t.expect_eof().is_err()) {
                    ctx.fail(ErrorCode::Protocol);
                    opc.done();
                    return;
                }

                if success {
                    StreamInner::set_state(&s, StreamState::Terminated);
                }
                if opc.is_running() {
                    if let Some(cb) = cb {
                        cb(success);
                    }
                }
                opc.done();
            }),
        )?;
        Ok(Operation::new(op))
    }

    /// Detaches from the server; the stream terminates once acknowledged.
    pub fn disconnect(&self) -> Result<(), ErrorCode> {
        let s = &self.inner;
        if !s.channel_valid.get() {
            return Err(ErrorCode::Invalid);
        }
        let ctx = s.context()?;
        ctx.ensure_ready()?;

        let command = match s.direction.get() {
            Direction::Playback => Command::DeletePlaybackStream,
            Direction::Record => Command::DeleteRecordStream,
            Direction::Upload => Command::DeleteUploadStream,
        };
        let weak = Rc::downgrade(s);
        ctx.request(
            command,
            ctx.reply_timeout(),
            s.owner_token(),
            |w| w.put_u32(s.channel.get()),
            Box::new(move |command, _tag, ts| {
                let Some(s) = weak.upgrade() else { return };
                let Some(ctx) = s.context.upgrade() else { return };
                let _guard = Rc::clone(&s);

                if command != Command::Reply {
                    if ctx.handle_reply_error(command, ts).is_ok() {
                        StreamInner::set_state(&s, StreamState::Failed);
                    }
                    return;
                }
                if ts.is_none_or(|t| t.expect_eof().is_err()) {
                    ctx.fail(ErrorCode::Protocol);
                    return;
                }
                StreamInner::set_state(&s, StreamState::Terminated);
            }),
        )?;
        Ok(())
    }

    /// Requests a fresh latency measurement from the server.
    pub fn get_latency_info(&self, cb: Option<LatencyCb>) -> Result<Operation, ErrorCode> {
        let s = &self.inner;
        if s.direction.get() == Direction::Upload {
            return Err(ErrorCode::Invalid);
        }
        let ctx = s.context()?;
        ctx.ensure_ready()?;
        if s.state.get() != StreamState::Ready {
            return Err(ErrorCode::Invalid);
        }

        let command = if s.direction.get() == Direction::Playback {
            Command::GetPlaybackLatency
        } else {
            Command::GetRecordLatency
        };
        let now = Timeval::now();
        let counter = s.counter.get();
        let op = OperationInner::start(&ctx);
        let weak = Rc::downgrade(s);
        let opc = Rc::clone(&op);
        ctx.request(
            command,
            ctx.reply_timeout(),
            s.owner_token(),
            |w| {
                w.put_u32(s.channel.get());
                w.put_timeval(now);
                w.put_u64(counter);
            },
            Box::new(move |command, _tag, ts| {
                if let Some(s) = weak.upgrade() {
                    StreamInner::latency_reply(&s, &opc, cb, command, ts);
                }
            }),
        )?;
        Ok(Operation::new(op))
    }

    fn poll_latency_quietly(&self) {
        if self.inner.direction.get() != Direction::Upload {
            let _ = self.get_latency_info(None);
        }
    }

    /// Playback/record time derived from the byte counter and, when given,
    /// a latency measurement. Never decreases across calls.
    pub fn get_time(&self, info: Option<&LatencyInfo>) -> MicroSeconds {
        StreamInner::stream_time(&self.inner, info)
    }

    /// Distance between write pointer and play pointer. The flag is true
    /// when the play pointer is ahead (negative latency).
    pub fn get_latency(&self, info: &LatencyInfo) -> (MicroSeconds, bool) {
        let t = self.get_time(Some(info));
        let c = self.inner.sample_spec.bytes_to_usec(self.inner.counter.get());
        if t <= c { (c - t, false) } else { (t - c, true) }
    }

    /// Time interpolated from the cached latency snapshot, without a round
    /// trip. Requires `INTERPOLATE_LATENCY`. Never decreases.
    pub fn get_interpolated_time(&self) -> MicroSeconds {
        let s = &self.inner;
        debug_assert!(s.interpolate.get());

        let mut usec = if s.corked.get() || s.ipol_timestamp.get().is_zero() {
            s.ipol_usec.get()
        } else {
            s.ipol_usec.get() + s.ipol_timestamp.get().age()
        };

        if usec < s.previous_time.get() {
            usec = s.previous_time.get();
        }
        s.previous_time.set(usec);
        usec
    }

    pub fn get_interpolated_latency(&self) -> (MicroSeconds, bool) {
        let t = self.get_interpolated_time();
        let c = self.inner.sample_spec.bytes_to_usec(self.inner.counter.get());
        if t <= c { (c - t, false) } else { (t - c, true) }
    }
}
