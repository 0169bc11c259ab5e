//! Per-client connection state machine.
//!
//! A context walks `Unconnected → Connecting → Authorizing → SettingName →
//! Ready` and ends in `Failed` or `Terminated`. It owns the socket client,
//! the packet stream and the dispatcher, multiplexes server-initiated
//! commands onto its streams, and keeps the live lists of streams and
//! operations (strong references here, weak back-references in the
//! children).

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    os::{fd::RawFd, unix::process::CommandExt},
    path::Path,
    rc::{Rc, Weak},
};

use chorus_loop::Api;
use chorus_net::{CommandHandler, IoChannel, Pdispatch, Pstream, ReplyCallback, SocketClient};
use chorus_timing::MicroSeconds;
use chorus_wire::{Command, ErrorCode, MemblockStat, TagstructReader, TagstructWriter};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::{
    authkey,
    config::{ClientConfig, DEFAULT_PORT, DEFAULT_UNIX_SOCKET, ENV_AUTOSPAWNED, ENV_PASSED_FD},
    operation::OperationInner,
    stream::StreamInner,
    subscribe::SubscriptionEvent,
    types::{ContextState, SpawnApi, StreamState},
};

/// Deadline for the connection-setup handshake. Data-plane replies use the
/// configurable `ClientConfig::reply_timeout`.
pub(crate) const CONNECT_TIMEOUT: MicroSeconds = MicroSeconds(60 * 1_000_000);

pub type AckCb = Box<dyn FnOnce(bool)>;
pub type StateCb = Box<dyn FnMut(&Context)>;
pub type SubscribeCb = Box<dyn FnMut(SubscriptionEvent, u32)>;

pub(crate) struct ContextInner {
    pub(crate) api: Api,
    pub(crate) name: String,
    pub(crate) conf: ClientConfig,

    state: Cell<ContextState>,
    error: Cell<ErrorCode>,
    ctag: Cell<u32>,
    local: Cell<bool>,

    client: RefCell<Option<SocketClient>>,
    pstream: RefCell<Option<Pstream>>,
    pdispatch: RefCell<Option<Pdispatch>>,
    server_list: RefCell<VecDeque<String>>,

    pub(crate) playback_streams: RefCell<HashMap<u32, Weak<StreamInner>>>,
    pub(crate) record_streams: RefCell<HashMap<u32, Weak<StreamInner>>>,
    pub(crate) streams: RefCell<IndexMap<usize, Rc<StreamInner>>>,
    pub(crate) operations: RefCell<Vec<Rc<OperationInner>>>,

    state_callback: RefCell<Option<StateCb>>,
    pub(crate) subscribe_callback: RefCell<Option<SubscribeCb>>,

    pub(crate) stat: MemblockStat,
    auth_cookie: RefCell<Vec<u8>>,
}

impl ContextInner {
    pub(crate) fn handle(self: &Rc<Self>) -> Context {
        Context { inner: Rc::clone(self) }
    }

    pub(crate) fn owner_token(self: &Rc<Self>) -> usize {
        Rc::as_ptr(self) as usize
    }

    pub(crate) fn reply_timeout(&self) -> MicroSeconds {
        self.conf.reply_timeout
    }

    pub(crate) fn next_tag(&self) -> u32 {
        let tag = self.ctag.get();
        self.ctag.set(tag.wrapping_add(1));
        tag
    }

    pub(crate) fn state(&self) -> ContextState {
        self.state.get()
    }

    pub(crate) fn last_error(&self) -> ErrorCode {
        self.error.get()
    }

    /// Updates the cached error. Once the context is in a terminal state
    /// the original cause is preserved.
    pub(crate) fn set_error(&self, code: ErrorCode) {
        if !self.state.get().is_terminal() {
            self.error.set(code);
        }
    }

    pub(crate) fn fail(self: &Rc<Self>, code: ErrorCode) {
        self.set_error(code);
        self.set_state(ContextState::Failed);
    }

    pub(crate) fn set_state(self: &Rc<Self>, st: ContextState) {
        if self.state.get() == st {
            return;
        }
        let _guard = Rc::clone(self);
        self.state.set(st);
        debug!(state = ?st, "context state");

        if st.is_terminal() {
            let target = if st == ContextState::Failed {
                StreamState::Failed
            } else {
                StreamState::Terminated
            };
            let streams: Vec<Rc<StreamInner>> =
                self.streams.borrow().values().cloned().collect();
            for s in streams {
                StreamInner::set_state(&s, target);
            }
            // On failure every in-flight call completes with a synthetic
            // failure; a clean disconnect cancels them silently instead.
            if st == ContextState::Failed {
                let pd = self.pdispatch.borrow().clone();
                if let Some(pd) = pd {
                    pd.fail_all();
                }
            }
        }

        if let Some(cb) = self.state_callback.borrow_mut().as_mut() {
            cb(&self.handle());
        }

        // Resources go away only after the state callback has had its look.
        if st.is_terminal() {
            self.pdispatch.borrow_mut().take();
            if let Some(ps) = self.pstream.borrow_mut().take() {
                ps.close();
            }
            self.client.borrow_mut().take();
            let ops: Vec<_> = self.operations.borrow().clone();
            for op in ops {
                op.cancel();
            }
        }
    }

    /// Classifies a non-`Reply` completion. `Ok` means the error was an
    /// ordinary per-operation failure (now cached); `Err` means the
    /// context itself was failed.
    pub(crate) fn handle_reply_error(
        self: &Rc<Self>,
        command: Command,
        ts: Option<&mut TagstructReader<'_>>,
    ) -> Result<(), ()> {
        match command {
            Command::Error => {
                let code = ts
                    .and_then(|t| t.get_u32().ok())
                    .and_then(ErrorCode::from_repr);
                match code {
                    Some(code) => {
                        self.set_error(code);
                        Ok(())
                    }
                    None => {
                        self.fail(ErrorCode::Protocol);
                        Err(())
                    }
                }
            }
            Command::Timeout => {
                self.set_error(ErrorCode::Timeout);
                Ok(())
            }
            _ => {
                self.fail(ErrorCode::Protocol);
                Err(())
            }
        }
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), ErrorCode> {
        match self.state.get() {
            ContextState::Ready => Ok(()),
            s if s.is_terminal() => {
                let e = self.last_error();
                Err(if e == ErrorCode::Ok { ErrorCode::ConnectionTerminated } else { e })
            }
            _ => Err(ErrorCode::Invalid),
        }
    }

    /// Sends `command` with a fresh tag and registers its continuation.
    pub(crate) fn request(
        self: &Rc<Self>,
        command: Command,
        timeout: MicroSeconds,
        owner: usize,
        fields: impl FnOnce(&mut TagstructWriter),
        cb: ReplyCallback,
    ) -> Result<u32, ErrorCode> {
        let (pstream, pdispatch) = {
            let ps = self.pstream.borrow().clone();
            let pd = self.pdispatch.borrow().clone();
            match (ps, pd) {
                (Some(ps), Some(pd)) => (ps, pd),
                _ => return Err(ErrorCode::ConnectionTerminated),
            }
        };

        let tag = self.next_tag();
        let mut w = TagstructWriter::new();
        w.put_u32(command as u32);
        w.put_u32(tag);
        fields(&mut w);
        pstream.send_tagstruct(w);
        pdispatch.register_reply(tag, timeout, owner, cb);
        Ok(tag)
    }

    /// Continuation for commands answered by a bare acknowledgment.
    pub(crate) fn ack_reply(
        self: &Rc<Self>,
        op: Rc<OperationInner>,
        user: Option<AckCb>,
    ) -> ReplyCallback {
        let weak = Rc::downgrade(self);
        Box::new(move |command, _tag, ts| {
            let Some(ctx) = weak.upgrade() else { return };
            let _guard = Rc::clone(&ctx);

            let mut success = true;
            if command != Command::Reply {
                if ctx.handle_reply_error(command, ts).is_err() {
                    op.done();
                    return;
                }
                success = false;
            } else if ts.is_none_or(|t| t.expect_eof().is_err()) {
                ctx.fail(ErrorCode::Protocol);
                op.done();
                return;
            }

            if op.is_running() {
                if let Some(cb) = user {
                    cb(success);
                }
            }
            op.done();
        })
    }

    // Server-initiated commands.

    fn command_request(self: &Rc<Self>, ts: &mut TagstructReader<'_>) {
        let _guard = Rc::clone(self);
        let parsed = (|| -> Result<(u32, u32), chorus_wire::TagstructError> {
            let channel = ts.get_u32()?;
            let bytes = ts.get_u32()?;
            ts.expect_eof()?;
            Ok((channel, bytes))
        })();
        let Ok((channel, bytes)) = parsed else {
            self.fail(ErrorCode::Protocol);
            return;
        };

        let stream = self.playback_streams.borrow().get(&channel).and_then(Weak::upgrade);
        if let Some(stream) = stream {
            StreamInner::on_request(&stream, bytes as usize);
        }
    }

    fn command_stream_killed(self: &Rc<Self>, command: Command, ts: &mut TagstructReader<'_>) {
        let _guard = Rc::clone(self);
        let channel = match ts.get_u32().and_then(|c| ts.expect_eof().map(|()| c)) {
            Ok(c) => c,
            Err(_) => {
                self.fail(ErrorCode::Protocol);
                return;
            }
        };

        let map = if command == Command::PlaybackStreamKilled {
            &self.playback_streams
        } else {
            &self.record_streams
        };
        let stream = map.borrow().get(&channel).and_then(Weak::upgrade);
        if let Some(stream) = stream {
            warn!(channel, "server killed stream");
            self.set_error(ErrorCode::Killed);
            StreamInner::set_state(&stream, StreamState::Failed);
        }
    }

    fn command_subscribe_event(self: &Rc<Self>, ts: &mut TagstructReader<'_>) {
        let _guard = Rc::clone(self);
        let parsed = (|| -> Result<(u32, u32), chorus_wire::TagstructError> {
            let e = ts.get_u32()?;
            let index = ts.get_u32()?;
            ts.expect_eof()?;
            Ok((e, index))
        })();
        let Ok((raw, index)) = parsed else {
            self.fail(ErrorCode::Protocol);
            return;
        };

        let Some(event) = SubscriptionEvent::from_wire(raw) else {
            self.fail(ErrorCode::Protocol);
            return;
        };
        if let Some(cb) = self.subscribe_callback.borrow_mut().as_mut() {
            cb(event, index);
        }
    }

    fn command_table(self: &Rc<Self>) -> Vec<(Command, CommandHandler)> {
        let on = |f: fn(&Rc<Self>, Command, &mut TagstructReader<'_>)| -> CommandHandler {
            let weak = Rc::downgrade(self);
            Box::new(move |command, _tag, ts| {
                if let Some(ctx) = weak.upgrade() {
                    f(&ctx, command, ts);
                }
            })
        };

        vec![
            (Command::Request, on(|ctx, _, ts| ctx.command_request(ts))),
            (Command::PlaybackStreamKilled, on(Self::command_stream_killed)),
            (Command::RecordStreamKilled, on(Self::command_stream_killed)),
            (Command::SubscribeEvent, on(|ctx, _, ts| ctx.command_subscribe_event(ts))),
        ]
    }

    // Connection establishment.

    fn try_next_server(self: &Rc<Self>) {
        loop {
            let next = self.server_list.borrow_mut().pop_front();
            let Some(server) = next else {
                self.fail(ErrorCode::ConnectionRefused);
                return;
            };

            match SocketClient::from_string(&self.api, &server, DEFAULT_PORT) {
                Ok(client) => {
                    debug!(server = %server, "connecting");
                    let weak = Rc::downgrade(self);
                    client.set_callback(Box::new(move |io| {
                        if let Some(ctx) = weak.upgrade() {
                            ctx.on_connection(io);
                        }
                    }));
                    self.local.set(client.is_local());
                    *self.client.borrow_mut() = Some(client);
                    return;
                }
                Err(e) => {
                    debug!(server = %server, error = %e, "connect attempt failed");
                }
            }
        }
    }

    fn on_connection(self: &Rc<Self>, io: Option<IoChannel>) {
        let _guard = Rc::clone(self);
        self.client.borrow_mut().take();

        match io {
            Some(io) => self.setup(io),
            // This candidate refused; walk on.
            None => self.try_next_server(),
        }
    }

    fn setup(self: &Rc<Self>, io: IoChannel) {
        let _guard = Rc::clone(self);

        let pstream = Pstream::new(&self.api, io, &self.stat);
        let weak = Rc::downgrade(self);
        pstream.set_die_callback(Box::new(move || {
            if let Some(ctx) = weak.upgrade() {
                ctx.fail(ErrorCode::ConnectionTerminated);
            }
        }));
        let weak = Rc::downgrade(self);
        pstream.set_recv_packet_callback(Box::new(move |packet| {
            let Some(ctx) = weak.upgrade() else { return };
            let pd = ctx.pdispatch.borrow().clone();
            if let Some(pd) = pd {
                if let Err(e) = pd.run(packet) {
                    warn!(error = %e, "invalid control packet");
                    ctx.fail(ErrorCode::Protocol);
                }
            }
        }));
        let weak = Rc::downgrade(self);
        pstream.set_recv_memblock_callback(Box::new(move |channel, _offset, chunk| {
            let Some(ctx) = weak.upgrade() else { return };
            let stream = ctx.record_streams.borrow().get(&channel).and_then(Weak::upgrade);
            if let Some(stream) = stream {
                stream.on_record_data(chunk);
            }
        }));
        *self.pstream.borrow_mut() = Some(pstream);

        *self.pdispatch.borrow_mut() = Some(Pdispatch::new(&self.api, self.command_table()));

        let Some(cookie_path) = self.conf.cookie_path() else {
            self.fail(ErrorCode::AuthKey);
            return;
        };
        match authkey::load_or_generate(&cookie_path) {
            Ok(cookie) => *self.auth_cookie.borrow_mut() = cookie,
            Err(e) => {
                warn!(error = %e, "cannot load auth cookie");
                self.fail(ErrorCode::AuthKey);
                return;
            }
        }

        let cookie = self.auth_cookie.borrow().clone();
        let weak = Rc::downgrade(self);
        let r = self.request(
            Command::Auth,
            CONNECT_TIMEOUT,
            self.owner_token(),
            |w| w.put_arbitrary(&cookie),
            Box::new(move |command, _tag, ts| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.setup_complete(command, ts);
                }
            }),
        );
        if r.is_ok() {
            self.set_state(ContextState::Authorizing);
        }
    }

    fn setup_complete(self: &Rc<Self>, command: Command, ts: Option<&mut TagstructReader<'_>>) {
        let _guard = Rc::clone(self);

        if command != Command::Reply {
            let _ = self.handle_reply_error(command, ts);
            self.fail(self.last_error());
            return;
        }
        if ts.is_none_or(|t| t.expect_eof().is_err()) {
            self.fail(ErrorCode::Protocol);
            return;
        }

        match self.state.get() {
            ContextState::Authorizing => {
                let name = self.name.clone();
                let weak = Rc::downgrade(self);
                let r = self.request(
                    Command::SetClientName,
                    CONNECT_TIMEOUT,
                    self.owner_token(),
                    |w| w.put_string(Some(&name)),
                    Box::new(move |command, _tag, ts| {
                        if let Some(ctx) = weak.upgrade() {
                            ctx.setup_complete(command, ts);
                        }
                    }),
                );
                if r.is_ok() {
                    self.set_state(ContextState::SettingName);
                }
            }
            ContextState::SettingName => {
                info!(name = %self.name, "connection ready");
                self.set_state(ContextState::Ready);
            }
            _ => self.fail(ErrorCode::Protocol),
        }
    }

    fn connect_spawn(self: &Rc<Self>, spawn: SpawnApi) -> Result<(), ErrorCode> {
        let _guard = Rc::clone(self);

        let mut fds: [RawFd; 2] = [-1, -1];
        if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } < 0 {
            self.fail(ErrorCode::Internal);
            return Err(ErrorCode::Internal);
        }
        // Our end must not leak into the child.
        unsafe {
            libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
        }

        if let Some(prefork) = spawn.prefork {
            prefork();
        }

        let mut command = std::process::Command::new(&self.conf.daemon_binary);
        command
            .args(&self.conf.extra_arguments)
            .env(ENV_AUTOSPAWNED, "1")
            .env(ENV_PASSED_FD, fds[1].to_string());
        if let Some(atfork) = spawn.atfork {
            unsafe {
                command.pre_exec(move || {
                    atfork();
                    Ok(())
                });
            }
        }

        info!(binary = %self.conf.daemon_binary.display(), "spawning daemon");
        let status = command.spawn().and_then(|mut child| child.wait());
        unsafe {
            libc::close(fds[1]);
        }

        if let Some(postfork) = spawn.postfork {
            postfork();
        }

        match status {
            Ok(status) if status.success() => {
                self.local.set(true);
                self.set_state(ContextState::Connecting);
                let io = IoChannel::new(&self.api, fds[0], fds[0]);
                self.setup(io);
                Ok(())
            }
            Ok(_) | Err(_) => {
                unsafe {
                    libc::close(fds[0]);
                }
                self.fail(ErrorCode::ConnectionRefused);
                Err(ErrorCode::ConnectionRefused)
            }
        }
    }

    fn connect(self: &Rc<Self>, server: Option<&str>, spawn: Option<SpawnApi>) -> Result<(), ErrorCode> {
        if self.state.get() != ContextState::Unconnected {
            return Err(ErrorCode::Invalid);
        }

        let mut list = VecDeque::new();
        if let Some(s) = server {
            list.push_back(s.to_owned());
        } else if let Some(s) = &self.conf.default_server {
            list.push_back(s.clone());
        } else {
            if let Some(spawn) = spawn {
                if self.conf.autospawn && !Path::new(DEFAULT_UNIX_SOCKET).exists() {
                    return self.connect_spawn(spawn);
                }
            }
            list.push_back(DEFAULT_UNIX_SOCKET.to_owned());
            list.push_back(format!("localhost:{DEFAULT_PORT}"));
        }

        *self.server_list.borrow_mut() = list;
        self.set_state(ContextState::Connecting);
        self.try_next_server();

        if self.state.get() == ContextState::Failed {
            Err(self.last_error())
        } else {
            Ok(())
        }
    }

    pub(crate) fn pstream(&self) -> Option<Pstream> {
        self.pstream.borrow().clone()
    }

    pub(crate) fn pdispatch(&self) -> Option<Pdispatch> {
        self.pdispatch.borrow().clone()
    }
}

/// Handle to a connection context. Cloning shares the connection.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Rc<ContextInner>,
}

impl Context {
    /// Creates an unconnected context named `name` on the given loop,
    /// with configuration from file and environment.
    pub fn new(api: &Api, name: &str) -> Self {
        Self::with_config(api, name, ClientConfig::load())
    }

    pub fn with_config(api: &Api, name: &str, conf: ClientConfig) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                api: Api::clone(api),
                name: name.to_owned(),
                conf,
                state: Cell::new(ContextState::Unconnected),
                error: Cell::new(ErrorCode::Ok),
                ctag: Cell::new(0),
                local: Cell::new(false),
                client: RefCell::new(None),
                pstream: RefCell::new(None),
                pdispatch: RefCell::new(None),
                server_list: RefCell::new(VecDeque::new()),
                playback_streams: RefCell::new(HashMap::new()),
                record_streams: RefCell::new(HashMap::new()),
                streams: RefCell::new(IndexMap::new()),
                operations: RefCell::new(Vec::new()),
                state_callback: RefCell::new(None),
                subscribe_callback: RefCell::new(None),
                stat: MemblockStat::new(),
                auth_cookie: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Starts connecting. `server` overrides the configured default; with
    /// `None` the configured server list is walked, falling back to
    /// spawning a local daemon when `spawn` hooks are supplied and
    /// autospawning is enabled.
    pub fn connect(&self, server: Option<&str>, spawn: Option<SpawnApi>) -> Result<(), ErrorCode> {
        self.inner.connect(server, spawn)
    }

    /// Orderly teardown; live streams transition to `Terminated`.
    pub fn disconnect(&self) {
        self.inner.set_state(ContextState::Terminated);
    }

    pub fn state(&self) -> ContextState {
        self.inner.state()
    }

    /// The most recent error on this connection.
    pub fn last_error(&self) -> ErrorCode {
        self.inner.last_error()
    }

    /// True for connections over UNIX sockets, loopback or a spawned
    /// daemon.
    pub fn is_local(&self) -> bool {
        self.inner.local.get()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Live-block statistics of this connection's audio buffers.
    pub fn memblock_stat(&self) -> &MemblockStat {
        &self.inner.stat
    }

    pub fn set_state_callback(&self, cb: StateCb) {
        *self.inner.state_callback.borrow_mut() = Some(cb);
    }

    /// Anything still queued or awaiting a reply?
    pub fn is_pending(&self) -> bool {
        let ps = self.inner.pstream.borrow().as_ref().is_some_and(|p| p.is_pending());
        let pd = self.inner.pdispatch.borrow().as_ref().is_some_and(|p| p.is_pending());
        ps || pd || self.inner.client.borrow().is_some()
    }

    /// Completes once nothing is queued and no reply is outstanding.
    /// Returns `None` when there is nothing to wait for.
    pub fn drain(&self, cb: Box<dyn FnOnce()>) -> Option<crate::Operation> {
        let ctx = &self.inner;
        if ctx.state() != ContextState::Ready || !self.is_pending() {
            return None;
        }
        let (Some(pstream), Some(pdispatch)) = (ctx.pstream(), ctx.pdispatch()) else {
            return None;
        };

        let op = OperationInner::start(ctx);
        let user = Rc::new(RefCell::new(Some(cb)));

        let hook = |ctx: &Rc<ContextInner>| {
            let weak = Rc::downgrade(ctx);
            let op = Rc::clone(&op);
            let user = Rc::clone(&user);
            Box::new(move || {
                let Some(ctx) = weak.upgrade() else { return };
                let (Some(ps), Some(pd)) = (ctx.pstream(), ctx.pdispatch()) else { return };
                if ps.is_pending() || pd.is_pending() {
                    return;
                }
                ps.set_drain_callback(None);
                pd.set_drain_callback(None);
                if op.is_running() {
                    if let Some(cb) = user.borrow_mut().take() {
                        cb();
                    }
                }
                op.done();
            }) as Box<dyn FnMut()>
        };

        pstream.set_drain_callback(Some(hook(ctx)));
        pdispatch.set_drain_callback(Some(hook(ctx)));

        Some(crate::Operation::new(op))
    }

    /// Tells the daemon to exit. Fire-and-forget: no reply is expected.
    pub fn exit_daemon(&self) -> Result<(), ErrorCode> {
        self.inner.ensure_ready()?;
        let Some(pstream) = self.inner.pstream() else {
            return Err(ErrorCode::ConnectionTerminated);
        };
        let mut w = TagstructWriter::new();
        w.put_u32(Command::Exit as u32);
        w.put_u32(self.inner.next_tag());
        pstream.send_tagstruct(w);
        Ok(())
    }

    pub fn set_default_sink(
        &self,
        name: &str,
        cb: Option<AckCb>,
    ) -> Result<crate::Operation, ErrorCode> {
        self.ack_request(Command::SetDefaultSink, |w| w.put_string(Some(name)), cb)
    }

    pub fn set_default_source(
        &self,
        name: &str,
        cb: Option<AckCb>,
    ) -> Result<crate::Operation, ErrorCode> {
        self.ack_request(Command::SetDefaultSource, |w| w.put_string(Some(name)), cb)
    }

    /// Issues `command` and completes the operation on the bare
    /// acknowledgment.
    pub(crate) fn ack_request(
        &self,
        command: Command,
        fields: impl FnOnce(&mut TagstructWriter),
        cb: Option<AckCb>,
    ) -> Result<crate::Operation, ErrorCode> {
        let ctx = &self.inner;
        ctx.ensure_ready()?;
        let op = OperationInner::start(ctx);
        let reply = ctx.ack_reply(Rc::clone(&op), cb);
        ctx.request(command, ctx.reply_timeout(), ctx.owner_token(), fields, reply)?;
        Ok(crate::Operation::new(op))
    }
}
