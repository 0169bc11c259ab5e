//! Routes received control packets and tracks in-flight calls.
//!
//! Every request carries a tag; the matching reply (or error) carries the
//! same tag back. A pending reply is registered together with a deadline;
//! if the deadline fires first, the waiter receives the synthetic
//! [`Command::Timeout`] pseudo-command instead of wire data. Commands that
//! are not replies dispatch through the command table built at
//! construction.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use chorus_loop::{Api, TimeEvent};
use chorus_timing::{MicroSeconds, Timeval};
use chorus_wire::{Command, Packet, TagstructError, TagstructReader};
use thiserror::Error;
use tracing::{debug, warn};

/// Token identifying who registered a pending reply, so a dying stream or
/// context can drop everything it still has in flight.
pub type ReplyOwner = usize;

pub type CommandHandler = Box<dyn FnMut(Command, u32, &mut TagstructReader<'_>)>;

/// Invoked exactly once: with `Reply`/`Error` and the reply body, or with
/// the synthetic `Timeout` and no body.
pub type ReplyCallback = Box<dyn FnOnce(Command, u32, Option<&mut TagstructReader<'_>>)>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("malformed control packet")]
    Malformed(#[from] TagstructError),
    #[error("unknown command id {0}")]
    UnknownCommand(u32),
    #[error("no handler for command {0}")]
    Unhandled(Command),
}

struct ReplyInfo {
    tag: u32,
    owner: ReplyOwner,
    time_event: TimeEvent,
    cb: ReplyCallback,
}

struct PdispatchInner {
    api: Api,
    handlers: RefCell<HashMap<Command, CommandHandler>>,
    replies: RefCell<Vec<ReplyInfo>>,
    drain_cb: RefCell<Option<Box<dyn FnMut()>>>,
}

impl PdispatchInner {
    fn take_by_tag(&self, tag: u32) -> Option<ReplyInfo> {
        let mut replies = self.replies.borrow_mut();
        let at = replies.iter().position(|r| r.tag == tag)?;
        Some(replies.remove(at))
    }

    fn maybe_drain(&self) {
        if self.replies.borrow().is_empty() {
            if let Some(cb) = self.drain_cb.borrow_mut().as_mut() {
                cb();
            }
        }
    }

    fn timeout(self: &Rc<Self>, tag: u32) {
        // Hold the dispatcher across the callback; it may drop every
        // other reference.
        let _guard = Rc::clone(self);
        if let Some(info) = self.take_by_tag(tag) {
            debug!(tag, "reply deadline expired");
            (info.cb)(Command::Timeout, tag, None);
            self.maybe_drain();
        }
    }
}

/// Reference-counted dispatcher handle.
#[derive(Clone)]
pub struct Pdispatch {
    inner: Rc<PdispatchInner>,
}

impl Pdispatch {
    /// `table` maps server-initiated commands to their handlers.
    pub fn new(api: &Api, table: Vec<(Command, CommandHandler)>) -> Self {
        Self {
            inner: Rc::new(PdispatchInner {
                api: Api::clone(api),
                handlers: RefCell::new(table.into_iter().collect()),
                replies: RefCell::new(Vec::new()),
                drain_cb: RefCell::new(None),
            }),
        }
    }

    /// Routes one received control packet.
    ///
    /// `Error`/`Reply` consume the pending reply with the same tag (a reply
    /// nobody waits for is dropped silently); everything else dispatches on
    /// the command table. An unknown or unhandled command is an error the
    /// caller must treat as a protocol violation.
    pub fn run(&self, packet: &Packet) -> Result<(), DispatchError> {
        let _guard = Rc::clone(&self.inner);

        let mut ts = TagstructReader::new(packet.data());
        let command_id = ts.get_u32()?;
        let tag = ts.get_u32()?;
        let Some(command) = Command::from_repr(command_id) else {
            warn!(command_id, "received unknown command");
            return Err(DispatchError::UnknownCommand(command_id));
        };

        if matches!(command, Command::Error | Command::Reply) {
            if let Some(info) = self.inner.take_by_tag(tag) {
                info.time_event.free();
                (info.cb)(command, tag, Some(&mut ts));
                self.inner.maybe_drain();
            } else {
                debug!(tag, "reply for unknown or cancelled tag, dropping");
            }
            return Ok(());
        }

        // The handler is taken out of the table for the duration of the
        // call so it may itself run the dispatcher.
        let handler = self.inner.handlers.borrow_mut().remove(&command);
        match handler {
            Some(mut h) => {
                h(command, tag, &mut ts);
                self.inner.handlers.borrow_mut().entry(command).or_insert(h);
                Ok(())
            }
            None => {
                warn!(%command, "received command without handler");
                Err(DispatchError::Unhandled(command))
            }
        }
    }

    /// Registers the continuation for the request sent under `tag` and arms
    /// its deadline.
    pub fn register_reply(
        &self,
        tag: u32,
        timeout: MicroSeconds,
        owner: ReplyOwner,
        cb: ReplyCallback,
    ) {
        let weak = Rc::downgrade(&self.inner);
        let time_event = self.inner.api.time_new(
            Timeval::now().add_usec(timeout),
            Box::new(move |e, _| {
                e.free();
                if let Some(inner) = weak.upgrade() {
                    inner.timeout(tag);
                }
            }),
        );
        self.inner.replies.borrow_mut().push(ReplyInfo { tag, owner, time_event, cb });
    }

    /// Silently drops every pending reply registered under `owner`.
    pub fn unregister_replies(&self, owner: ReplyOwner) {
        let mut dropped = Vec::new();
        self.inner.replies.borrow_mut().retain(|r| {
            if r.owner == owner {
                dropped.push(r.time_event.clone());
                false
            } else {
                true
            }
        });
        for te in dropped {
            te.free();
        }
        self.inner.maybe_drain();
    }

    /// Completes every pending reply with the synthetic `Timeout`; used
    /// when the transport underneath is gone.
    pub fn fail_all(&self) {
        let _guard = Rc::clone(&self.inner);
        let pending: Vec<ReplyInfo> = self.inner.replies.borrow_mut().drain(..).collect();
        for info in pending {
            info.time_event.free();
            (info.cb)(Command::Timeout, info.tag, None);
        }
        self.inner.maybe_drain();
    }

    pub fn is_pending(&self) -> bool {
        !self.inner.replies.borrow().is_empty()
    }

    /// `cb` fires whenever the pending list goes (or is found) empty.
    pub fn set_drain_callback(&self, cb: Option<Box<dyn FnMut()>>) {
        *self.inner.drain_cb.borrow_mut() = cb;
    }
}
