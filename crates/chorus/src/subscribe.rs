//! Server event subscription: ask for change notifications on classes of
//! server objects and receive facility/operation/index triples as they
//! happen.

use std::rc::Rc;

use bitflags::bitflags;
use chorus_wire::{Command, ErrorCode};
use strum::FromRepr;

use crate::{
    context::{AckCb, SubscribeCb},
    operation::OperationInner,
    Context, Operation,
};

bitflags! {
    /// Which object classes to be notified about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubscriptionMask: u32 {
        const SINK = 1;
        const SOURCE = 2;
        const SINK_INPUT = 4;
        const SOURCE_OUTPUT = 8;
        const MODULE = 16;
        const CLIENT = 32;
        const SAMPLE_CACHE = 64;
        const SERVER = 128;
        const AUTOLOAD = 256;
    }
}

/// Object class an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum SubscriptionFacility {
    Sink = 0,
    Source = 1,
    SinkInput = 2,
    SourceOutput = 3,
    Module = 4,
    Client = 5,
    SampleCache = 6,
    Server = 7,
    Autoload = 8,
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOperation {
    New,
    Changed,
    Removed,
}

const FACILITY_MASK: u32 = 15;
const OPERATION_MASK: u32 = 48;
const OPERATION_NEW: u32 = 0;
const OPERATION_CHANGED: u32 = 16;
const OPERATION_REMOVED: u32 = 32;

/// One decoded subscription event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub facility: SubscriptionFacility,
    pub operation: SubscriptionOperation,
}

impl SubscriptionEvent {
    pub(crate) fn from_wire(v: u32) -> Option<Self> {
        let facility = SubscriptionFacility::from_repr(v & FACILITY_MASK)?;
        let operation = match v & OPERATION_MASK {
            OPERATION_NEW => SubscriptionOperation::New,
            OPERATION_CHANGED => SubscriptionOperation::Changed,
            OPERATION_REMOVED => SubscriptionOperation::Removed,
            _ => return None,
        };
        Some(Self { facility, operation })
    }

    /// Whether `mask` includes this event's facility.
    pub fn matches(&self, mask: SubscriptionMask) -> bool {
        mask.bits() & (1 << self.facility as u32) != 0
    }
}

impl Context {
    /// Selects the event classes the server should report; the events
    /// arrive through [`set_subscribe_callback`](Self::set_subscribe_callback).
    pub fn subscribe(
        &self,
        mask: SubscriptionMask,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        let ctx = &self.inner;
        ctx.ensure_ready()?;
        let op = OperationInner::start(ctx);
        let reply = ctx.ack_reply(Rc::clone(&op), cb);
        ctx.request(
            Command::Subscribe,
            ctx.reply_timeout(),
            ctx.owner_token(),
            |w| w.put_u32(mask.bits()),
            reply,
        )?;
        Ok(Operation::new(op))
    }

    pub fn set_subscribe_callback(&self, cb: SubscribeCb) {
        *self.inner.subscribe_callback.borrow_mut() = Some(cb);
    }
}
