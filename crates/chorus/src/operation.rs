use std::{
    cell::Cell,
    rc::{Rc, Weak},
};

use crate::{context::ContextInner, types::OperationState};

#[derive(Debug)]
pub(crate) struct OperationInner {
    context: Weak<ContextInner>,
    state: Cell<OperationState>,
}

impl OperationInner {
    /// Creates a running operation and links it into the context's live
    /// list; the context holds the strong reference until the operation
    /// reaches a terminal state.
    pub(crate) fn start(ctx: &Rc<ContextInner>) -> Rc<Self> {
        let op = Rc::new(Self {
            context: Rc::downgrade(ctx),
            state: Cell::new(OperationState::Running),
        });
        ctx.operations.borrow_mut().push(Rc::clone(&op));
        op
    }

    pub(crate) fn state(&self) -> OperationState {
        self.state.get()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.get() == OperationState::Running
    }

    fn finish(&self, state: OperationState) {
        if !self.is_running() {
            return;
        }
        self.state.set(state);
        if let Some(ctx) = self.context.upgrade() {
            ctx.operations.borrow_mut().retain(|o| !std::ptr::eq(Rc::as_ptr(o), self));
        }
    }

    pub(crate) fn done(&self) {
        self.finish(OperationState::Done);
    }

    pub(crate) fn cancel(&self) {
        self.finish(OperationState::Cancelled);
    }
}

/// Handle to an in-flight request.
///
/// The handle only observes and cancels; the reply continuation lives with
/// the dispatcher. Cancelling detaches the user callback (it will never
/// fire) but tells the peer nothing; the request still runs to completion
/// server-side.
#[derive(Debug, Clone)]
pub struct Operation {
    pub(crate) inner: Rc<OperationInner>,
}

impl Operation {
    pub(crate) fn new(inner: Rc<OperationInner>) -> Self {
        Self { inner }
    }

    pub fn state(&self) -> OperationState {
        self.inner.state()
    }

    /// A cancel after completion is a no-op, as is completion after cancel.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}
