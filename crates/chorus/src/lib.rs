//! Client runtime for the chorus network sound server.
//!
//! A [`Context`] is one connection to a server, driven entirely by an event
//! loop from `chorus-loop`. Streams carry audio, operations track in-flight
//! requests, and the introspection calls enumerate server objects. The
//! [`blocking`] module wraps all of that behind a synchronous API for simple
//! tools.

pub mod authkey;
pub mod blocking;
pub mod config;
mod context;
mod operation;
mod scache;
mod stream;
pub mod subscribe;
mod types;

pub mod introspect;

pub use chorus_loop as mainloop;
pub use chorus_net as net;
pub use chorus_timing as timing;
pub use chorus_wire as wire;

pub use context::Context;
pub use operation::Operation;
pub use stream::Stream;
pub use types::{
    BufferAttr, ContextState, Direction, INVALID_INDEX, LatencyInfo, ListResult, OperationState,
    SpawnApi, StreamFlags, StreamState,
};
