mod api;
pub mod cpulimit;
mod external;
mod poll;
mod registry;
pub mod signal;

pub use api::{
    Api, DeferEvent, DeferEventCb, DeferEventImpl, DestroyCb, IoEvent, IoEventCb, IoEventImpl,
    IoEvents, MainloopApi, TimeEvent, TimeEventCb, TimeEventImpl, once,
};
pub use external::ExternalMainloop;
pub use poll::{Iterate, Mainloop};
