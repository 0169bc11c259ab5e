mod dispatch;
mod iochannel;
mod ioline;
mod pstream;
mod socket_client;

pub use dispatch::{CommandHandler, DispatchError, Pdispatch, ReplyCallback, ReplyOwner};
pub use iochannel::IoChannel;
pub use ioline::IoLine;
pub use pstream::Pstream;
pub use socket_client::SocketClient;
