mod timeval;
mod usec;

pub use timeval::Timeval;
pub use usec::{MicroSeconds, USEC_PER_MSEC, USEC_PER_SEC};
