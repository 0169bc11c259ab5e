use bitflags::bitflags;
use chorus_timing::{MicroSeconds, Timeval};

/// An invalid server-side object index.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Connection lifecycle of a [`Context`](crate::Context).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Unconnected,
    Connecting,
    Authorizing,
    SettingName,
    Ready,
    Failed,
    Terminated,
}

impl ContextState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// Lifecycle of a [`Stream`](crate::Stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Creating,
    Ready,
    Failed,
    Terminated,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// Lifecycle of an [`Operation`](crate::Operation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Running,
    Done,
    Cancelled,
}

/// What a stream carries and which way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Playback,
    Record,
    Upload,
}

bitflags! {
    /// Stream creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamFlags: u32 {
        /// Create the stream corked; playback starts only after an
        /// explicit uncork.
        const START_CORKED = 1;
        /// Keep a latency snapshot fresh in the background so
        /// interpolated time queries need no round trip.
        const INTERPOLATE_LATENCY = 2;
    }
}

/// Buffer watermarks governing a stream's flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAttr {
    /// Hard cap on the server-side buffer.
    pub maxlength: u32,
    /// Playback: fill level the server keeps topped up.
    pub tlength: u32,
    /// Playback: fill required before playback starts.
    pub prebuf: u32,
    /// Playback: smallest refill the server will request.
    pub minreq: u32,
    /// Record: block size the server delivers.
    pub fragsize: u32,
}

impl Default for BufferAttr {
    fn default() -> Self {
        Self {
            maxlength: 160 * 1024,
            tlength: 10 * 1024,
            prebuf: 8 * 1024,
            minreq: 1024,
            fragsize: 8 * 1024,
        }
    }
}

/// One latency measurement, as returned by
/// [`Stream::get_latency_info`](crate::Stream::get_latency_info).
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyInfo {
    /// Playback time of the current server-side buffer.
    pub buffer_usec: MicroSeconds,
    /// Time a sample takes to be played on the sink.
    pub sink_usec: MicroSeconds,
    /// Time a recorded sample takes to reach the application.
    pub source_usec: MicroSeconds,
    /// Estimated one-way transport time to or from the server.
    pub transport_usec: MicroSeconds,
    /// Whether the stream is currently playing.
    pub playing: bool,
    /// Server-side queue size in bytes.
    pub queue_length: u32,
    /// Whether the two clocks looked synchronized; when false,
    /// `transport_usec` is a half-round-trip estimate.
    pub synchronized_clocks: bool,
    /// When this measurement was current.
    pub timestamp: Timeval,
    /// The write counter echoed by the server.
    pub counter: u64,
}

/// Hooks around the fork used for daemon autospawning. The at-fork hook
/// runs in the child between fork and exec, so it is restricted to
/// async-signal-safe work; plain function pointers keep that temptation
/// low.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnApi {
    pub prefork: Option<fn()>,
    pub postfork: Option<fn()>,
    pub atfork: Option<fn()>,
}

/// One step of a streamed enumeration reply.
#[derive(Debug)]
pub enum ListResult<'a, T> {
    /// The next entry.
    Item(&'a T),
    /// End of the list; no further callbacks follow.
    End,
    /// The server answered with an error; no further callbacks follow.
    Error,
}
