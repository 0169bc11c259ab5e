mod channelmap;
mod command;
mod frame;
mod memblock;
mod memblockq;
mod packet;
mod sample;
mod tagstruct;
mod volume;

pub use channelmap::{CHANNELS_MAX, ChannelMap, ChannelPosition};
pub use command::{Command, ErrorCode};
pub use frame::{CHANNEL_CONTROL, DESCRIPTOR_SIZE, FRAME_SIZE_MAX, FrameDescriptor};
pub use memblock::{Memblock, MemblockStat, Memchunk};
pub use memblockq::Memblockq;
pub use packet::{PACKET_SIZE_MAX, Packet};
pub use sample::{SampleFormat, SampleSpec};
pub use tagstruct::{TagstructError, TagstructReader, TagstructWriter};
pub use volume::{ChannelVolumes, VOLUME_MUTED, VOLUME_NORM, Volume};
