use strum::{Display, FromRepr};

/// Commands of the native control protocol, shared by both peers.
///
/// A control frame's payload starts with two u32s: the command id and the
/// command tag. Replies reuse the tag of the request. `Timeout` never
/// appears on the wire; the dispatcher synthesizes it for a reply whose
/// deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display)]
#[repr(u32)]
pub enum Command {
    Error = 0,
    Timeout = 1,
    Reply = 2,

    // client -> server
    CreatePlaybackStream = 3,
    DeletePlaybackStream = 4,
    CreateRecordStream = 5,
    DeleteRecordStream = 6,
    Exit = 7,
    Auth = 8,
    SetClientName = 9,
    LookupSink = 10,
    LookupSource = 11,
    DrainPlaybackStream = 12,
    Stat = 13,
    GetPlaybackLatency = 14,
    CreateUploadStream = 15,
    DeleteUploadStream = 16,
    FinishUploadStream = 17,
    PlaySample = 18,
    RemoveSample = 19,

    GetServerInfo = 20,
    GetSinkInfo = 21,
    GetSinkInfoList = 22,
    GetSourceInfo = 23,
    GetSourceInfoList = 24,
    GetModuleInfo = 25,
    GetModuleInfoList = 26,
    GetClientInfo = 27,
    GetClientInfoList = 28,
    GetSinkInputInfo = 29,
    GetSinkInputInfoList = 30,
    GetSourceOutputInfo = 31,
    GetSourceOutputInfoList = 32,
    GetSampleInfo = 33,
    GetSampleInfoList = 34,
    Subscribe = 35,

    SetSinkVolume = 36,
    SetSinkInputVolume = 37,
    SetSourceVolume = 38,

    SetSinkMute = 39,
    SetSourceMute = 40,

    CorkPlaybackStream = 41,
    FlushPlaybackStream = 42,
    TriggerPlaybackStream = 43,

    SetDefaultSink = 44,
    SetDefaultSource = 45,

    SetPlaybackStreamName = 46,
    SetRecordStreamName = 47,

    KillClient = 48,
    KillSinkInput = 49,
    KillSourceOutput = 50,

    LoadModule = 51,
    UnloadModule = 52,

    AddAutoload = 53,
    RemoveAutoload = 54,
    GetAutoloadInfo = 55,
    GetAutoloadInfoList = 56,

    GetRecordLatency = 57,
    CorkRecordStream = 58,
    FlushRecordStream = 59,
    PrebufPlaybackStream = 60,

    // server -> client
    Request = 61,
    Overflow = 62,
    Underflow = 63,
    PlaybackStreamKilled = 64,
    RecordStreamKilled = 65,
    SubscribeEvent = 66,
}

/// Protocol error codes, carried in `Error` replies and cached as a
/// context's last error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display, Default)]
#[repr(u32)]
pub enum ErrorCode {
    #[default]
    Ok = 0,
    Access = 1,
    Command = 2,
    Invalid = 3,
    Exist = 4,
    NoEntity = 5,
    ConnectionRefused = 6,
    Protocol = 7,
    Timeout = 8,
    AuthKey = 9,
    Internal = 10,
    ConnectionTerminated = 11,
    Killed = 12,
    InvalidServer = 13,
    InitFailed = 14,
}

impl ErrorCode {
    pub fn description(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Access => "access denied",
            Self::Command => "unknown command",
            Self::Invalid => "invalid argument",
            Self::Exist => "entity exists",
            Self::NoEntity => "no such entity",
            Self::ConnectionRefused => "connection refused",
            Self::Protocol => "protocol error",
            Self::Timeout => "timeout",
            Self::AuthKey => "no authorization key",
            Self::Internal => "internal error",
            Self::ConnectionTerminated => "connection terminated",
            Self::Killed => "entity killed",
            Self::InvalidServer => "invalid server",
            Self::InitFailed => "module initialization failed",
        }
    }
}

impl std::error::Error for ErrorCode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_numbering_is_stable() {
        assert_eq!(Command::Error as u32, 0);
        assert_eq!(Command::Auth as u32, 8);
        assert_eq!(Command::Subscribe as u32, 35);
        assert_eq!(Command::Request as u32, 61);
        assert_eq!(Command::SubscribeEvent as u32, 66);
        assert_eq!(Command::from_repr(61), Some(Command::Request));
        assert_eq!(Command::from_repr(1000), None);
    }

    #[test]
    fn error_codes_round_trip() {
        assert_eq!(ErrorCode::from_repr(12), Some(ErrorCode::Killed));
        assert_eq!(ErrorCode::from_repr(15), None);
    }
}
