//! The self-describing typed serializer used inside every control packet.
//!
//! Each field is a one-byte tag followed by its payload; integers are
//! network byte order. The reader keeps a cursor and guarantees that a
//! failed `get` leaves the cursor exactly where it was, so a decoder can
//! probe without corrupting its position. Decoders finish with
//! [`TagstructReader::expect_eof`] to prove the peer sent exactly the
//! expected fields.

use chorus_timing::{MicroSeconds, Timeval};
use thiserror::Error;

use crate::{
    channelmap::{CHANNELS_MAX, ChannelMap, ChannelPosition},
    sample::{SampleFormat, SampleSpec},
    volume::{ChannelVolumes, Volume},
};

const TAG_STRING: u8 = b't';
const TAG_NULL_STRING: u8 = b'N';
const TAG_U32: u8 = b'L';
const TAG_U8: u8 = b'B';
const TAG_U64: u8 = b'R';
const TAG_SAMPLE_SPEC: u8 = b'a';
const TAG_ARBITRARY: u8 = b'x';
const TAG_BOOLEAN_TRUE: u8 = b'1';
const TAG_BOOLEAN_FALSE: u8 = b'0';
const TAG_TIMEVAL: u8 = b'T';
const TAG_USEC: u8 = b'U';
const TAG_CHANNEL_MAP: u8 = b'm';
const TAG_CVOLUME: u8 = b'v';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TagstructError {
    #[error("unexpected end of tag-struct")]
    ShortBuffer,
    #[error("expected tag '{}', found '{}'", char::from(*expected), char::from(*found))]
    TypeMismatch { expected: u8, found: u8 },
    #[error("malformed payload: {0}")]
    Invalid(&'static str),
    #[error("trailing bytes after the final field")]
    TrailingData,
    #[error("packet of {0} bytes exceeds the control-message cap")]
    Oversized(usize),
}

/// Appends tagged fields to a growable buffer.
#[derive(Default, Debug)]
pub struct TagstructWriter {
    data: Vec<u8>,
}

impl TagstructWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_string(&mut self, s: Option<&str>) {
        match s {
            Some(s) => {
                debug_assert!(!s.as_bytes().contains(&0));
                self.data.push(TAG_STRING);
                self.data.extend_from_slice(s.as_bytes());
                self.data.push(0);
            }
            None => self.data.push(TAG_NULL_STRING),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.push(TAG_U32);
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(TAG_U8);
        self.data.push(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.push(TAG_U64);
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_sample_spec(&mut self, ss: &SampleSpec) {
        self.data.push(TAG_SAMPLE_SPEC);
        self.data.push(ss.format as u8);
        self.data.push(ss.channels);
        self.data.extend_from_slice(&ss.rate.to_be_bytes());
    }

    pub fn put_arbitrary(&mut self, bytes: &[u8]) {
        self.data.push(TAG_ARBITRARY);
        self.data.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.data.extend_from_slice(bytes);
    }

    pub fn put_boolean(&mut self, b: bool) {
        self.data.push(if b { TAG_BOOLEAN_TRUE } else { TAG_BOOLEAN_FALSE });
    }

    pub fn put_timeval(&mut self, tv: Timeval) {
        self.data.push(TAG_TIMEVAL);
        self.data.extend_from_slice(&tv.sec.to_be_bytes());
        self.data.extend_from_slice(&tv.usec.to_be_bytes());
    }

    pub fn put_usec(&mut self, us: MicroSeconds) {
        self.data.push(TAG_USEC);
        self.data.extend_from_slice(&us.0.to_be_bytes());
    }

    pub fn put_channel_map(&mut self, map: &ChannelMap) {
        self.data.push(TAG_CHANNEL_MAP);
        self.data.push(map.len() as u8);
        for p in map.positions() {
            self.data.push(*p as u8);
        }
    }

    pub fn put_cvolume(&mut self, v: &ChannelVolumes) {
        self.data.push(TAG_CVOLUME);
        self.data.push(v.len() as u8);
        for value in v.values() {
            self.data.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Cursor over a received tag-struct.
#[derive(Debug)]
pub struct TagstructReader<'a> {
    data: &'a [u8],
    rindex: usize,
}

impl<'a> TagstructReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, rindex: 0 }
    }

    fn need(&self, n: usize) -> Result<&'a [u8], TagstructError> {
        self.data.get(self.rindex..self.rindex + n).ok_or(TagstructError::ShortBuffer)
    }

    fn tagged(&self, expected: u8, payload: usize) -> Result<&'a [u8], TagstructError> {
        let buf = self.need(1 + payload)?;
        if buf[0] != expected {
            return Err(TagstructError::TypeMismatch { expected, found: buf[0] });
        }
        Ok(&buf[1..])
    }

    pub fn get_string(&mut self) -> Result<Option<&'a str>, TagstructError> {
        let tag = *self.need(1)?.first().unwrap();
        if tag == TAG_NULL_STRING {
            self.rindex += 1;
            return Ok(None);
        }
        if tag != TAG_STRING {
            return Err(TagstructError::TypeMismatch { expected: TAG_STRING, found: tag });
        }
        let rest = &self.data[self.rindex + 1..];
        let nul = rest.iter().position(|b| *b == 0).ok_or(TagstructError::ShortBuffer)?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| TagstructError::Invalid("string is not UTF-8"))?;
        self.rindex += 2 + nul;
        Ok(Some(s))
    }

    pub fn get_u32(&mut self) -> Result<u32, TagstructError> {
        let b = self.tagged(TAG_U32, 4)?;
        self.rindex += 5;
        Ok(u32::from_be_bytes(b[..4].try_into().unwrap()))
    }

    pub fn get_u8(&mut self) -> Result<u8, TagstructError> {
        let b = self.tagged(TAG_U8, 1)?;
        self.rindex += 2;
        Ok(b[0])
    }

    pub fn get_u64(&mut self) -> Result<u64, TagstructError> {
        let b = self.tagged(TAG_U64, 8)?;
        self.rindex += 9;
        Ok(u64::from_be_bytes(b[..8].try_into().unwrap()))
    }

    pub fn get_sample_spec(&mut self) -> Result<SampleSpec, TagstructError> {
        let b = self.tagged(TAG_SAMPLE_SPEC, 6)?;
        let format = SampleFormat::from_repr(b[0])
            .ok_or(TagstructError::Invalid("unknown sample format"))?;
        let ss = SampleSpec {
            format,
            channels: b[1],
            rate: u32::from_be_bytes(b[2..6].try_into().unwrap()),
        };
        if !ss.is_valid() {
            return Err(TagstructError::Invalid("sample spec out of range"));
        }
        self.rindex += 7;
        Ok(ss)
    }

    /// Reads an arbitrary-bytes field that must be exactly `length` long.
    pub fn get_arbitrary(&mut self, length: usize) -> Result<&'a [u8], TagstructError> {
        let b = self.tagged(TAG_ARBITRARY, 4 + length)?;
        let announced = u32::from_be_bytes(b[..4].try_into().unwrap()) as usize;
        if announced != length {
            return Err(TagstructError::Invalid("arbitrary field has unexpected length"));
        }
        self.rindex += 5 + length;
        Ok(&b[4..4 + length])
    }

    pub fn get_boolean(&mut self) -> Result<bool, TagstructError> {
        let tag = *self.need(1)?.first().unwrap();
        let v = match tag {
            TAG_BOOLEAN_TRUE => true,
            TAG_BOOLEAN_FALSE => false,
            found => {
                return Err(TagstructError::TypeMismatch { expected: TAG_BOOLEAN_TRUE, found });
            }
        };
        self.rindex += 1;
        Ok(v)
    }

    pub fn get_timeval(&mut self) -> Result<Timeval, TagstructError> {
        let b = self.tagged(TAG_TIMEVAL, 8)?;
        let tv = Timeval {
            sec: u32::from_be_bytes(b[..4].try_into().unwrap()),
            usec: u32::from_be_bytes(b[4..8].try_into().unwrap()),
        };
        self.rindex += 9;
        Ok(tv)
    }

    pub fn get_usec(&mut self) -> Result<MicroSeconds, TagstructError> {
        let b = self.tagged(TAG_USEC, 8)?;
        self.rindex += 9;
        Ok(MicroSeconds(u64::from_be_bytes(b[..8].try_into().unwrap())))
    }

    pub fn get_channel_map(&mut self) -> Result<ChannelMap, TagstructError> {
        let head = self.tagged(TAG_CHANNEL_MAP, 1)?;
        let channels = usize::from(head[0]);
        if channels == 0 || channels > CHANNELS_MAX {
            return Err(TagstructError::Invalid("channel map count out of range"));
        }
        let body = self.need(2 + channels)?;
        let mut positions = Vec::with_capacity(channels);
        for raw in &body[2..] {
            positions.push(
                ChannelPosition::from_repr(*raw)
                    .ok_or(TagstructError::Invalid("unknown channel position"))?,
            );
        }
        let map = ChannelMap::from_positions(&positions)
            .ok_or(TagstructError::Invalid("channel map count out of range"))?;
        self.rindex += 2 + channels;
        Ok(map)
    }

    pub fn get_cvolume(&mut self) -> Result<ChannelVolumes, TagstructError> {
        let head = self.tagged(TAG_CVOLUME, 1)?;
        let channels = usize::from(head[0]);
        if channels == 0 || channels > CHANNELS_MAX {
            return Err(TagstructError::Invalid("volume count out of range"));
        }
        let body = self.need(2 + channels * 4)?;
        let mut values = Vec::with_capacity(channels);
        for i in 0..channels {
            let at = 2 + i * 4;
            values.push(Volume::from_be_bytes(body[at..at + 4].try_into().unwrap()));
        }
        let v = ChannelVolumes::from_values(&values)
            .ok_or(TagstructError::Invalid("volume count out of range"))?;
        self.rindex += 2 + channels * 4;
        Ok(v)
    }

    pub fn eof(&self) -> bool {
        self.rindex >= self.data.len()
    }

    /// Fails unless every byte of the struct has been consumed.
    pub fn expect_eof(&self) -> Result<(), TagstructError> {
        if self.eof() { Ok(()) } else { Err(TagstructError::TrailingData) }
    }
}
