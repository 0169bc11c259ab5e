use bytes::Bytes;

use crate::tagstruct::TagstructError;

/// Hard cap on the size of one control packet.
pub const PACKET_SIZE_MAX: usize = 64 * 1024;

/// A reference-counted control message: one serialized tag-struct.
#[derive(Clone, Debug)]
pub struct Packet {
    data: Bytes,
}

impl Packet {
    pub fn from_vec(data: Vec<u8>) -> Result<Self, TagstructError> {
        Self::from_bytes(Bytes::from(data))
    }

    pub fn from_bytes(data: Bytes) -> Result<Self, TagstructError> {
        if data.len() > PACKET_SIZE_MAX {
            return Err(TagstructError::Oversized(data.len()));
        }
        Ok(Self { data })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized() {
        assert!(Packet::from_vec(vec![0; PACKET_SIZE_MAX]).is_ok());
        assert!(Packet::from_vec(vec![0; PACKET_SIZE_MAX + 1]).is_err());
    }
}
