use strum::{Display, FromRepr};

pub const CHANNELS_MAX: usize = 16;

/// Speaker position a channel is mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
#[repr(u8)]
pub enum ChannelPosition {
    Mono = 0,
    FrontLeft = 1,
    FrontRight = 2,
    FrontCenter = 3,
    RearCenter = 4,
    RearLeft = 5,
    RearRight = 6,
    Lfe = 7,
    FrontLeftOfCenter = 8,
    FrontRightOfCenter = 9,
    SideLeft = 10,
    SideRight = 11,
    Aux0 = 12,
    Aux1 = 13,
    Aux2 = 14,
    Aux3 = 15,
}

/// Mapping from channel index to speaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    channels: u8,
    map: [ChannelPosition; CHANNELS_MAX],
}

impl ChannelMap {
    /// A conventional mapping for `channels` channels: mono for one,
    /// left/right for two, positions in enum order beyond that.
    pub fn default_for(channels: u8) -> Self {
        debug_assert!(channels > 0 && usize::from(channels) <= CHANNELS_MAX);
        let mut map = [ChannelPosition::Mono; CHANNELS_MAX];
        match channels {
            1 => {}
            2 => {
                map[0] = ChannelPosition::FrontLeft;
                map[1] = ChannelPosition::FrontRight;
            }
            n => {
                for (i, slot) in map.iter_mut().take(usize::from(n)).enumerate() {
                    *slot = ChannelPosition::from_repr(1 + i as u8)
                        .unwrap_or(ChannelPosition::Aux3);
                }
            }
        }
        Self { channels, map }
    }

    pub fn from_positions(positions: &[ChannelPosition]) -> Option<Self> {
        if positions.is_empty() || positions.len() > CHANNELS_MAX {
            return None;
        }
        let mut map = [ChannelPosition::Mono; CHANNELS_MAX];
        map[..positions.len()].copy_from_slice(positions);
        Some(Self { channels: positions.len() as u8, map })
    }

    pub fn len(&self) -> usize {
        usize::from(self.channels)
    }

    pub fn is_empty(&self) -> bool {
        self.channels == 0
    }

    pub fn positions(&self) -> &[ChannelPosition] {
        &self.map[..self.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_default() {
        let m = ChannelMap::default_for(2);
        assert_eq!(m.positions(), [ChannelPosition::FrontLeft, ChannelPosition::FrontRight]);
    }

    #[test]
    fn from_positions_bounds() {
        assert!(ChannelMap::from_positions(&[]).is_none());
        assert!(ChannelMap::from_positions(&[ChannelPosition::Mono; CHANNELS_MAX + 1]).is_none());
        let m = ChannelMap::from_positions(&[ChannelPosition::Lfe]).unwrap();
        assert_eq!(m.len(), 1);
    }
}
