pub type ChannelId = u8;

pub const TIME_SYNC_UNRELIABLE: ChannelId = 0;
pub const AUTO_SYNC_RELIABLE: ChannelId = 1;
pub const AUTO_SYNC_UNRELIABLE: ChannelId = 2;
pub const CUSTOM_SERIALIZATION_RELIABLE: ChannelId = 3;
pub const CUSTOM_SERIALIZATION_UNRELIABLE: ChannelId = 4;
pub const EVENT_SINGLES_RELIABLE: ChannelId = 5;
pub const EVENT_SINGLES_UNRELIABLE: ChannelId = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosType {
    ReliableOrdered,
    ReliableUnordered,
    Unreliable,
}

impl QosType {
    pub fn is_reliable(self) -> bool {
        !matches!(self, QosType::Unreliable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: &'static str,
    pub qos: QosType,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is already registered")]
    Duplicate(ChannelId),
}

/// Maps a channel id to its delivery policy.
pub trait ChannelRegistry: Send + Sync {
    fn qos(&self, channel: ChannelId) -> Option<QosType>;
}

#[derive(Debug, Clone)]
pub struct ChannelTable {
    channels: Vec<Option<Channel>>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        let mut table = Self::empty();
        let defaults = [
            (TIME_SYNC_UNRELIABLE, "time_sync", QosType::Unreliable),
            (AUTO_SYNC_RELIABLE, "auto_sync", QosType::ReliableOrdered),
            (AUTO_SYNC_UNRELIABLE, "auto_sync_unreliable", QosType::Unreliable),
            (CUSTOM_SERIALIZATION_RELIABLE, "custom", QosType::ReliableOrdered),
            (CUSTOM_SERIALIZATION_UNRELIABLE, "custom_unreliable", QosType::Unreliable),
            (EVENT_SINGLES_RELIABLE, "events", QosType::ReliableOrdered),
            (EVENT_SINGLES_UNRELIABLE, "events_unreliable", QosType::Unreliable),
        ];
        for (id, name, qos) in defaults {
            table.channels[id as usize] = Some(Channel { id, name, qos });
        }
        table
    }
}

impl ChannelTable {
    pub fn empty() -> Self {
        Self {
            channels: vec![None; ChannelId::MAX as usize + 1],
        }
    }

    pub fn register(
        &mut self,
        id: ChannelId,
        name: &'static str,
        qos: QosType,
    ) -> Result<(), ChannelError> {
        let slot = &mut self.channels[id as usize];
        if slot.is_some() {
            return Err(ChannelError::Duplicate(id));
        }
        *slot = Some(Channel { id, name, qos });
        Ok(())
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels[id as usize].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().flatten()
    }
}

impl ChannelRegistry for ChannelTable {
    fn qos(&self, channel: ChannelId) -> Option<QosType> {
        self.get(channel).map(|c| c.qos)
    }
}
