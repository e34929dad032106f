use super::channel::ChannelId;

pub const FRAME_HEADER_LEN: usize = 5;

pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;
pub const SAFE_RELIABLE_PAYLOAD: usize = 12 * 1024;
pub const PERFORMANCE_WARN_PAYLOAD: usize = 10 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes is shorter than its header")]
    Truncated(usize),
    #[error("frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// `[channel: u8][length: u32 LE]`; `length` counts the payload bytes as
/// they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel: ChannelId,
    pub length: u32,
}

impl FrameHeader {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.channel);
        out.extend_from_slice(&self.length.to_le_bytes());
    }

    pub fn parse(frame: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated(frame.len()));
        }
        let channel = frame[0];
        let length = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let payload = &frame[FRAME_HEADER_LEN..];

        if payload.len() != length as usize {
            return Err(FrameError::LengthMismatch {
                declared: length as usize,
                actual: payload.len(),
            });
        }
        Ok((FrameHeader { channel, length }, payload))
    }
}
