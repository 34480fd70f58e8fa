use super::{CodecRef, PTS_UNSET, StreamKind};
use bytes::Bytes;

/// Commands carried in a queue's control lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCmd {
    /// Queue was flushed; `seek` is set when a reposition caused it
    Flush { seek: bool },
    Pause,
    Play,
    /// Consumer thread should exit
    Exit,
}

/// Data-type tag of a media buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    Audio,
    Video,
    Subtitle,
    DvdSpu,
    Control(ControlCmd),
}

impl BufferType {
    pub fn stream_kind(self) -> Option<StreamKind> {
        match self {
            BufferType::Audio => Some(StreamKind::Audio),
            BufferType::Video => Some(StreamKind::Video),
            BufferType::Subtitle | BufferType::DvdSpu => Some(StreamKind::Subtitle),
            BufferType::Control(_) => None,
        }
    }
}

/// Delivery policy around seeks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkipMode {
    /// Deliver normally
    #[default]
    Deliver,
    /// Decode for state only, never present, never touch the clock
    Discard,
    /// First buffer at or past the seek target; clock driving resumes here
    Resume,
}

impl SkipMode {
    pub fn as_u8(self) -> u8 {
        match self {
            SkipMode::Deliver => 0,
            SkipMode::Discard => 1,
            SkipMode::Resume => 2,
        }
    }
}

/// Output-routing hints for the consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputHints {
    pub audio_rate: Option<u32>,
    pub audio_channels: Option<u16>,
    pub aspect_override: Option<u32>,
}

/// A timestamped chunk of encoded (or raw) data moving from producer to consumer.
///
/// The buffer owns its payload and a strong reference to the codec wrapper
/// that can decode it. Dropping the buffer releases both.
#[derive(Debug)]
pub struct MediaBuffer {
    pub data_type: BufferType,
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub stream: i32,
    pub drive_clock: bool,
    pub skip: SkipMode,
    pub keyframe: bool,
    pub codec: Option<CodecRef>,
    pub hints: OutputHints,
    /// Pipe epoch at enqueue time
    pub epoch: u32,
    /// Position relative to the start of the source, for display
    pub user_time: i64,
}

impl MediaBuffer {
    /// Allocate a data buffer. Timestamps must already be in microseconds.
    pub fn alloc(
        data_type: BufferType,
        data: Bytes,
        pts: i64,
        dts: i64,
        duration: i64,
        codec: Option<CodecRef>,
    ) -> Self {
        Self {
            data_type,
            data,
            pts,
            dts,
            duration,
            stream: 0,
            drive_clock: false,
            skip: SkipMode::Deliver,
            keyframe: false,
            codec,
            hints: OutputHints::default(),
            epoch: 0,
            user_time: PTS_UNSET,
        }
    }

    pub fn control(cmd: ControlCmd) -> Self {
        Self::alloc(BufferType::Control(cmd), Bytes::new(), PTS_UNSET, PTS_UNSET, 0, None)
    }

    pub fn with_stream(mut self, stream: i32) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_drive_clock(mut self, drive: bool) -> Self {
        self.drive_clock = drive;
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn control_cmd(&self) -> Option<ControlCmd> {
        match self.data_type {
            BufferType::Control(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        self.control_cmd().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CodecId, CodecWrapper};
    use std::sync::Arc;

    #[test]
    fn test_buffer_releases_codec_on_drop() {
        let codec = CodecWrapper::create(CodecId::Pcm16, StreamKind::Audio, None);
        let buf = MediaBuffer::alloc(
            BufferType::Audio,
            Bytes::from_static(&[0u8; 16]),
            0,
            0,
            1000,
            Some(codec.clone()),
        );
        assert_eq!(Arc::strong_count(&codec), 2);
        assert_eq!(buf.size(), 16);
        drop(buf);
        assert_eq!(Arc::strong_count(&codec), 1);
    }

    #[test]
    fn test_control_buffer() {
        let buf = MediaBuffer::control(ControlCmd::Flush { seek: true });
        assert!(buf.is_control());
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.data_type.stream_kind(), None);
    }
}
