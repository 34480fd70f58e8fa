//! Control events delivered to a producer through its media pipe

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Absolute seek, microseconds
    Seek(i64),
    Play,
    Pause,
    PlayPause,
    Stop,
    Prev,
    Next,
    RestartTrack,
    SeekForward,
    SeekBackward,
    SeekFastForward,
    SeekFastBackward,
    SelectAudioTrack(i32),
    SelectSubtitleTrack(i32),
    /// Jump to another playqueue entry, identified by its descriptor
    PlayqueueJump(Arc<str>),
    Eof,
    /// Pause requested by the pipeline itself, with a reason for the user
    InternalPause(String),
    MpNoLongerPrimary,
    MpIsPrimary,
    /// Hold state of the pipe changed
    Hold(bool),
    Eject,
}

/// Discriminant used for queue deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Seek,
    Play,
    Pause,
    PlayPause,
    Stop,
    Prev,
    Next,
    RestartTrack,
    SeekForward,
    SeekBackward,
    SeekFastForward,
    SeekFastBackward,
    SelectAudioTrack,
    SelectSubtitleTrack,
    PlayqueueJump,
    Eof,
    InternalPause,
    MpNoLongerPrimary,
    MpIsPrimary,
    Hold,
    Eject,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Seek(_) => EventKind::Seek,
            Event::Play => EventKind::Play,
            Event::Pause => EventKind::Pause,
            Event::PlayPause => EventKind::PlayPause,
            Event::Stop => EventKind::Stop,
            Event::Prev => EventKind::Prev,
            Event::Next => EventKind::Next,
            Event::RestartTrack => EventKind::RestartTrack,
            Event::SeekForward => EventKind::SeekForward,
            Event::SeekBackward => EventKind::SeekBackward,
            Event::SeekFastForward => EventKind::SeekFastForward,
            Event::SeekFastBackward => EventKind::SeekFastBackward,
            Event::SelectAudioTrack(_) => EventKind::SelectAudioTrack,
            Event::SelectSubtitleTrack(_) => EventKind::SelectSubtitleTrack,
            Event::PlayqueueJump(_) => EventKind::PlayqueueJump,
            Event::Eof => EventKind::Eof,
            Event::InternalPause(_) => EventKind::InternalPause,
            Event::MpNoLongerPrimary => EventKind::MpNoLongerPrimary,
            Event::MpIsPrimary => EventKind::MpIsPrimary,
            Event::Hold(_) => EventKind::Hold,
            Event::Eject => EventKind::Eject,
        }
    }

    /// Events that replace an older pending event of the same kind
    pub(crate) fn replaces_pending(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::SelectAudioTrack
                | EventKind::SelectSubtitleTrack
                | EventKind::PlayqueueJump
        )
    }

    /// Events that end the current producer session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Stop | Event::Prev | Event::Next | Event::PlayqueueJump(_) | Event::Eject
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Seek(ts) => write!(f, "seek({:.3}s)", *ts as f64 / 1e6),
            Event::SelectAudioTrack(id) => write!(f, "select-audio({id})"),
            Event::SelectSubtitleTrack(id) => write!(f, "select-subtitle({id})"),
            Event::PlayqueueJump(url) => write!(f, "jump({url})"),
            Event::InternalPause(msg) => write!(f, "internal-pause({msg})"),
            Event::Hold(on) => write!(f, "hold({on})"),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}
