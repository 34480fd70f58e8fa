use thiserror::Error;

pub mod buffer;
pub mod codec;
pub mod pipe;
pub mod queue;
pub mod service;
pub mod track;

pub use buffer::{BufferType, ControlCmd, MediaBuffer, OutputHints, SkipMode};
pub use codec::{CodecId, CodecParams, CodecRef, CodecWrapper, FormatContext};
pub use pipe::{BufferMode, Capabilities, HoldFlags, MediaPipe, Preempted};
pub use queue::MediaQueue;
pub use service::MediaService;
pub use track::{TrackInfo, TrackList};

/// Reserved timestamp meaning "unknown"
pub const PTS_UNSET: i64 = i64::MIN;

/// Ticks per second of the global time base (microseconds)
pub const TIME_BASE: i64 = 1_000_000;

/// Media pipeline errors
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Unable to open {0}")]
    Open(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("No backend can handle {0}")]
    NoBackend(String),

    #[error("Media pipe is shut down")]
    PipeShutdown,
}

pub type Result<T> = std::result::Result<T, MediaError>;

/// Elementary stream kinds, one queue each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
    Subtitle,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Audio, StreamKind::Video, StreamKind::Subtitle];

    pub(crate) fn index(self) -> usize {
        match self {
            StreamKind::Audio => 0,
            StreamKind::Video => 1,
            StreamKind::Subtitle => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Subtitle => "subtitle",
        }
    }
}

/// Rational time base of a source, e.g. 1/90000 for MPEG PES
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const MICROS: Rational = Rational::new(1, TIME_BASE);

    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }
}

#[inline]
pub fn pts_is_set(ts: i64) -> bool {
    ts != PTS_UNSET
}

/// Convert a timestamp in `tb` units to microseconds, keeping the sentinel intact
pub fn rescale(ts: i64, tb: Rational) -> i64 {
    if ts == PTS_UNSET {
        return PTS_UNSET;
    }
    assert!(tb.den != 0, "zero time base denominator");
    let v = ts as i128 * tb.num as i128 * TIME_BASE as i128 / tb.den as i128;
    v.clamp(i64::MIN as i128 + 1, i64::MAX as i128) as i64
}

/// Convert microseconds into `tb` units, the inverse of [`rescale`]
pub fn to_time_base(ts: i64, tb: Rational) -> i64 {
    if ts == PTS_UNSET {
        return PTS_UNSET;
    }
    assert!(tb.num != 0, "zero time base numerator");
    let v = ts as i128 * tb.den as i128 / (tb.num as i128 * TIME_BASE as i128);
    v.clamp(i64::MIN as i128 + 1, i64::MAX as i128) as i64
}

/// Offset a timestamp, panicking if the sentinel leaks into arithmetic
#[inline]
pub fn ts_offset(ts: i64, delta: i64) -> i64 {
    assert!(pts_is_set(ts), "arithmetic on unset timestamp");
    ts.saturating_add(delta)
}
