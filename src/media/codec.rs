//! Reference-counted codec handles.
//!
//! The pipeline never looks inside a codec. A [`CodecWrapper`] only carries
//! the identity of the stream it decodes and, for audio, an optional decoder
//! the output stage can drive. Buffers hold a [`CodecRef`], so a wrapper
//! replaced by the producer stays alive until the last buffer using it is
//! dropped.

use super::StreamKind;
use crate::audio::decoder::{AudioDecoder, DecodedAudio};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

pub type CodecRef = Arc<CodecWrapper>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    Pcm16,
    Lpcm,
    Mp2,
    Mp3,
    Aac,
    Ac3,
    Dts,
    Flac,
    Vorbis,
    Opus,
    Mpeg2Video,
    H264,
    DvdSubtitle,
    Other(u32),
}

/// Stream parameters known at open time
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CodecParams {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    /// Nominal frame duration in microseconds (video)
    pub frame_duration: Option<i64>,
}

/// Demuxer context shared by every codec opened from the same source
#[derive(Debug)]
pub struct FormatContext {
    pub name: String,
    pub start_time: i64,
    pub duration: Option<i64>,
}

impl FormatContext {
    pub fn new(name: impl Into<String>, start_time: i64, duration: Option<i64>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            start_time,
            duration,
        })
    }
}

pub struct CodecWrapper {
    id: CodecId,
    kind: StreamKind,
    params: CodecParams,
    format: Option<Arc<FormatContext>>,
    decoder: Mutex<Option<Box<dyn AudioDecoder>>>,
}

impl CodecWrapper {
    /// Create a wrapper without an attached decoder
    pub fn create(id: CodecId, kind: StreamKind, format: Option<Arc<FormatContext>>) -> CodecRef {
        Self::with_params(id, kind, format, CodecParams::default())
    }

    pub fn with_params(
        id: CodecId,
        kind: StreamKind,
        format: Option<Arc<FormatContext>>,
        params: CodecParams,
    ) -> CodecRef {
        Arc::new(Self {
            id,
            kind,
            params,
            format,
            decoder: Mutex::new(None),
        })
    }

    /// Create a wrapper that owns an audio decoder
    pub fn with_decoder(
        id: CodecId,
        format: Option<Arc<FormatContext>>,
        params: CodecParams,
        decoder: Box<dyn AudioDecoder>,
    ) -> CodecRef {
        Arc::new(Self {
            id,
            kind: StreamKind::Audio,
            params,
            format,
            decoder: Mutex::new(Some(decoder)),
        })
    }

    pub fn id(&self) -> CodecId {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn params(&self) -> &CodecParams {
        &self.params
    }

    pub fn format(&self) -> Option<&Arc<FormatContext>> {
        self.format.as_ref()
    }

    pub fn has_decoder(&self) -> bool {
        self.decoder.lock().is_some()
    }

    /// Decode one encoded packet. The decoder lock is held for the call.
    pub fn decode_audio(&self, data: &[u8], pts: i64) -> Result<Option<DecodedAudio>> {
        let mut guard = self.decoder.lock();
        let decoder = guard
            .as_mut()
            .ok_or_else(|| anyhow!("No decoder attached to {:?}", self.id))?;
        decoder.decode(data, pts)
    }

    /// Drop decoder state after a discontinuity
    pub fn flush(&self) {
        if let Some(decoder) = self.decoder.lock().as_mut() {
            decoder.reset();
        }
    }
}

impl fmt::Debug for CodecWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecWrapper")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("params", &self.params)
            .field("format", &self.format.as_ref().map(|fc| fc.name.as_str()))
            .finish()
    }
}
