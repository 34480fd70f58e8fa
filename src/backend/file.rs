use super::{Backend, strip_scheme};
use crate::audio::decoder::SymphoniaAudioDecoder;
use crate::event::Event;
use crate::media::{
    Capabilities, CodecId, CodecParams, CodecRef, CodecWrapper, FormatContext, MediaError,
    MediaPipe, Rational, Result, StreamKind, TrackInfo, TrackList, to_time_base,
};
use crate::producer::{Fetched, Producer, Source, SourceUnit};
use bytes::Bytes;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use symphonia::core::codecs::{
    CODEC_TYPE_AAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP2, CODEC_TYPE_MP3, CODEC_TYPE_NULL,
    CODEC_TYPE_OPUS, CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_VORBIS, CodecType,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo, Track};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, info, warn};

fn codec_id(codec: CodecType) -> CodecId {
    match codec {
        CODEC_TYPE_MP2 => CodecId::Mp2,
        CODEC_TYPE_MP3 => CodecId::Mp3,
        CODEC_TYPE_AAC => CodecId::Aac,
        CODEC_TYPE_FLAC => CodecId::Flac,
        CODEC_TYPE_VORBIS => CodecId::Vorbis,
        CODEC_TYPE_OPUS => CodecId::Opus,
        CODEC_TYPE_PCM_S16LE => CodecId::Pcm16,
        CODEC_TYPE_PCM_S16BE => CodecId::Lpcm,
        _ => CodecId::Other(0),
    }
}

fn codec_name(codec: CodecType) -> &'static str {
    symphonia::default::get_codecs()
        .get_codec(codec)
        .map(|d| d.short_name)
        .unwrap_or("unknown")
}

struct TrackStream {
    stream: i32,
    time_base: Rational,
    codec: CodecRef,
}

/// Demuxes anything symphonia can probe. Each decodable audio track becomes
/// one audio stream, numbered in container order.
pub struct SymphoniaSource {
    format: Box<dyn FormatReader>,
    streams: HashMap<u32, TrackStream>,
    tracks: TrackList,
    context: Arc<FormatContext>,
    /// Added to every timestamp, used to keep time monotonic across reopen
    offset: i64,
}

impl SymphoniaSource {
    /// Probe `mss` and set up a decoder per audio track
    ///
    /// # Arguments
    /// * `mss` - Input stream
    /// * `hint` - Extension or mime hint for the probe
    /// * `name` - Used in logs and as the format context name
    pub fn open(mss: MediaSourceStream, hint: &Hint, name: &str) -> Result<Self> {
        let probed = symphonia::default::get_probe()
            .format(hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| MediaError::Open(format!("{name}: {e}")))?;
        let format = probed.format;

        let audio: Vec<&Track> = format
            .tracks()
            .iter()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
            .collect();
        if audio.is_empty() {
            return Err(MediaError::Format(format!("{name}: no audio track found")));
        }

        let duration = audio.iter().find_map(|t| {
            let tb = t.codec_params.time_base?;
            let frames = t.codec_params.n_frames?;
            let time = tb.calc_time(frames);
            Some(time.seconds as i64 * 1_000_000 + (time.frac * 1e6) as i64)
        });
        let context = FormatContext::new(name, 0, duration);

        let mut streams = HashMap::new();
        let mut tracks = TrackList::new();
        for (index, track) in audio.into_iter().enumerate() {
            let params = &track.codec_params;
            let stream = index as i32;
            let id = codec_id(params.codec);
            let sample_rate = params.sample_rate.unwrap_or(44_100);
            let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);

            let codec_params = CodecParams {
                sample_rate: Some(sample_rate),
                channels: Some(channels),
                frame_duration: None,
            };
            let codec = match SymphoniaAudioDecoder::new(params, track.id) {
                Ok(decoder) => {
                    CodecWrapper::with_decoder(id, Some(context.clone()), codec_params, Box::new(decoder))
                }
                Err(e) => {
                    warn!("{}: track {} not decodable: {}", name, track.id, e);
                    CodecWrapper::with_params(id, StreamKind::Audio, Some(context.clone()), codec_params)
                }
            };

            let time_base = match params.time_base {
                Some(tb) => Rational::new(tb.numer as i64, tb.denom as i64),
                None => Rational::new(1, sample_rate as i64),
            };

            let mut info = TrackInfo::new(stream, codec_name(params.codec));
            if let Some(lang) = &track.language {
                info = info.with_language(lang.clone());
            }
            tracks.add(StreamKind::Audio, info);
            streams.insert(
                track.id,
                TrackStream {
                    stream,
                    time_base,
                    codec,
                },
            );
        }

        info!(
            "{}: {} audio track(s), duration {:?}",
            name,
            streams.len(),
            duration.map(|d| d as f64 / 1e6)
        );

        Ok(Self {
            format,
            streams,
            tracks,
            context,
            offset: 0,
        })
    }

    pub fn tracks(&self) -> &TrackList {
        &self.tracks
    }

    pub fn duration(&self) -> Option<i64> {
        self.context.duration
    }

    pub(crate) fn set_offset(&mut self, offset: i64) {
        self.offset = offset;
    }

    /// Publish tracks and select the first audio track
    pub fn announce(&self, pipe: &MediaPipe) {
        pipe.set_tracks(StreamKind::Audio, self.tracks.tracks(StreamKind::Audio));
        let first = self.tracks.first(StreamKind::Audio).map_or(-1, |t| t.id);
        pipe.set_stream(StreamKind::Audio, first);
        pipe.set_stream(StreamKind::Video, -1);
        pipe.set_stream(StreamKind::Subtitle, -1);
    }
}

impl Source for SymphoniaSource {
    fn read(&mut self) -> Result<Fetched> {
        let packet = match self.format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(Fetched::Eof);
            }
            Err(SymphoniaError::ResetRequired) => {
                debug!("{}: stream reset, ending", self.context.name);
                return Ok(Fetched::Eof);
            }
            Err(e) => return Err(MediaError::Format(e.to_string())),
        };

        let Some(ts) = self.streams.get(&packet.track_id()) else {
            return Ok(Fetched::Again);
        };

        let offset = to_time_base(self.offset, ts.time_base);
        let pts = packet.ts as i64 + offset;
        let unit = SourceUnit::new(StreamKind::Audio, ts.stream, Bytes::from(packet.data), ts.time_base)
            .with_pts(pts)
            .with_dts(pts)
            .with_duration(packet.dur as i64)
            .with_codec(Some(ts.codec.clone()));
        Ok(Fetched::Unit(unit))
    }

    fn seek(&mut self, target: i64) -> Result<()> {
        let target = (target - self.offset).max(0);
        let time = Time::new(
            (target / 1_000_000) as u64,
            (target % 1_000_000) as f64 / 1e6,
        );
        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: None,
                },
            )
            .map_err(|e| MediaError::Format(format!("seek failed: {e}")))?;
        Ok(())
    }
}

/// Local files through symphonia
#[derive(Debug, Default)]
pub struct FileBackend;

impl FileBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn can_handle(&self, descriptor: &str) -> bool {
        strip_scheme(descriptor, "file").is_some() || !descriptor.contains("://")
    }

    fn play(&self, descriptor: &str, pipe: &Arc<MediaPipe>, hold: bool) -> Result<Event> {
        let path = strip_scheme(descriptor, "file").unwrap_or(descriptor);
        let file = File::open(path).map_err(|e| MediaError::Open(format!("{path}: {e}")))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let source = SymphoniaSource::open(mss, &hint, path)?;
        pipe.configure(
            Capabilities::CAN_SEEK | Capabilities::CAN_PAUSE,
            pipe.buffer_mode(),
            source.duration(),
        );
        source.announce(pipe);

        Ok(Producer::new(pipe, source).run(hold))
    }
}
