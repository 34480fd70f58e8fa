use super::{Backend, strip_scheme};
use crate::audio::decoder::PcmDecoder;
use crate::event::Event;
use crate::media::{
    Capabilities, CodecId, CodecParams, CodecRef, CodecWrapper, MediaError, MediaPipe, Rational,
    Result, StreamKind, TrackInfo,
};
use crate::producer::{Fetched, Producer, Source, SourceUnit};
use bytes::{BufMut, BytesMut};
use std::f32::consts::TAU;
use std::sync::Arc;

/// Generates interleaved 16-bit stereo PCM on demand
pub trait ChunkRenderer: Send {
    fn sample_rate(&self) -> u32;

    /// Track length in frames, `None` for endless output
    fn length(&self) -> Option<u64>;

    /// Move to frame `position`
    fn seek(&mut self, position: u64);

    /// Fill `out` with the next `out.len() / 2` frames
    fn render(&mut self, out: &mut [i16]);
}

/// Sine tone with a short fade-in, mostly useful for testing output paths
pub struct ToneGenerator {
    freq: f32,
    rate: u32,
    length: Option<u64>,
    position: u64,
}

impl ToneGenerator {
    const FADE_FRAMES: u64 = 441;

    pub fn new(freq: f32, rate: u32, seconds: Option<u32>) -> Self {
        Self {
            freq,
            rate,
            length: seconds.map(|s| s as u64 * rate as u64),
            position: 0,
        }
    }
}

impl ChunkRenderer for ToneGenerator {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn length(&self) -> Option<u64> {
        self.length
    }

    fn seek(&mut self, position: u64) {
        self.position = position;
    }

    fn render(&mut self, out: &mut [i16]) {
        for frame in out.chunks_exact_mut(2) {
            let t = self.position as f32 / self.rate as f32;
            let gain = (self.position.min(Self::FADE_FRAMES) as f32 / Self::FADE_FRAMES as f32) * 0.3;
            let sample = ((t * self.freq * TAU).sin() * gain * i16::MAX as f32) as i16;
            frame[0] = sample;
            frame[1] = sample;
            self.position += 1;
        }
    }
}

/// Wraps a renderer as a seekable source
pub struct SynthSource<R: ChunkRenderer> {
    renderer: R,
    codec: CodecRef,
    position: u64,
    chunk: usize,
}

impl<R: ChunkRenderer> SynthSource<R> {
    const CHUNK_FRAMES: usize = 1024;

    pub fn new(renderer: R) -> Self {
        let rate = renderer.sample_rate();
        let codec = CodecWrapper::with_decoder(
            CodecId::Pcm16,
            None,
            CodecParams {
                sample_rate: Some(rate),
                channels: Some(2),
                frame_duration: None,
            },
            Box::new(PcmDecoder::new(rate, 2, false)),
        );
        Self {
            renderer,
            codec,
            position: 0,
            chunk: Self::CHUNK_FRAMES,
        }
    }

    pub fn duration(&self) -> Option<i64> {
        self.renderer
            .length()
            .map(|frames| frames as i64 * 1_000_000 / self.renderer.sample_rate() as i64)
    }
}

impl<R: ChunkRenderer> Source for SynthSource<R> {
    fn read(&mut self) -> Result<Fetched> {
        let mut frames = self.chunk;
        if let Some(length) = self.renderer.length() {
            let left = length.saturating_sub(self.position);
            if left == 0 {
                return Ok(Fetched::Eof);
            }
            frames = frames.min(left as usize);
        }

        let mut pcm = vec![0i16; frames * 2];
        self.renderer.render(&mut pcm);
        let mut data = BytesMut::with_capacity(pcm.len() * 2);
        for s in pcm {
            data.put_i16_le(s);
        }

        let pts = self.position as i64;
        self.position += frames as u64;
        let unit = SourceUnit::new(
            StreamKind::Audio,
            0,
            data.freeze(),
            Rational::new(1, self.renderer.sample_rate() as i64),
        )
        .with_pts(pts)
        .with_dts(pts)
        .with_duration(frames as i64)
        .with_codec(Some(self.codec.clone()));
        Ok(Fetched::Unit(unit))
    }

    fn seek(&mut self, target: i64) -> Result<()> {
        let mut position = (target.max(0) as u128 * self.renderer.sample_rate() as u128 / 1_000_000) as u64;
        if let Some(length) = self.renderer.length() {
            position = position.min(length);
        }
        self.renderer.seek(position);
        self.position = position;
        Ok(())
    }
}

/// `synth://<freq>[/<seconds>]`
#[derive(Debug, Default)]
pub struct SynthBackend;

impl SynthBackend {
    pub fn new() -> Self {
        Self
    }

    fn parse(descriptor: &str) -> Result<(f32, Option<u32>)> {
        let bad = || MediaError::Open(format!("bad synth descriptor {descriptor}"));
        let rest = strip_scheme(descriptor, "synth").ok_or_else(bad)?;
        let (freq, secs) = match rest.split_once('/') {
            Some((freq, secs)) => (freq, Some(secs.parse().map_err(|_| bad())?)),
            None => (rest, None),
        };
        let freq: f32 = freq.parse().map_err(|_| bad())?;
        if !(1.0..=20_000.0).contains(&freq) {
            return Err(bad());
        }
        Ok((freq, secs))
    }
}

impl Backend for SynthBackend {
    fn name(&self) -> &'static str {
        "synth"
    }

    fn can_handle(&self, descriptor: &str) -> bool {
        strip_scheme(descriptor, "synth").is_some()
    }

    fn play(&self, descriptor: &str, pipe: &Arc<MediaPipe>, hold: bool) -> Result<Event> {
        let (freq, secs) = Self::parse(descriptor)?;
        let source = SynthSource::new(ToneGenerator::new(freq, 44_100, secs));

        pipe.configure(
            Capabilities::CAN_SEEK | Capabilities::CAN_PAUSE,
            pipe.buffer_mode(),
            source.duration(),
        );
        pipe.set_tracks(StreamKind::Audio, &[TrackInfo::new(0, "pcm").with_title(format!("{freq} Hz"))]);
        pipe.set_stream(StreamKind::Audio, 0);
        pipe.set_stream(StreamKind::Video, -1);
        pipe.set_stream(StreamKind::Subtitle, -1);

        Ok(Producer::new(pipe, source).run(hold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::media::MediaService;
    use std::time::Duration;

    #[test]
    fn test_tone_renders_and_ends() {
        let mut source = SynthSource::new(ToneGenerator::new(440.0, 8000, Some(1)));
        assert_eq!(source.duration(), Some(1_000_000));

        let mut frames = 0;
        loop {
            match source.read().unwrap() {
                Fetched::Unit(unit) => {
                    assert_eq!(unit.pts, frames);
                    assert_eq!(unit.data.len() as i64, unit.duration * 4);
                    frames += unit.duration;
                }
                Fetched::Eof => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(frames, 8000);
    }

    #[test]
    fn test_fade_in_starts_silent() {
        let mut tone = ToneGenerator::new(1000.0, 44_100, None);
        let mut out = [1i16; 4];
        tone.render(&mut out);
        assert_eq!(out[0], 0);
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn test_seek_clamps_to_length() {
        let mut source = SynthSource::new(ToneGenerator::new(440.0, 8000, Some(2)));
        source.seek(500_000).unwrap();
        match source.read().unwrap() {
            Fetched::Unit(unit) => assert_eq!(unit.pts, 4000),
            other => panic!("unexpected {other:?}"),
        }
        source.seek(60_000_000).unwrap();
        assert!(matches!(source.read().unwrap(), Fetched::Eof));
    }

    #[test]
    fn test_parse_descriptor() {
        assert_eq!(SynthBackend::parse("synth://440/30").unwrap(), (440.0, Some(30)));
        assert_eq!(SynthBackend::parse("synth://880").unwrap(), (880.0, None));
        assert!(SynthBackend::parse("synth://loud").is_err());
        assert!(SynthBackend::parse("synth://0").is_err());
    }

    #[test]
    fn test_relative_seek_through_pipe() {
        let mut cfg = Config::default();
        cfg.pipe.max_packets = 8;
        cfg.pipe.min_packets = 0;
        let pipe = MediaPipe::new("synth-test", &cfg, &MediaService::new());

        let producer = {
            let pipe = pipe.clone();
            std::thread::spawn(move || SynthBackend::new().play("synth://440/60", &pipe, false))
        };

        let first = loop {
            let buf = pipe
                .dequeue_deadline(StreamKind::Audio, Duration::from_secs(2))
                .expect("producer stalled");
            if !buf.is_control() {
                break buf;
            }
        };
        assert_eq!(first.pts, 0);

        let epoch = pipe.epoch();
        pipe.enqueue_event(Event::SeekForward);
        let resumed = loop {
            let buf = pipe
                .dequeue_deadline(StreamKind::Audio, Duration::from_secs(2))
                .expect("producer stalled");
            if !buf.is_control() && buf.epoch > epoch {
                break buf;
            }
        };
        assert_eq!(resumed.pts, 15_000_000);

        pipe.enqueue_event(Event::Stop);
        assert_eq!(producer.join().unwrap().unwrap(), Event::Stop);
    }
}
