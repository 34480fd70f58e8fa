//! MPEG-2 program streams as found in DVD `.VOB` files.
//!
//! The input is read in 2048-byte packs. Each pack carries a pack header
//! followed by PES packets, which are split into elementary stream units:
//! MPEG video, MPEG/AC3/DTS/LPCM audio and DVD subpictures.

use super::{Backend, strip_scheme};
use crate::audio::decoder::decoder_for;
use crate::event::Event;
use crate::media::{
    BufferType, Capabilities, CodecId, CodecParams, CodecRef, CodecWrapper, FormatContext,
    MediaError, MediaPipe, PTS_UNSET, Rational, Result, StreamKind, TrackInfo, TrackList,
    pts_is_set, rescale,
};
use crate::producer::{Fetched, Producer, Source, SourceUnit};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, info, trace};

pub const PACK_SIZE: usize = 2048;
const PACK_START: u32 = 0x1ba;
const PRIVATE_STREAM_1: u32 = 0x1bd;
const PADDING_STREAM: u32 = 0x1be;
const PRIVATE_STREAM_2: u32 = 0x1bf;
const MPEG_TIME_BASE: Rational = Rational::new(1, 90_000);

/// One PES payload with its timestamps in 90 kHz units
#[derive(Debug, PartialEq, Eq)]
pub struct PesPacket<'a> {
    /// Start code, or the substream id for private stream 1
    pub startcode: u32,
    pub pts: i64,
    pub dts: i64,
    pub payload: &'a [u8],
}

/// Audio format carried in an LPCM substream header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LpcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

fn read_pts(b: &[u8]) -> i64 {
    let hi = ((b[0] >> 1) & 0x07) as i64;
    let mid = (u16::from_be_bytes([b[1], b[2]]) >> 1) as i64;
    let lo = (u16::from_be_bytes([b[3], b[4]]) >> 1) as i64;
    (hi << 30) | (mid << 15) | lo
}

/// Parse the body of one PES packet (everything after the length field)
pub fn parse_pes(startcode: u32, buf: &[u8]) -> Option<PesPacket<'_>> {
    if buf.len() < 3 {
        return None;
    }
    let (x, flags, hlen) = (buf[0], buf[1], buf[2] as usize);
    let mut buf = &buf[3..];
    if buf.len() < hlen || x & 0xc0 != 0x80 {
        return None;
    }

    let (mut pts, mut dts) = (PTS_UNSET, PTS_UNSET);
    match flags & 0xc0 {
        0xc0 if hlen >= 10 => {
            pts = read_pts(&buf[..5]);
            dts = read_pts(&buf[5..10]);
        }
        0x80 if hlen >= 5 => {
            pts = read_pts(&buf[..5]);
            dts = pts;
        }
        0xc0 | 0x80 => return None,
        _ => {}
    }
    buf = &buf[hlen..];

    let mut startcode = startcode;
    if startcode == PRIVATE_STREAM_1 {
        let (&sub, rest) = buf.split_first()?;
        startcode = sub as u32;
        buf = rest;
        if (0x80..=0xbf).contains(&startcode) {
            // frame count and first access unit pointer
            buf = buf.get(3..)?;
        }
    }

    Some(PesPacket {
        startcode,
        pts,
        dts,
        payload: buf,
    })
}

/// Program mux rate from a pack header, bytes per second
pub fn mux_rate(block: &[u8]) -> Option<u64> {
    if block.len() < 14 || u32::from_be_bytes([block[0], block[1], block[2], block[3]]) != PACK_START {
        return None;
    }
    let raw = u32::from_be_bytes([0, block[10], block[11], block[12]]) >> 2;
    (raw > 0).then_some(raw as u64 * 50)
}

/// Split one pack into PES packets
pub fn parse_pack(block: &[u8]) -> Vec<PesPacket<'_>> {
    let mut out = Vec::new();
    if block.len() < 14 || block[..4] != [0, 0, 1, 0xba] {
        return out;
    }
    let stuffing = (block[13] & 7) as usize;
    let mut buf = block.get(14 + stuffing..).unwrap_or(&[]);

    while buf.len() >= 6 {
        let startcode = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let pes_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        buf = &buf[6..];
        if pes_len < 3 || pes_len > buf.len() || startcode >> 8 != 1 {
            break;
        }
        let (body, rest) = buf.split_at(pes_len);
        buf = rest;

        match startcode {
            PADDING_STREAM | PRIVATE_STREAM_2 => {}
            PRIVATE_STREAM_1 | 0x1c0..=0x1df | 0x1e0..=0x1ef => {
                if let Some(pkt) = parse_pes(startcode, body) {
                    out.push(pkt);
                }
            }
            other => trace!("Skipping PES stream {:#x}", other),
        }
    }
    out
}

/// Map a start code to stream kind, codec and stream number
pub fn classify(startcode: u32) -> Option<(StreamKind, CodecId, i32)> {
    let sc = startcode as i32;
    match startcode {
        0x1e0..=0x1ef => Some((StreamKind::Video, CodecId::Mpeg2Video, sc & 0xf)),
        0x80..=0x87 => Some((StreamKind::Audio, CodecId::Ac3, sc & 7)),
        0x88..=0x9f => Some((StreamKind::Audio, CodecId::Dts, sc & 7)),
        0xa0..=0xa7 => Some((StreamKind::Audio, CodecId::Lpcm, sc & 7)),
        0x1c0..=0x1df => Some((StreamKind::Audio, CodecId::Mp2, sc & 7)),
        0x20..=0x3f => Some((StreamKind::Subtitle, CodecId::DvdSubtitle, sc & 31)),
        _ => None,
    }
}

/// Strip the LPCM substream header, returning the format it declares
fn lpcm_header(payload: &[u8]) -> Option<(LpcmFormat, &[u8])> {
    let header = payload.get(..3)?;
    let sample_rate = match (header[1] >> 4) & 3 {
        0 => 48_000,
        1 => 96_000,
        _ => return None,
    };
    let channels = (header[1] & 7) as u16 + 1;
    Some((
        LpcmFormat {
            sample_rate,
            channels,
        },
        &payload[3..],
    ))
}

fn codec_name(id: CodecId) -> &'static str {
    match id {
        CodecId::Mpeg2Video => "mpeg2video",
        CodecId::Ac3 => "ac3",
        CodecId::Dts => "dts",
        CodecId::Lpcm => "lpcm",
        CodecId::Mp2 => "mp2",
        CodecId::DvdSubtitle => "dvdsub",
        _ => "unknown",
    }
}

/// Demuxes a program stream into per-kind units
pub struct PesSource<R: Read + Seek + Send> {
    reader: R,
    pipe: Arc<MediaPipe>,
    context: Arc<FormatContext>,
    codecs: [Option<CodecRef>; 3],
    /// Set after a discontinuity; the next unit of each kind gets a fresh codec
    force_reset: [bool; 3],
    pending: VecDeque<SourceUnit>,
    tracks: TrackList,
    start_pts: i64,
    rate: u64,
    block: Vec<u8>,
}

impl<R: Read + Seek + Send> PesSource<R> {
    /// Read ahead to find the first timestamp and the mux rate, then rewind
    pub fn open(mut reader: R, name: &str, pipe: &Arc<MediaPipe>) -> Result<Self> {
        let mut block = vec![0u8; PACK_SIZE];
        let mut start_pts = PTS_UNSET;
        let mut rate = None;
        for _ in 0..256 {
            match reader.read_exact(&mut block) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            rate = rate.or(mux_rate(&block));
            if let Some(pts) = parse_pack(&block).iter().map(|p| p.pts).find(|&p| pts_is_set(p)) {
                start_pts = pts;
                break;
            }
        }
        let rate = rate.ok_or_else(|| MediaError::Format(format!("{name}: not an MPEG program stream")))?;
        reader.seek(SeekFrom::Start(0))?;

        let start = if pts_is_set(start_pts) {
            rescale(start_pts, MPEG_TIME_BASE)
        } else {
            0
        };
        info!("{}: mux rate {} B/s, starts at {}us", name, rate, start);

        Ok(Self {
            reader,
            pipe: pipe.clone(),
            context: FormatContext::new(name, start, None),
            codecs: [None, None, None],
            force_reset: [false; 3],
            pending: VecDeque::new(),
            tracks: TrackList::new(),
            start_pts: start,
            rate,
            block,
        })
    }

    /// Codec wrapper for `id`, replaced when the id changes or a reset is due
    fn codec(&mut self, kind: StreamKind, id: CodecId, params: CodecParams) -> CodecRef {
        let slot = kind.index();
        if let Some(cw) = &self.codecs[slot] {
            if cw.id() == id && !self.force_reset[slot] {
                return cw.clone();
            }
            debug!("{}: replacing {:?} codec with {:?}", self.context.name, cw.id(), id);
        }
        self.force_reset[slot] = false;

        let format = Some(self.context.clone());
        let decoder = match (kind, params.sample_rate, params.channels) {
            (StreamKind::Audio, Some(rate), Some(channels)) => decoder_for(id, rate, channels),
            _ => None,
        };
        let cw = match decoder {
            Some(decoder) => CodecWrapper::with_decoder(id, format, params, decoder),
            None => CodecWrapper::with_params(id, kind, format, params),
        };
        self.codecs[slot] = Some(cw.clone());
        cw
    }

    fn demux_block(&mut self) {
        let block = std::mem::take(&mut self.block);
        for pkt in parse_pack(&block) {
            let Some((kind, id, stream)) = classify(pkt.startcode) else {
                continue;
            };

            let mut payload = pkt.payload;
            let mut params = CodecParams::default();
            if kind == StreamKind::Audio {
                params.sample_rate = Some(48_000);
                params.channels = Some(2);
            }
            if id == CodecId::Lpcm {
                let Some((format, rest)) = lpcm_header(payload) else {
                    continue;
                };
                params.sample_rate = Some(format.sample_rate);
                params.channels = Some(format.channels);
                payload = rest;
            }

            if self.tracks.add(kind, TrackInfo::new(stream, codec_name(id))) {
                self.pipe.set_tracks(kind, self.tracks.tracks(kind));
            }
            // unselected substreams must not touch the shared codec slot
            if self.pipe.stream(kind) != stream {
                continue;
            }

            let codec = self.codec(kind, id, params);
            let mut unit = SourceUnit::new(kind, stream, Bytes::copy_from_slice(payload), MPEG_TIME_BASE)
                .with_pts(pkt.pts)
                .with_dts(pkt.dts)
                .with_codec(Some(codec));
            if kind == StreamKind::Subtitle {
                unit.buffer_type = BufferType::DvdSpu;
            }
            if kind == StreamKind::Audio {
                unit.hints.audio_rate = params.sample_rate;
                unit.hints.audio_channels = params.channels;
            }
            self.pending.push_back(unit);
        }
        self.block = block;
    }
}

impl<R: Read + Seek + Send> Source for PesSource<R> {
    fn read(&mut self) -> Result<Fetched> {
        if let Some(unit) = self.pending.pop_front() {
            return Ok(Fetched::Unit(unit));
        }

        match self.reader.read_exact(&mut self.block) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Fetched::Eof),
            Err(e) => return Err(e.into()),
        }
        self.demux_block();
        Ok(match self.pending.pop_front() {
            Some(unit) => Fetched::Unit(unit),
            None => Fetched::Again,
        })
    }

    fn seek(&mut self, target: i64) -> Result<()> {
        let len = self.reader.seek(SeekFrom::End(0))?;
        let elapsed = target.saturating_sub(self.start_pts).max(0) as u128;
        let offset = (elapsed * self.rate as u128 / 1_000_000).min(len as u128) as u64;
        let offset = offset / PACK_SIZE as u64 * PACK_SIZE as u64;
        self.reader.seek(SeekFrom::Start(offset))?;
        self.pending.clear();
        self.force_reset = [true; 3];
        debug!("{}: seek to {}us at byte {}", self.context.name, target, offset);
        Ok(())
    }

    fn start_time(&self) -> i64 {
        self.start_pts
    }
}

/// `.vob`/`.mpg` files and `pes://` descriptors
#[derive(Debug, Default)]
pub struct PesBackend;

impl PesBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for PesBackend {
    fn name(&self) -> &'static str {
        "pes"
    }

    fn can_handle(&self, descriptor: &str) -> bool {
        if strip_scheme(descriptor, "pes").is_some() {
            return true;
        }
        let lower = descriptor.to_ascii_lowercase();
        !descriptor.contains("://") && [".vob", ".mpg", ".mpeg"].iter().any(|ext| lower.ends_with(ext))
    }

    fn play(&self, descriptor: &str, pipe: &Arc<MediaPipe>, hold: bool) -> Result<Event> {
        let path = strip_scheme(descriptor, "pes").unwrap_or(descriptor);
        let file = File::open(path).map_err(|e| MediaError::Open(format!("{path}: {e}")))?;
        let source = PesSource::open(BufReader::new(file), path, pipe)?;

        pipe.configure(
            Capabilities::CAN_SEEK | Capabilities::CAN_PAUSE | Capabilities::VIDEO,
            pipe.buffer_mode(),
            None,
        );
        pipe.set_stream(StreamKind::Video, 0);
        pipe.set_stream(StreamKind::Audio, 0);
        pipe.set_stream(StreamKind::Subtitle, -1);

        Ok(Producer::new(pipe, source).run(hold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::media::MediaService;
    use std::io::Cursor;

    fn encode_pts(pts: i64) -> [u8; 5] {
        let a = (0x21 | ((pts >> 29) & 0x0e)) as u8;
        let b = ((((pts >> 14) & 0xfffe) | 1) as u16).to_be_bytes();
        let c = ((((pts << 1) & 0xfffe) | 1) as u16).to_be_bytes();
        [a, b[0], b[1], c[0], c[1]]
    }

    /// A PES packet: start code, optional private substream header, pts
    fn pes(startcode: u32, sub: Option<&[u8]>, pts: Option<i64>, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![0x81];
        match pts {
            Some(pts) => {
                body.extend_from_slice(&[0x80, 5]);
                body.extend_from_slice(&encode_pts(pts));
            }
            None => body.extend_from_slice(&[0x00, 0]),
        }
        if let Some(sub) = sub {
            body.extend_from_slice(sub);
        }
        body.extend_from_slice(payload);

        let mut out = startcode.to_be_bytes().to_vec();
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// A full 2048-byte pack at 10080 * 50 B/s
    fn pack(packets: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, 0xba, 0x44, 0, 4, 0, 4, 1];
        out.extend_from_slice(&((10_080u32 << 2) | 3).to_be_bytes()[1..]);
        out.push(0xf8);
        for p in packets {
            out.extend_from_slice(p);
        }
        let rest = PACK_SIZE - out.len();
        out.extend_from_slice(&PADDING_STREAM.to_be_bytes());
        out.extend_from_slice(&((rest - 6) as u16).to_be_bytes());
        out.resize(PACK_SIZE, 0xff);
        out
    }

    fn ac3(track: u8, pts: i64) -> Vec<u8> {
        pes(PRIVATE_STREAM_1, Some(&[0x80 + track, 1, 0, 1]), Some(pts), b"ac3-frame")
    }

    fn pipe() -> Arc<MediaPipe> {
        let pipe = MediaPipe::new("pes-test", &Config::default(), &MediaService::new());
        pipe.set_stream(StreamKind::Video, 0);
        pipe.set_stream(StreamKind::Audio, 0);
        pipe.set_stream(StreamKind::Subtitle, -1);
        pipe
    }

    fn lpcm(pts: i64) -> Vec<u8> {
        pes(PRIVATE_STREAM_1, Some(&[0xa0, 1, 0, 1, 0x00, 0x01, 0x80]), Some(pts), &[0, 0, 0, 0])
    }

    fn units(source: &mut PesSource<Cursor<Vec<u8>>>) -> Vec<SourceUnit> {
        let mut out = Vec::new();
        loop {
            match source.read().unwrap() {
                Fetched::Unit(unit) => out.push(unit),
                Fetched::Again => {}
                Fetched::Eof => return out,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_pts_roundtrip() {
        for pts in [0, 1, 90_000, (1 << 33) - 1] {
            assert_eq!(read_pts(&encode_pts(pts)), pts);
        }
    }

    #[test]
    fn test_parse_pack() {
        let block = pack(&[
            pes(0x1e0, None, Some(9000), b"picture"),
            ac3(1, 9000),
            pes(0x1c0, None, None, b"mp2"),
        ]);
        assert_eq!(mux_rate(&block), Some(504_000));

        let pkts = parse_pack(&block);
        assert_eq!(pkts.len(), 3);
        assert_eq!(pkts[0].startcode, 0x1e0);
        assert_eq!(pkts[0].pts, 9000);
        assert_eq!(pkts[0].payload, b"picture");
        assert_eq!(pkts[1].startcode, 0x81);
        assert_eq!(pkts[1].payload, b"ac3-frame");
        assert_eq!(pkts[2].pts, PTS_UNSET);
    }

    #[test]
    fn test_truncated_pes_is_ignored() {
        assert!(parse_pes(0x1e0, &[0x81]).is_none());
        // claims a pts but the header is too short
        assert!(parse_pes(0x1e0, &[0x81, 0x80, 2, 0, 0]).is_none());
        // MPEG-1 style header
        assert!(parse_pes(0x1e0, &[0x0f, 0, 0]).is_none());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0x1e0), Some((StreamKind::Video, CodecId::Mpeg2Video, 0)));
        assert_eq!(classify(0x83), Some((StreamKind::Audio, CodecId::Ac3, 3)));
        assert_eq!(classify(0x89), Some((StreamKind::Audio, CodecId::Dts, 1)));
        assert_eq!(classify(0xa0), Some((StreamKind::Audio, CodecId::Lpcm, 0)));
        assert_eq!(classify(0x1c2), Some((StreamKind::Audio, CodecId::Mp2, 2)));
        assert_eq!(classify(0x21), Some((StreamKind::Subtitle, CodecId::DvdSubtitle, 1)));
        assert_eq!(classify(0x1bf), None);
    }

    #[test]
    fn test_demux_rescales_and_publishes_tracks() {
        let data = [
            pack(&[pes(0x1e0, None, Some(45_000), b"pic"), ac3(0, 45_000)]),
            pack(&[ac3(1, 48_000), pes(PRIVATE_STREAM_1, Some(&[0x20]), Some(45_000), b"spu")]),
        ]
        .concat();
        let pipe = pipe();
        pipe.set_stream(StreamKind::Subtitle, 0);
        let mut source = PesSource::open(Cursor::new(data), "test.vob", &pipe).unwrap();
        assert_eq!(source.start_time(), 500_000);

        let units = units(&mut source);
        // audio stream 1 is listed as a track but not demuxed
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].kind, StreamKind::Video);
        assert_eq!(rescale(units[0].pts, units[0].time_base), 500_000);
        assert_eq!(units[1].stream, 0);
        assert_eq!(units[2].buffer_type, BufferType::DvdSpu);
        assert_eq!(pipe.props().get_int("audio.tracks.count"), Some(2));
        assert_eq!(pipe.props().get_str("subtitle.tracks.0.codec").as_deref(), Some("dvdsub"));
    }

    #[test]
    fn test_codec_replaced_on_id_change() {
        let data = [
            pack(&[ac3(0, 0)]),
            pack(&[pes(PRIVATE_STREAM_1, Some(&[0x88, 1, 0, 1]), Some(3000), b"dts")]),
            pack(&[pes(PRIVATE_STREAM_1, Some(&[0x88, 1, 0, 1]), Some(6000), b"dts")]),
        ]
        .concat();
        let mut source = PesSource::open(Cursor::new(data), "test.vob", &pipe()).unwrap();
        let units = units(&mut source);

        let first = units[0].codec.clone().unwrap();
        let second = units[1].codec.clone().unwrap();
        let third = units[2].codec.clone().unwrap();
        assert_eq!(first.id(), CodecId::Ac3);
        assert_eq!(second.id(), CodecId::Dts);
        assert!(Arc::ptr_eq(&second, &third));
        // the replaced wrapper lives on only through the unit that used it
        assert_eq!(Arc::strong_count(&first), 2);
    }

    #[test]
    fn test_unselected_substream_keeps_codec() {
        let data = [
            pack(&[lpcm(0), ac3(1, 0)]),
            pack(&[ac3(1, 3000), lpcm(3000)]),
            pack(&[lpcm(6000), ac3(1, 6000)]),
        ]
        .concat();
        let pipe = pipe();
        let mut source = PesSource::open(Cursor::new(data), "test.vob", &pipe).unwrap();
        let units = units(&mut source);

        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.stream == 0));
        let first = units[0].codec.clone().unwrap();
        assert_eq!(first.id(), CodecId::Lpcm);
        assert!(units.iter().all(|u| Arc::ptr_eq(&first, u.codec.as_ref().unwrap())));
        assert_eq!(pipe.props().get_int("audio.tracks.count"), Some(2));
    }

    #[test]
    fn test_seek_past_end_is_clamped() {
        let data = [pack(&[ac3(0, 0)]), pack(&[ac3(0, 3000)])].concat();
        let mut source = PesSource::open(Cursor::new(data), "test.vob", &pipe()).unwrap();

        source.seek(i64::MAX / 2).unwrap();
        assert!(units(&mut source).is_empty());
        source.seek(i64::MIN).unwrap();
        assert_eq!(units(&mut source).len(), 2);
    }

    #[test]
    fn test_seek_forces_codec_reset() {
        let data = [pack(&[ac3(0, 0)]), pack(&[ac3(0, 3000)])].concat();
        let mut source = PesSource::open(Cursor::new(data), "test.vob", &pipe()).unwrap();
        let before = units(&mut source)[0].codec.clone().unwrap();

        source.seek(0).unwrap();
        let after = units(&mut source);
        assert_eq!(after.len(), 2);
        let reset = after[0].codec.clone().unwrap();
        assert!(!Arc::ptr_eq(&before, &reset));
        assert!(Arc::ptr_eq(&reset, after[1].codec.as_ref().unwrap()));
    }

    #[test]
    fn test_lpcm_header() {
        let block = pack(&[pes(
            PRIVATE_STREAM_1,
            Some(&[0xa0, 1, 0, 1, 0x00, 0x01, 0x80]),
            Some(0),
            &[0x12, 0x34, 0x56, 0x78],
        )]);
        let mut source = PesSource::open(Cursor::new(block), "lpcm.vob", &pipe()).unwrap();
        let units = units(&mut source);
        assert_eq!(units[0].data.as_ref(), &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(units[0].hints.audio_channels, Some(2));
        assert_eq!(units[0].hints.audio_rate, Some(48_000));
        assert!(units[0].codec.as_ref().unwrap().has_decoder());
    }

    #[test]
    fn test_not_a_program_stream() {
        let err = PesSource::open(Cursor::new(vec![0u8; PACK_SIZE * 2]), "x.vob", &pipe());
        assert!(matches!(err, Err(MediaError::Format(_))));
    }
}
