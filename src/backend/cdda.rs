use super::{Backend, strip_scheme};
use crate::event::Event;
use crate::media::{
    Capabilities, MediaError, MediaPipe, OutputHints, Rational, Result, StreamKind, TrackInfo,
};
use crate::producer::{Fetched, Producer, Source, SourceUnit};
use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, info};

/// Bytes in one raw audio sector
pub const SECTOR_SIZE: usize = 2352;
/// Sectors per second of CD audio
pub const SECTORS_PER_SEC: i64 = 75;
const SECTORS_PER_BUFFER: u32 = 2;

/// Raw sector access to a disc or disc image
#[cfg_attr(test, mockall::automock)]
pub trait SectorReader: Send {
    /// Read `count` sectors starting at `lsn` into `buf`, returning how
    /// many were read
    fn read_sectors(&mut self, lsn: u32, count: u32, buf: &mut [u8]) -> io::Result<u32>;

    fn sector_count(&self) -> u32;

    fn eject(&mut self) -> io::Result<()>;
}

/// A raw `.bin` image of 2352-byte sectors
pub struct ImageReader {
    file: File,
    sectors: u32,
}

impl ImageReader {
    pub fn open(path: &str) -> io::Result<Self> {
        let file = File::open(path)?;
        let sectors = (file.metadata()?.len() / SECTOR_SIZE as u64) as u32;
        Ok(Self { file, sectors })
    }
}

impl SectorReader for ImageReader {
    fn read_sectors(&mut self, lsn: u32, count: u32, buf: &mut [u8]) -> io::Result<u32> {
        let count = count.min(self.sectors.saturating_sub(lsn));
        if count == 0 {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(lsn as u64 * SECTOR_SIZE as u64))?;
        self.file.read_exact(&mut buf[..count as usize * SECTOR_SIZE])?;
        Ok(count)
    }

    fn sector_count(&self) -> u32 {
        self.sectors
    }

    fn eject(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "disc images cannot be ejected"))
    }
}

/// Plays a sector range as 44.1 kHz stereo PCM, two sectors per buffer
pub struct CddaSource<R: SectorReader> {
    reader: R,
    first: u32,
    last: u32,
    lsn: u32,
}

impl<R: SectorReader> CddaSource<R> {
    /// # Arguments
    /// * `reader` - Sector access
    /// * `first` - First sector of the track
    /// * `last` - Last sector of the track, inclusive
    pub fn new(reader: R, first: u32, last: u32) -> Self {
        Self {
            reader,
            first,
            last,
            lsn: first,
        }
    }

    pub fn duration(&self) -> i64 {
        (self.last - self.first + 1) as i64 * 1_000_000 / SECTORS_PER_SEC
    }

    fn clamp_lsn(&self, lsn: i64) -> u32 {
        lsn.clamp(self.first as i64, self.last as i64) as u32
    }
}

impl<R: SectorReader> Source for CddaSource<R> {
    fn read(&mut self) -> Result<Fetched> {
        if self.lsn > self.last {
            return Ok(Fetched::Eof);
        }

        let count = SECTORS_PER_BUFFER.min(self.last - self.lsn + 1);
        let mut data = vec![0u8; SECTOR_SIZE * count as usize];
        match self.reader.read_sectors(self.lsn, count, &mut data) {
            Ok(n) if n >= count => {}
            Ok(n) => {
                debug!("Short read at sector {}: {} of {} sectors", self.lsn, n, count);
                data[n as usize * SECTOR_SIZE..].fill(0);
            }
            Err(e) => {
                debug!("Unreadable sector {}: {}", self.lsn, e);
                data.fill(0);
            }
        }

        let pts = (self.lsn - self.first) as i64;
        self.lsn += count;

        let mut unit = SourceUnit::new(
            StreamKind::Audio,
            0,
            Bytes::from(data),
            Rational::new(1, SECTORS_PER_SEC),
        )
        .with_pts(pts)
        .with_dts(pts)
        .with_duration(count as i64);
        unit.hints = OutputHints {
            audio_rate: Some(44_100),
            audio_channels: Some(2),
            ..Default::default()
        };
        Ok(Fetched::Unit(unit))
    }

    fn seek(&mut self, target: i64) -> Result<()> {
        let offset = target.saturating_mul(SECTORS_PER_SEC) / 1_000_000;
        self.lsn = self.clamp_lsn(offset.saturating_add(self.first as i64));
        debug!("Seek to sector {}", self.lsn);
        Ok(())
    }

    fn eject(&mut self) -> Result<()> {
        self.reader.eject()?;
        Ok(())
    }
}

/// `cdda://<image>[#first-last]`
#[derive(Debug, Default)]
pub struct CddaBackend;

impl CddaBackend {
    pub fn new() -> Self {
        Self
    }

    /// Split off an optional `#first-last` sector range
    fn parse(descriptor: &str) -> Result<(&str, Option<(u32, u32)>)> {
        let rest = strip_scheme(descriptor, "cdda")
            .ok_or_else(|| MediaError::Open(descriptor.to_string()))?;
        let Some((path, range)) = rest.rsplit_once('#') else {
            return Ok((rest, None));
        };
        let bad = || MediaError::Open(format!("bad sector range in {descriptor}"));
        let (first, last) = range.split_once('-').ok_or_else(bad)?;
        let first = first.parse().map_err(|_| bad())?;
        let last = last.parse().map_err(|_| bad())?;
        if last < first {
            return Err(bad());
        }
        Ok((path, Some((first, last))))
    }
}

impl Backend for CddaBackend {
    fn name(&self) -> &'static str {
        "cdda"
    }

    fn can_handle(&self, descriptor: &str) -> bool {
        strip_scheme(descriptor, "cdda").is_some()
    }

    fn play(&self, descriptor: &str, pipe: &Arc<MediaPipe>, hold: bool) -> Result<Event> {
        let (path, range) = Self::parse(descriptor)?;
        let reader = ImageReader::open(path).map_err(|e| MediaError::Open(format!("{path}: {e}")))?;
        if reader.sector_count() == 0 {
            return Err(MediaError::Format(format!("{path}: empty image")));
        }
        let (first, last) = range.unwrap_or((0, reader.sector_count() - 1));

        let source = CddaSource::new(reader, first, last);
        info!("{}: sectors {}..={}", path, first, last);
        pipe.configure(
            Capabilities::CAN_SEEK | Capabilities::CAN_PAUSE | Capabilities::CAN_EJECT,
            pipe.buffer_mode(),
            Some(source.duration()),
        );
        pipe.set_tracks(StreamKind::Audio, &[TrackInfo::new(0, "pcm")]);
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

    fn unit(fetched: Fetched) -> SourceUnit {
        match fetched {
            Fetched::Unit(unit) => unit,
            other => panic!("expected a unit, got {other:?}"),
        }
    }

    #[test]
    fn test_reads_two_sectors() {
        let mut reader = MockSectorReader::new();
        reader
            .expect_read_sectors()
            .times(1)
            .returning(|lsn, count, buf| {
                assert_eq!((lsn, count), (100, 2));
                buf.fill(7);
                Ok(2)
            });

        let mut source = CddaSource::new(reader, 100, 200);
        let unit = unit(source.read().unwrap());
        assert_eq!(unit.data.len(), 2 * SECTOR_SIZE);
        assert!(unit.data.iter().all(|&b| b == 7));
        assert_eq!(unit.pts, 0);
        assert!(unit.codec.is_none());
        assert_eq!(unit.hints.audio_rate, Some(44_100));
    }

    #[test]
    fn test_unreadable_sectors_are_silence() {
        let mut reader = MockSectorReader::new();
        reader
            .expect_read_sectors()
            .returning(|_, _, buf| {
                buf.fill(9);
                Err(io::Error::other("scratched"))
            });

        let mut source = CddaSource::new(reader, 0, 10);
        let unit = unit(source.read().unwrap());
        assert!(unit.data.iter().all(|&b| b == 0));
        let next = self::unit(source.read().unwrap());
        assert_eq!(next.pts, 2);
    }

    #[test]
    fn test_seek_clamps_to_track() {
        let mut reader = MockSectorReader::new();
        reader.expect_read_sectors().returning(|_, _, _| Ok(2));
        let mut source = CddaSource::new(reader, 1000, 1749);

        source.seek(4_000_000).unwrap();
        assert_eq!(unit(source.read().unwrap()).pts, 300);

        source.seek(3_600_000_000).unwrap();
        assert_eq!(source.lsn, 1749);

        source.seek(-5_000_000).unwrap();
        assert_eq!(source.lsn, 1000);
        assert_eq!(source.duration(), 10_000_000);
    }

    #[test]
    fn test_seek_far_past_end() {
        let reader = MockSectorReader::new();
        let mut source = CddaSource::new(reader, 1000, 1749);
        source.seek(i64::MAX / 2).unwrap();
        assert_eq!(source.lsn, 1749);
        source.seek(i64::MIN).unwrap();
        assert_eq!(source.lsn, 1000);
    }

    #[test]
    fn test_odd_range_reads_last_sector_alone() {
        let mut reader = MockSectorReader::new();
        reader.expect_read_sectors().times(2).returning(|lsn, count, buf| {
            assert_eq!(buf.len(), count as usize * SECTOR_SIZE);
            buf.fill(3);
            Ok(if lsn == 4 { 1 } else { 2 })
        });
        let mut source = CddaSource::new(reader, 0, 4);
        unit(source.read().unwrap());
        unit(source.read().unwrap());

        let last = unit(source.read().unwrap());
        assert_eq!(last.pts, 4);
        assert_eq!(last.duration, 1);
        assert_eq!(last.data.len(), SECTOR_SIZE);
        assert!(last.data.iter().all(|&b| b == 3));
        assert!(matches!(source.read().unwrap(), Fetched::Eof));
    }

    #[test]
    fn test_short_read_keeps_sectors_read() {
        let mut reader = MockSectorReader::new();
        reader.expect_read_sectors().times(1).returning(|_, _, buf| {
            buf[..SECTOR_SIZE].fill(6);
            buf[SECTOR_SIZE..].fill(1);
            Ok(1)
        });
        let mut source = CddaSource::new(reader, 0, 10);
        let unit = unit(source.read().unwrap());
        assert!(unit.data[..SECTOR_SIZE].iter().all(|&b| b == 6));
        assert!(unit.data[SECTOR_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_eof_after_last_sector() {
        let mut reader = MockSectorReader::new();
        reader.expect_read_sectors().times(2).returning(|_, _, _| Ok(2));
        let mut source = CddaSource::new(reader, 0, 3);
        unit(source.read().unwrap());
        unit(source.read().unwrap());
        assert!(matches!(source.read().unwrap(), Fetched::Eof));
    }

    #[test]
    fn test_eject_ends_session() {
        let mut reader = MockSectorReader::new();
        reader.expect_read_sectors().returning(|_, _, _| Ok(2));
        reader.expect_eject().times(1).returning(|| Ok(()));

        let mut cfg = Config::default();
        cfg.pipe.max_packets = 4;
        cfg.pipe.min_packets = 0;
        let pipe = MediaPipe::new("cdda-test", &cfg, &MediaService::new());
        pipe.configure(Capabilities::CAN_EJECT, pipe.buffer_mode(), None);
        pipe.set_stream(StreamKind::Audio, 0);

        let producer = {
            let pipe = pipe.clone();
            std::thread::spawn(move || Producer::new(&pipe, CddaSource::new(reader, 0, 100_000)).run(false))
        };
        pipe.enqueue_event(Event::Eject);
        assert_eq!(producer.join().unwrap(), Event::Eject);
        assert_eq!(pipe.total_packets(), 0);
    }

    #[test]
    fn test_parse_descriptor() {
        assert_eq!(
            CddaBackend::parse("cdda:///tmp/disc.bin#150-20000").unwrap(),
            ("/tmp/disc.bin", Some((150, 20000)))
        );
        assert_eq!(CddaBackend::parse("cdda:///tmp/disc.bin").unwrap(), ("/tmp/disc.bin", None));
        assert!(CddaBackend::parse("cdda:///tmp/disc.bin#9-1").is_err());
    }

    #[test]
    fn test_image_reader() {
        let path = std::env::temp_dir().join(format!("showtime-cdda-{}.bin", std::process::id()));
        let mut image = vec![0u8; SECTOR_SIZE * 3];
        image[SECTOR_SIZE..].fill(5);
        std::fs::write(&path, &image).unwrap();

        let mut reader = ImageReader::open(path.to_str().unwrap()).unwrap();
        assert_eq!(reader.sector_count(), 3);
        let mut buf = vec![0u8; SECTOR_SIZE * 2];
        assert_eq!(reader.read_sectors(2, 2, &mut buf).unwrap(), 1);
        assert!(buf[..SECTOR_SIZE].iter().all(|&b| b == 5));
        std::fs::remove_file(&path).ok();
    }
}
