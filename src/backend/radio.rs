use super::file::SymphoniaSource;
use super::{Backend, strip_scheme};
use crate::event::Event;
use crate::media::{
    Capabilities, HoldFlags, MediaError, MediaPipe, Result, StreamKind, pts_is_set, rescale,
};
use crate::producer::{Fetched, Producer, Source};
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::probe::Hint;
use tracing::{info, warn};

/// Opens the byte stream behind a live source
#[cfg_attr(test, mockall::automock)]
pub trait StreamOpener: Send {
    fn open(&mut self, location: &str) -> Result<Box<dyn Read + Send + Sync>>;
}

/// Local FIFOs and files, reopened whenever they run dry
#[derive(Debug, Default)]
pub struct FileOpener;

impl StreamOpener for FileOpener {
    fn open(&mut self, location: &str) -> Result<Box<dyn Read + Send + Sync>> {
        let file = File::open(location).map_err(|e| MediaError::Open(format!("{location}: {e}")))?;
        Ok(Box::new(file))
    }
}

/// A live stream that reconnects on loss and closes while paused
pub struct RadioSource<O: StreamOpener> {
    opener: O,
    location: String,
    pipe: Arc<MediaPipe>,
    current: Option<SymphoniaSource>,
    paused: bool,
    /// End of the last unit read, microseconds
    next_pts: i64,
    retry: Duration,
    announced: bool,
}

impl<O: StreamOpener> RadioSource<O> {
    pub fn new(opener: O, location: impl Into<String>, pipe: &Arc<MediaPipe>, retry: Duration) -> Self {
        Self {
            opener,
            location: location.into(),
            pipe: pipe.clone(),
            current: None,
            paused: false,
            next_pts: 0,
            retry,
            announced: false,
        }
    }

    fn connect(&mut self) -> Result<SymphoniaSource> {
        self.pipe.props().set("loading", true);
        let opened = self.opener.open(&self.location).and_then(|reader| {
            let mss = MediaSourceStream::new(Box::new(ReadOnlySource::new(reader)), Default::default());
            SymphoniaSource::open(mss, &Hint::new(), &self.location)
        });
        self.pipe.props().set("loading", false);

        let mut source = opened?;
        source.set_offset(self.next_pts);
        if !self.announced {
            source.announce(&self.pipe);
            self.announced = true;
        }
        info!("{}: connected", self.location);
        Ok(source)
    }
}

impl<O: StreamOpener> Source for RadioSource<O> {
    fn read(&mut self) -> Result<Fetched> {
        if self.paused {
            return Ok(Fetched::Idle);
        }

        if self.current.is_none() {
            match self.connect() {
                Ok(source) => self.current = Some(source),
                Err(e) => {
                    warn!("{}: connect failed: {}, retrying", self.location, e);
                    return Ok(Fetched::Backoff(self.retry));
                }
            }
        }
        let Some(current) = self.current.as_mut() else {
            return Ok(Fetched::Again);
        };

        match current.read() {
            Ok(Fetched::Unit(unit)) => {
                if pts_is_set(unit.pts) {
                    self.next_pts = rescale(unit.pts + unit.duration, unit.time_base);
                }
                Ok(Fetched::Unit(unit))
            }
            Ok(Fetched::Eof) | Err(_) => {
                warn!("{}: stream lost, reconnecting", self.location);
                self.current = None;
                Ok(Fetched::Backoff(self.retry))
            }
            Ok(other) => Ok(other),
        }
    }

    fn seek(&mut self, _target: i64) -> Result<()> {
        Ok(())
    }

    fn on_hold(&mut self, _held: bool) -> bool {
        let paused = self.pipe.hold_flags().contains(HoldFlags::PAUSE);
        if paused == self.paused {
            return false;
        }
        self.paused = paused;
        if paused {
            info!("{}: paused, closing stream", self.location);
            self.current = None;
        }
        paused
    }
}

/// `radio://<path>`: live streams read from a local FIFO or file
#[derive(Debug)]
pub struct RadioBackend {
    retry: Duration,
}

impl RadioBackend {
    pub fn new() -> Self {
        Self {
            retry: Duration::from_secs(1),
        }
    }
}

impl Default for RadioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for RadioBackend {
    fn name(&self) -> &'static str {
        "radio"
    }

    fn can_handle(&self, descriptor: &str) -> bool {
        strip_scheme(descriptor, "radio").is_some()
    }

    fn play(&self, descriptor: &str, pipe: &Arc<MediaPipe>, hold: bool) -> Result<Event> {
        let location = strip_scheme(descriptor, "radio").unwrap_or(descriptor);
        pipe.set_stream(StreamKind::Audio, 0);
        pipe.set_stream(StreamKind::Video, -1);
        pipe.set_stream(StreamKind::Subtitle, -1);
        pipe.configure(
            Capabilities::CAN_PAUSE | Capabilities::PRE_BUFFERING | Capabilities::FLUSH_ON_HOLD,
            pipe.buffer_mode(),
            None,
        );

        let source = RadioSource::new(FileOpener, location, pipe, self.retry);
        Ok(Producer::new(pipe, source).run(hold))
    }
}
