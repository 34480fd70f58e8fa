//! Demux side of a playback session.
//!
//! Every backend wraps its input in a [`Source`] and hands it to a
//! [`Producer`], which runs the fetch / push / drain state machine against a
//! [`MediaPipe`] and returns the event that ended the session.

use crate::event::Event;
use crate::media::{
    BufferType, Capabilities, CodecRef, HoldFlags, MediaBuffer, MediaPipe, OutputHints, PTS_UNSET,
    Preempted, Rational, Result, StreamKind, pts_is_set, rescale,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// One encoded unit read from a source, timestamps in the source's time base
#[derive(Debug)]
pub struct SourceUnit {
    pub kind: StreamKind,
    pub buffer_type: BufferType,
    pub stream: i32,
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub time_base: Rational,
    pub keyframe: bool,
    pub codec: Option<CodecRef>,
    pub hints: OutputHints,
}

impl SourceUnit {
    pub fn new(kind: StreamKind, stream: i32, data: Bytes, time_base: Rational) -> Self {
        let buffer_type = match kind {
            StreamKind::Audio => BufferType::Audio,
            StreamKind::Video => BufferType::Video,
            StreamKind::Subtitle => BufferType::Subtitle,
        };
        Self {
            kind,
            buffer_type,
            stream,
            data,
            pts: PTS_UNSET,
            dts: PTS_UNSET,
            duration: 0,
            time_base,
            keyframe: true,
            codec: None,
            hints: OutputHints::default(),
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_codec(mut self, codec: Option<CodecRef>) -> Self {
        self.codec = codec;
        self
    }
}

/// Result of asking a source for more data
#[derive(Debug)]
pub enum Fetched {
    Unit(SourceUnit),
    /// Nothing produced this time, ask again
    Again,
    /// Wait before asking again; events cut the wait short
    Backoff(Duration),
    /// Nothing to do until an event arrives
    Idle,
    Eof,
}

/// Input side of a producer
pub trait Source: Send {
    /// Read the next unit. Errors end the session like EOF does.
    fn read(&mut self) -> Result<Fetched>;

    /// Reposition to `target` (microseconds, already clamped to
    /// [`start_time`](Self::start_time))
    fn seek(&mut self, target: i64) -> Result<()>;

    /// Earliest valid timestamp, microseconds
    fn start_time(&self) -> i64 {
        0
    }

    /// Hold state changed; return true to drop a pending buffer
    fn on_hold(&mut self, _held: bool) -> bool {
        false
    }

    fn eject(&mut self) -> Result<()> {
        Ok(())
    }
}

enum State {
    Fetching,
    HaveBuffer(StreamKind, MediaBuffer),
    Waiting(Option<Duration>),
    Draining,
    Terminated(Event),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Fetching => "fetching",
            State::HaveBuffer(..) => "have-buffer",
            State::Waiting(_) => "waiting",
            State::Draining => "draining",
            State::Terminated(_) => "terminated",
        }
    }
}

/// Runs a [`Source`] against a pipe
pub struct Producer<S: Source> {
    pipe: Arc<MediaPipe>,
    source: S,
    paused: bool,
    lost_focus: bool,
    eof: bool,
}

impl<S: Source> Producer<S> {
    pub fn new(pipe: &Arc<MediaPipe>, source: S) -> Self {
        Self {
            pipe: pipe.clone(),
            source,
            paused: false,
            lost_focus: false,
            eof: false,
        }
    }

    /// Run until an event ends the session. The source is dropped on
    /// return, releasing its codec and format references.
    pub fn run(mut self, hold: bool) -> Event {
        let _guard = self.pipe.attach_producer();
        // a pipe reused across sessions may still carry the last pause
        self.set_paused(hold);

        let mut state = State::Fetching;
        let event = loop {
            state = match state {
                State::Fetching => self.fetch(),
                State::HaveBuffer(kind, buf) => match self.pipe.enqueue_with_events(kind, buf) {
                    Ok(()) => State::Fetching,
                    Err(Preempted { event, buffer }) => self.dispatch(event, Some((kind, buffer))),
                },
                State::Waiting(timeout) => {
                    let event = match timeout {
                        Some(t) => self.pipe.dequeue_event_deadline(t),
                        None => Some(self.pipe.dequeue_event()),
                    };
                    match event {
                        Some(e) => self.dispatch(e, None),
                        None => State::Fetching,
                    }
                }
                State::Draining => match self.pipe.wait_for_empty_queues() {
                    None => State::Terminated(Event::Eof),
                    Some(e) => self.dispatch(e, None),
                },
                State::Terminated(event) => break event,
            };
            trace!("{}: -> {}", self.pipe.name(), state.name());
        };

        debug!("{}: producer finished with {}", self.pipe.name(), event);
        event
    }

    fn fetch(&mut self) -> State {
        match self.source.read() {
            Ok(Fetched::Unit(unit)) => {
                if self.pipe.stream(unit.kind) != unit.stream {
                    trace!(
                        "{}: dropping unit of unselected {} stream {}",
                        self.pipe.name(),
                        unit.kind.name(),
                        unit.stream
                    );
                    return State::Fetching;
                }
                let kind = unit.kind;
                State::HaveBuffer(kind, self.build(unit))
            }
            Ok(Fetched::Again) => State::Fetching,
            Ok(Fetched::Backoff(d)) => State::Waiting(Some(d)),
            Ok(Fetched::Idle) => State::Waiting(None),
            Ok(Fetched::Eof) => {
                debug!("{}: end of stream", self.pipe.name());
                self.begin_drain()
            }
            Err(e) => {
                warn!("{}: read failed: {}", self.pipe.name(), e);
                self.begin_drain()
            }
        }
    }

    fn build(&mut self, unit: SourceUnit) -> MediaBuffer {
        let pts = rescale(unit.pts, unit.time_base);
        let dts = rescale(unit.dts, unit.time_base);
        let duration = if pts_is_set(unit.duration) {
            rescale(unit.duration, unit.time_base)
        } else {
            0
        };

        let mut buf = MediaBuffer::alloc(unit.buffer_type, unit.data, pts, dts, duration, unit.codec)
            .with_stream(unit.stream)
            .with_drive_clock(unit.kind == StreamKind::Audio && pts_is_set(pts));
        buf.keyframe = unit.keyframe;
        buf.hints = unit.hints;
        buf.skip = self.pipe.skip_for(unit.kind, pts);
        if pts_is_set(pts) {
            buf.user_time = pts - self.source.start_time();
        }
        buf
    }

    fn begin_drain(&mut self) -> State {
        self.eof = true;
        self.pipe.set_eof(true);
        State::Draining
    }

    /// Where to go after an event that does not end the session
    fn resume(&self, pending: Option<(StreamKind, MediaBuffer)>) -> State {
        match pending {
            Some((kind, buf)) => State::HaveBuffer(kind, buf),
            None if self.eof => State::Draining,
            None => State::Fetching,
        }
    }

    fn dispatch(&mut self, event: Event, pending: Option<(StreamKind, MediaBuffer)>) -> State {
        debug!("{}: event {}", self.pipe.name(), event);
        match event {
            Event::Seek(_)
            | Event::SeekForward
            | Event::SeekBackward
            | Event::SeekFastForward
            | Event::SeekFastBackward
            | Event::RestartTrack => match self.seek_target(&event) {
                Some(target) => {
                    self.seek(target);
                    State::Fetching
                }
                None => self.resume(pending),
            },

            Event::Play | Event::Pause | Event::PlayPause => {
                let paused = match event {
                    Event::Play => false,
                    Event::Pause => true,
                    _ => !self.paused,
                };
                self.lost_focus = false;
                self.set_paused(paused);
                self.resume(pending)
            }

            Event::InternalPause(msg) => {
                self.paused = true;
                self.pipe.hold(HoldFlags::PAUSE, Some(&msg));
                self.resume(pending)
            }

            Event::MpNoLongerPrimary => {
                if !self.paused {
                    self.lost_focus = true;
                    self.set_paused(true);
                }
                self.resume(pending)
            }

            Event::MpIsPrimary => {
                if self.lost_focus {
                    self.lost_focus = false;
                    self.set_paused(false);
                }
                self.resume(pending)
            }

            Event::Hold(held) => {
                let pending = if self.source.on_hold(held) { None } else { pending };
                self.resume(pending)
            }

            Event::SelectAudioTrack(id) => self.select(StreamKind::Audio, id, pending),
            Event::SelectSubtitleTrack(id) => self.select(StreamKind::Subtitle, id, pending),

            Event::Eject => {
                if !self.pipe.capabilities().contains(Capabilities::CAN_EJECT) {
                    return self.resume(pending);
                }
                self.pipe.flush();
                if let Err(e) = self.source.eject() {
                    warn!("{}: eject failed: {}", self.pipe.name(), e);
                }
                State::Terminated(Event::Eject)
            }

            Event::Stop | Event::Prev | Event::Next | Event::PlayqueueJump(_) => {
                self.pipe.flush();
                State::Terminated(event)
            }

            Event::Eof => State::Terminated(Event::Eof),
        }
    }

    fn seek_target(&self, event: &Event) -> Option<i64> {
        if !self.pipe.capabilities().contains(Capabilities::CAN_SEEK) {
            debug!("{}: source not seekable", self.pipe.name());
            return None;
        }
        let cfg = self.pipe.seek_config();
        let base = self.pipe.seek_base();
        let step = cfg.step_ms * 1000;
        let fast = cfg.fast_step_ms * 1000;
        let target = match event {
            Event::Seek(ts) => *ts,
            Event::SeekForward => base + step,
            Event::SeekBackward => base - step,
            Event::SeekFastForward => base + fast,
            Event::SeekFastBackward => base - fast,
            Event::RestartTrack => 0,
            _ => return None,
        };
        Some(target.max(self.source.start_time()))
    }

    fn seek(&mut self, target: i64) {
        self.pipe.flush_for_seek(target);
        if let Err(e) = self.source.seek(target) {
            warn!("{}: seek to {} failed: {}", self.pipe.name(), target, e);
        }
        self.eof = false;
        self.pipe.set_eof(false);
    }

    fn select(
        &mut self,
        kind: StreamKind,
        stream: i32,
        pending: Option<(StreamKind, MediaBuffer)>,
    ) -> State {
        self.pipe.select_stream(kind, stream);
        let pending = pending.filter(|(k, b)| *k != kind || b.stream == stream);
        self.resume(pending)
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        if paused {
            self.pipe.hold(HoldFlags::PAUSE, None);
        } else {
            self.pipe.unhold(HoldFlags::PAUSE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::media::{BufferMode, ControlCmd, MediaService, SkipMode};
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Instant;

    /// Plays back a fixed list of (kind, stream, pts) units
    struct ScriptedSource {
        units: Vec<(StreamKind, i32, i64)>,
        pos: usize,
        start: i64,
        seeks: Arc<Mutex<Vec<i64>>>,
    }

    impl ScriptedSource {
        fn new(units: Vec<(StreamKind, i32, i64)>) -> Self {
            Self {
                units,
                pos: 0,
                start: 0,
                seeks: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn audio(count: i64, step: i64) -> Self {
            Self::new((0..count).map(|i| (StreamKind::Audio, 0, i * step)).collect())
        }
    }

    impl Source for ScriptedSource {
        fn read(&mut self) -> Result<Fetched> {
            let Some(&(kind, stream, pts)) = self.units.get(self.pos) else {
                return Ok(Fetched::Eof);
            };
            self.pos += 1;
            Ok(Fetched::Unit(
                SourceUnit::new(kind, stream, Bytes::from(vec![0u8; 64]), Rational::MICROS)
                    .with_pts(pts)
                    .with_dts(pts)
                    .with_duration(20_000),
            ))
        }

        fn seek(&mut self, target: i64) -> Result<()> {
            self.seeks.lock().push(target);
            self.pos = self
                .units
                .iter()
                .position(|u| u.2 >= target)
                .unwrap_or(self.units.len());
            Ok(())
        }

        fn start_time(&self) -> i64 {
            self.start
        }
    }

    fn pipe(max_packets: usize) -> Arc<MediaPipe> {
        let mut cfg = Config::default();
        cfg.pipe.max_packets = max_packets;
        cfg.pipe.min_packets = 0;
        let pipe = MediaPipe::new("producer-test", &cfg, &MediaService::new());
        pipe.configure(
            Capabilities::CAN_SEEK | Capabilities::CAN_PAUSE,
            BufferMode::Deep,
            None,
        );
        pipe.set_stream(StreamKind::Audio, 0);
        pipe.set_stream(StreamKind::Video, 0);
        pipe
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn spawn<S: Source + 'static>(pipe: &Arc<MediaPipe>, source: S) -> thread::JoinHandle<Event> {
        let pipe = pipe.clone();
        thread::spawn(move || Producer::new(&pipe, source).run(false))
    }

    fn next_data(pipe: &MediaPipe, kind: StreamKind) -> Option<MediaBuffer> {
        loop {
            let b = pipe.dequeue_deadline(kind, Duration::from_secs(2))?;
            if !b.is_control() {
                return Some(b);
            }
        }
    }

    #[test]
    fn test_plays_to_eof() {
        let pipe = pipe(1000);
        let producer = spawn(&pipe, ScriptedSource::audio(10, 20_000));
        for i in 0..10 {
            let b = next_data(&pipe, StreamKind::Audio).unwrap();
            assert_eq!(b.pts, i * 20_000);
            assert!(b.drive_clock);
            assert_eq!(b.skip, SkipMode::Deliver);
        }
        assert_eq!(producer.join().unwrap(), Event::Eof);
    }

    #[test]
    fn test_seek_flushes_and_marks_resume() {
        let pipe = pipe(4);
        let source = ScriptedSource::audio(500, 20_000);
        let seeks = source.seeks.clone();
        let producer = spawn(&pipe, source);

        wait_until("pipe full", || pipe.total_packets() == 4);
        let epoch = pipe.epoch();
        pipe.enqueue_event(Event::Seek(5_000_000));
        wait_until("seek", || pipe.epoch() > epoch);

        assert_eq!(
            pipe.dequeue(StreamKind::Audio).control_cmd(),
            Some(ControlCmd::Flush { seek: true })
        );
        let first = next_data(&pipe, StreamKind::Audio).unwrap();
        assert_eq!(first.skip, SkipMode::Resume);
        assert!(first.pts >= 5_000_000);
        assert_eq!(first.epoch, pipe.epoch());
        let second = next_data(&pipe, StreamKind::Audio).unwrap();
        assert_eq!(second.skip, SkipMode::Deliver);
        assert_eq!(*seeks.lock(), vec![5_000_000]);

        pipe.enqueue_event(Event::Stop);
        assert_eq!(producer.join().unwrap(), Event::Stop);
    }

    #[test]
    fn test_seek_before_start_is_clamped() {
        let pipe = pipe(4);
        let mut source = ScriptedSource::new(
            (0..100)
                .map(|i| (StreamKind::Audio, 0, 1_000_000 + i * 20_000))
                .collect(),
        );
        source.start = 1_000_000;
        let seeks = source.seeks.clone();
        let producer = spawn(&pipe, source);

        wait_until("pipe full", || pipe.total_packets() == 4);
        let epoch = pipe.epoch();
        pipe.enqueue_event(Event::Seek(200_000));
        wait_until("seek", || pipe.epoch() > epoch);

        let first = next_data(&pipe, StreamKind::Audio).unwrap();
        assert_eq!(first.pts, 1_000_000);
        assert_eq!(first.skip, SkipMode::Resume);
        assert_eq!(first.user_time, 0);
        assert_eq!(*seeks.lock(), vec![1_000_000]);

        pipe.enqueue_event(Event::Stop);
        producer.join().unwrap();
    }

    #[test]
    fn test_stop_while_draining() {
        let pipe = pipe(1000);
        let producer = spawn(&pipe, ScriptedSource::audio(3, 20_000));

        wait_until("eof", || pipe.props().get_int("eof") == Some(1));
        assert_eq!(pipe.queued_packets(StreamKind::Audio), 3);

        pipe.enqueue_event(Event::Stop);
        assert_eq!(producer.join().unwrap(), Event::Stop);
        assert_eq!(pipe.total_packets(), 0);
        assert_eq!(pipe.total_bytes(), 0);
    }

    #[test]
    fn test_audio_track_switch() {
        let pipe = pipe(4);
        pipe.set_stream(StreamKind::Audio, 1);
        let mut units = Vec::new();
        for i in 0..50 {
            units.push((StreamKind::Audio, 1, i * 20_000));
            units.push((StreamKind::Audio, 2, i * 20_000));
            units.push((StreamKind::Video, 0, i * 40_000));
        }
        let producer = spawn(&pipe, ScriptedSource::new(units));

        wait_until("pipe full", || pipe.total_packets() == 4);
        let video_before = pipe.queued_packets(StreamKind::Video);
        assert!(video_before > 0);
        pipe.enqueue_event(Event::SelectAudioTrack(2));
        wait_until("select", || pipe.stream(StreamKind::Audio) == 2);
        assert!(pipe.queued_packets(StreamKind::Video) >= video_before);

        assert_eq!(next_data(&pipe, StreamKind::Video).unwrap().pts, 0);

        let mut audio = Vec::new();
        let mut video = 1;
        while !producer.is_finished() || pipe.total_packets() > 0 {
            if let Some(b) = pipe.dequeue_deadline(StreamKind::Audio, Duration::from_millis(5)) {
                if !b.is_control() {
                    audio.push(b.stream);
                }
            }
            if let Some(b) = pipe.dequeue_deadline(StreamKind::Video, Duration::from_millis(5)) {
                if !b.is_control() {
                    video += 1;
                }
            }
        }
        assert_eq!(producer.join().unwrap(), Event::Eof);
        assert!(!audio.is_empty());
        assert!(audio.iter().all(|&s| s == 2));
        assert_eq!(video, 50);
    }

    #[test]
    fn test_pause_keeps_pending_buffer() {
        let pipe = pipe(2);
        let producer = spawn(&pipe, ScriptedSource::audio(10, 20_000));
        wait_until("pipe full", || pipe.total_packets() == 2);

        pipe.enqueue_event(Event::Pause);
        wait_until("hold", || pipe.is_held());
        pipe.enqueue_event(Event::Play);
        wait_until("unhold", || !pipe.is_held());

        let mut seen = Vec::new();
        while let Some(b) = next_data(&pipe, StreamKind::Audio) {
            seen.push(b.pts);
            if seen.len() == 10 {
                break;
            }
        }
        assert_eq!(seen, (0..10).map(|i| i * 20_000).collect::<Vec<_>>());
        assert_eq!(producer.join().unwrap(), Event::Eof);
    }

    #[test]
    fn test_losing_primary_holds_until_regained() {
        let pipe = pipe(2);
        let producer = spawn(&pipe, ScriptedSource::audio(10, 20_000));
        wait_until("pipe full", || pipe.total_packets() == 2);

        pipe.enqueue_event(Event::MpNoLongerPrimary);
        wait_until("hold", || pipe.is_held());
        pipe.enqueue_event(Event::MpIsPrimary);
        wait_until("unhold", || !pipe.is_held());

        pipe.enqueue_event(Event::Next);
        assert_eq!(producer.join().unwrap(), Event::Next);
    }

    #[test]
    fn test_new_session_clears_stale_pause() {
        let pipe = pipe(10);
        pipe.hold(HoldFlags::PAUSE, None);

        let handle = {
            let pipe = pipe.clone();
            thread::spawn(move || Producer::new(&pipe, Idle).run(false))
        };
        wait_until("unhold", || !pipe.is_held());

        pipe.enqueue_event(Event::PlayPause);
        wait_until("hold", || pipe.hold_flags().contains(HoldFlags::PAUSE));
        pipe.enqueue_event(Event::Stop);
        assert_eq!(handle.join().unwrap(), Event::Stop);
    }

    #[test]
    fn test_hold_starts_paused() {
        let pipe = pipe(10);
        let handle = {
            let pipe = pipe.clone();
            thread::spawn(move || Producer::new(&pipe, Idle).run(true))
        };
        wait_until("hold", || pipe.hold_flags().contains(HoldFlags::PAUSE));

        pipe.enqueue_event(Event::PlayPause);
        wait_until("unhold", || !pipe.is_held());
        pipe.enqueue_event(Event::Stop);
        assert_eq!(handle.join().unwrap(), Event::Stop);
    }

    /// Never produces anything, the producer just waits for events
    struct Idle;

    impl Source for Idle {
        fn read(&mut self) -> Result<Fetched> {
            Ok(Fetched::Idle)
        }
        fn seek(&mut self, _target: i64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_error_drains_as_eof() {
        struct Failing;
        impl Source for Failing {
            fn read(&mut self) -> Result<Fetched> {
                Err(crate::media::MediaError::Format("corrupt packet".into()))
            }
            fn seek(&mut self, _target: i64) -> Result<()> {
                Ok(())
            }
        }
        let pipe = pipe(10);
        assert_eq!(Producer::new(&pipe, Failing).run(false), Event::Eof);
    }
}
