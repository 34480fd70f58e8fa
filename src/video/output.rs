use crate::config::SyncConfig;
use crate::media::{ControlCmd, MediaBuffer, MediaPipe, SkipMode, StreamKind, pts_is_set};
use crate::sync::{AvDiffStatus, AvSync, FrameRateEstimator, SyncStats, avtime};
use anyhow::Result;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub use crate::audio::output::Step;

/// A decoded picture, as far as pacing is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub pts: i64,
    pub epoch: u32,
    /// Nominal duration, 0 when the decoder does not know it
    pub duration: i64,
}

/// External decoder and renderer
pub trait VideoSink: Send {
    /// Feed one encoded buffer; returns a frame once one is ready
    fn decode(&mut self, buf: &MediaBuffer) -> Result<Option<VideoFrame>>;

    /// Show `frame` for `display_us` of wallclock time
    fn present(&mut self, frame: &VideoFrame, display_us: i64) -> Result<()>;

    fn flush(&mut self);
}

/// Sink without a display: every timestamped buffer counts as one
/// picture. Keeps the pacing loop running when no renderer is attached.
#[derive(Debug, Default)]
pub struct HeadlessSink {
    presented: u64,
}

impl HeadlessSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl VideoSink for HeadlessSink {
    fn decode(&mut self, buf: &MediaBuffer) -> Result<Option<VideoFrame>> {
        Ok(pts_is_set(buf.pts).then(|| VideoFrame {
            pts: buf.pts,
            epoch: buf.epoch,
            duration: buf.duration,
        }))
    }

    fn present(&mut self, _frame: &VideoFrame, _display_us: i64) -> Result<()> {
        self.presented += 1;
        Ok(())
    }

    fn flush(&mut self) {}
}

/// Video consumer: decodes through a [`VideoSink`] and paces frames
/// against the pipe's audio clock.
pub struct VideoOutput {
    pipe: Arc<MediaPipe>,
    sink: Box<dyn VideoSink>,
    sync: AvSync,
    fps: FrameRateEstimator,
    default_frame_duration: i64,
    /// Wallclock (avtime) at which the next frame is due
    next_display: Option<i64>,
    realtime: bool,
}

impl VideoOutput {
    /// Frames due further in the past than this restart the schedule
    const MAX_LAG: i64 = 1_000_000;

    pub fn new(pipe: &Arc<MediaPipe>, sink: Box<dyn VideoSink>, config: &SyncConfig) -> Self {
        Self {
            pipe: pipe.clone(),
            sink,
            sync: AvSync::new(config.clone()),
            fps: FrameRateEstimator::default(),
            default_frame_duration: config.default_frame_duration,
            next_display: None,
            realtime: true,
        }
    }

    /// Present as fast as frames arrive instead of sleeping until due
    pub fn without_pacing(mut self) -> Self {
        self.realtime = false;
        self
    }

    pub fn stats(&self) -> SyncStats {
        self.sync.stats()
    }

    pub fn spawn(mut self) -> std::io::Result<thread::JoinHandle<SyncStats>> {
        thread::Builder::new()
            .name(format!("{}-video", self.pipe.name()))
            .spawn(move || {
                loop {
                    let buf = self.pipe.dequeue(StreamKind::Video);
                    match self.process(buf) {
                        Ok(Step::Exit) => break,
                        Ok(Step::Continue) => {}
                        Err(e) => warn!("{}: video output: {:#}", self.pipe.name(), e),
                    }
                }
                let stats = self.sync.stats();
                debug!(
                    "{}: video output finished, {} frames judged, {} dropped, {} held",
                    self.pipe.name(),
                    stats.frames_judged,
                    stats.video_frames_dropped,
                    stats.video_frames_held
                );
                stats
            })
    }

    pub fn process(&mut self, buf: MediaBuffer) -> Result<Step> {
        self.process_at(buf, avtime())
    }

    /// Handle one dequeued buffer with `now` as the current wallclock
    pub fn process_at(&mut self, buf: MediaBuffer, now: i64) -> Result<Step> {
        if let Some(cmd) = buf.control_cmd() {
            trace!("{}: video control {:?}", self.pipe.name(), cmd);
            match cmd {
                ControlCmd::Exit => return Ok(Step::Exit),
                ControlCmd::Flush { .. } => {
                    self.sink.flush();
                    self.fps.reset();
                    self.next_display = None;
                }
                ControlCmd::Pause => {}
                ControlCmd::Play => self.next_display = None,
            }
            return Ok(Step::Continue);
        }

        if buf.stream != self.pipe.stream(StreamKind::Video) {
            return Ok(Step::Continue);
        }

        // discarded pictures still go through the decoder for its references
        let frame = self.sink.decode(&buf)?;
        if buf.skip == SkipMode::Discard {
            return Ok(Step::Continue);
        }
        match frame {
            Some(frame) => self.show(frame, now),
            None => Ok(Step::Continue),
        }
    }

    fn show(&mut self, frame: VideoFrame, now: i64) -> Result<Step> {
        let estimated = self.fps.observe(frame.pts);
        let base = if frame.duration > 0 {
            frame.duration
        } else {
            estimated.unwrap_or(self.default_frame_duration)
        };

        let clock = self.pipe.clock().snapshot();
        let plan = self.sync.plan(&clock, frame.pts, frame.epoch, base, now);

        if plan.status == AvDiffStatus::CatchUp {
            trace!("{}: dropping frame {} to catch up", self.pipe.name(), frame.pts);
            return Ok(Step::Continue);
        }

        // consuming more stream time than nominal means showing it shorter
        let mut display_us = base - (plan.output_duration - base);
        if plan.status == AvDiffStatus::Hold {
            display_us += base;
        }

        let due = match self.next_display {
            Some(due) if now - due < Self::MAX_LAG => due,
            _ => now,
        };
        if self.realtime && due > now {
            thread::sleep(Duration::from_micros((due - now) as u64));
        }
        self.next_display = Some(due + display_us);

        if pts_is_set(frame.pts) {
            trace!(
                "{}: frame {} for {}us ({:?}, drift {}us)",
                self.pipe.name(),
                frame.pts,
                display_us,
                plan.status,
                self.sync.avdiff()
            );
        }
        self.sink.present(&frame, display_us)?;
        Ok(Step::Continue)
    }
}
