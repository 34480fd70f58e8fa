//! Audio/video synchronization: audio clock plus drift correction for video

pub mod clock;
pub mod kalman;

pub use clock::{AudioClock, ClockSnapshot, avtime};
pub use kalman::KalmanFilter;

use crate::config::SyncConfig;
use crate::media::pts_is_set;

/// Outcome of comparing a video frame against the audio clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvDiffStatus {
    /// Small drift, corrected through the output duration
    Locked,
    /// No usable clock or the drift is an outlier; frame runs unadjusted
    NoLock,
    /// Clock belongs to another epoch than the frame
    IncorrectEpoch,
    /// Video is ahead of audio, repeat the current frame
    Hold,
    /// Video lags audio, drop frames to catch up
    CatchUp,
}

/// Presentation decision for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePlan {
    pub status: AvDiffStatus,
    /// Stream time consumed by this display period, microseconds
    pub output_duration: i64,
}

/// Synchronization statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub frames_judged: u64,
    pub video_frames_dropped: u64,
    pub video_frames_held: u64,
    pub sync_corrections: u64,
    pub filter_resets: u64,
    pub current_drift_ms: i64,
    pub avg_drift_ms: f64,
}

/// Drift estimator for one video output.
///
/// Feeds `audio_now - (pts - latency)` into a Kalman filter and turns the
/// smoothed offset into a bounded per-frame correction. The filter is reset
/// whenever the epoch changes or an outlier shows up.
pub struct AvSync {
    config: SyncConfig,
    filter: KalmanFilter,
    avdiff: i64,
    avdiff_x: f64,
    last_epoch: Option<u32>,
    stats: SyncStats,
}

impl AvSync {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            filter: KalmanFilter::new(config.kalman_q, config.kalman_r),
            config,
            avdiff: 0,
            avdiff_x: 0.0,
            last_epoch: None,
            stats: SyncStats::default(),
        }
    }

    /// Compare a frame against the clock and update the filter.
    ///
    /// # Arguments
    /// * `clock` - Snapshot of the pipe's audio clock
    /// * `pts` - Frame timestamp, may be unset
    /// * `epoch` - Epoch the frame was enqueued under
    /// * `frame_duration` - Nominal frame duration in microseconds
    /// * `now` - Current wallclock, see [`avtime`]
    pub fn compute_avdiff(
        &mut self,
        clock: &ClockSnapshot,
        pts: i64,
        epoch: u32,
        frame_duration: i64,
        now: i64,
    ) -> AvDiffStatus {
        self.stats.frames_judged += 1;

        if self.last_epoch != Some(epoch) {
            self.last_epoch = Some(epoch);
            self.reset_filter();
        }

        let Some(audio_now) = clock.now(now).filter(|_| pts_is_set(pts)) else {
            self.reset_filter();
            return AvDiffStatus::NoLock;
        };

        if clock.epoch != epoch {
            self.reset_filter();
            return AvDiffStatus::IncorrectEpoch;
        }

        let latency = frame_duration * self.config.latency_frames;
        self.avdiff = audio_now - (pts - latency);

        if self.avdiff.abs() >= self.config.outlier_threshold_us {
            tracing::debug!("A/V drift {}us is an outlier, resetting filter", self.avdiff);
            self.reset_filter();
            return AvDiffStatus::NoLock;
        }

        let clamp = self.config.clamp;
        self.avdiff_x = self
            .filter
            .update(self.avdiff as f64 / 1e6)
            .clamp(-clamp, clamp);

        let drift_ms = self.avdiff / 1000;
        self.stats.current_drift_ms = drift_ms;
        self.stats.avg_drift_ms = self.stats.avg_drift_ms * 0.9 + drift_ms as f64 * 0.1;

        let thres = self.config.status_threshold;
        if self.avdiff_x > thres {
            AvDiffStatus::CatchUp
        } else if self.avdiff_x < -thres {
            AvDiffStatus::Hold
        } else {
            AvDiffStatus::Locked
        }
    }

    /// Base duration plus a correction growing quadratically with the
    /// smoothed offset, saturating at the configured maximum
    pub fn output_duration(&self, frame_duration: i64) -> i64 {
        let x = self.avdiff_x;
        let max = self.config.max_correction_us as f64;
        let delta = (x.abs() * 1000.0).powi(2).min(max) as i64;
        if x > 0.0 {
            frame_duration + delta
        } else if x < 0.0 {
            frame_duration - delta
        } else {
            frame_duration
        }
    }

    /// Judge a frame and derive its output duration in one step
    pub fn plan(
        &mut self,
        clock: &ClockSnapshot,
        pts: i64,
        epoch: u32,
        frame_duration: i64,
        now: i64,
    ) -> FramePlan {
        let status = self.compute_avdiff(clock, pts, epoch, frame_duration, now);
        let output_duration = self.output_duration(frame_duration);

        match status {
            AvDiffStatus::CatchUp => self.stats.video_frames_dropped += 1,
            AvDiffStatus::Hold => self.stats.video_frames_held += 1,
            _ => {}
        }
        if output_duration != frame_duration {
            self.stats.sync_corrections += 1;
        }

        FramePlan {
            status,
            output_duration,
        }
    }

    /// Raw drift of the last judged frame, microseconds
    pub fn avdiff(&self) -> i64 {
        self.avdiff
    }

    /// Smoothed drift, seconds
    pub fn smoothed(&self) -> f64 {
        self.avdiff_x
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    fn reset_filter(&mut self) {
        self.filter.reset();
        self.avdiff_x = 0.0;
        self.stats.filter_resets += 1;
    }

    /// Forget everything, including the epoch
    pub fn reset(&mut self) {
        self.reset_filter();
        self.last_epoch = None;
        self.avdiff = 0;
        self.stats = SyncStats::default();
    }
}

/// Estimates nominal frame duration from successive timestamps
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameRateEstimator {
    last_pts: Option<i64>,
    delta: i64,
}

impl FrameRateEstimator {
    const MIN_DELTA: i64 = 10_000;
    const MAX_DELTA: i64 = 10_000_000;

    /// Observe a timestamp; returns the current estimate once one exists
    pub fn observe(&mut self, pts: i64) -> Option<i64> {
        if !pts_is_set(pts) {
            return self.estimate();
        }
        if let Some(last) = self.last_pts {
            let d = pts - last;
            if d > Self::MIN_DELTA && d < Self::MAX_DELTA {
                if self.delta == 0 {
                    self.delta = d;
                } else {
                    self.delta += (d - self.delta) >> 4;
                }
            }
        }
        self.last_pts = Some(pts);
        self.estimate()
    }

    pub fn estimate(&self) -> Option<i64> {
        (self.delta > 0).then_some(self.delta)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PTS_UNSET;

    const FRAME: i64 = 33_000;

    fn engine() -> AvSync {
        AvSync::new(SyncConfig::default())
    }

    /// Clock positioned so that frame `pts` is exactly on time at `now`
    fn in_sync_clock(pts: i64, now: i64, epoch: u32) -> ClockSnapshot {
        ClockSnapshot {
            audio_clock: pts - 2 * FRAME,
            avtime: now,
            epoch,
            avdelta: 0,
        }
    }

    #[test]
    fn test_locked_when_in_sync() {
        let mut sync = engine();
        for i in 0..100 {
            let pts = i * FRAME;
            let now = 1_000_000 + i * FRAME;
            let plan = sync.plan(&in_sync_clock(pts, now, 1), pts, 1, FRAME, now);
            assert_eq!(plan.status, AvDiffStatus::Locked);
            assert_eq!(plan.output_duration, FRAME);
        }
        assert_eq!(sync.stats().sync_corrections, 0);
    }

    #[test]
    fn test_video_late_consumes_more() {
        let mut sync = engine();
        let mut plan = None;
        for i in 0..50 {
            let pts = i * FRAME;
            let now = i * FRAME;
            // audio runs 40ms ahead
            let mut clock = in_sync_clock(pts, now, 1);
            clock.audio_clock += 40_000;
            plan = Some(sync.plan(&clock, pts, 1, FRAME, now));
        }
        let plan = plan.unwrap();
        assert_eq!(plan.status, AvDiffStatus::Locked);
        assert!(plan.output_duration > FRAME);
        assert!(plan.output_duration <= FRAME + 5000);
    }

    #[test]
    fn test_large_drift_saturates() {
        let mut sync = engine();
        let mut clock = in_sync_clock(0, 0, 1);
        clock.audio_clock -= 2_000_000;
        let mut last = None;
        for _ in 0..20 {
            last = Some(sync.plan(&clock, 0, 1, FRAME, 0));
        }
        let plan = last.unwrap();
        assert_eq!(plan.status, AvDiffStatus::Hold);
        assert_eq!(plan.output_duration, FRAME - 5000);
    }

    #[test]
    fn test_epoch_change_discards_filter() {
        let mut sync = engine();
        let mut clock = in_sync_clock(0, 0, 1);
        clock.audio_clock += 3_000_000;
        for _ in 0..30 {
            sync.plan(&clock, 0, 1, FRAME, 0);
        }
        assert!(sync.smoothed() > 2.0);

        // seek: frame now belongs to epoch 2 and jumps far ahead, clock is stale
        let plan = sync.plan(&clock, 600_000_000, 2, FRAME, 0);
        assert_eq!(plan.status, AvDiffStatus::IncorrectEpoch);
        assert_eq!(plan.output_duration, FRAME);
        assert_eq!(sync.smoothed(), 0.0);
    }

    #[test]
    fn test_outlier_runs_unadjusted() {
        let mut sync = engine();
        let clock = in_sync_clock(0, 0, 4);
        let plan = sync.plan(&clock, 50_000_000, 4, FRAME, 0);
        assert_eq!(plan.status, AvDiffStatus::NoLock);
        assert_eq!(plan.output_duration, FRAME);
    }

    #[test]
    fn test_no_clock_or_no_pts() {
        let mut sync = engine();
        let plan = sync.plan(&ClockSnapshot::default(), 0, 1, FRAME, 0);
        assert_eq!(plan.status, AvDiffStatus::NoLock);
        let plan = sync.plan(&in_sync_clock(0, 0, 1), PTS_UNSET, 1, FRAME, 0);
        assert_eq!(plan.status, AvDiffStatus::NoLock);
        assert_eq!(plan.output_duration, FRAME);
    }

    #[test]
    fn test_frame_rate_estimator() {
        let mut est = FrameRateEstimator::default();
        assert_eq!(est.observe(0), None);
        assert_eq!(est.observe(40_000), Some(40_000));
        // gaps outside (10ms, 10s) are ignored
        assert_eq!(est.observe(45_000), Some(40_000));
        for i in 1..200 {
            est.observe(45_000 + i * 33_367);
        }
        let d = est.estimate().unwrap();
        assert!((d - 33_367).abs() < 100, "d = {d}");
    }
}
