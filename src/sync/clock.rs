use crate::media::{PTS_UNSET, pts_is_set};
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::Instant;

static AVTIME_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Monotonic wallclock in microseconds, shared by every pipe in the process
pub fn avtime() -> i64 {
    AVTIME_ANCHOR.get_or_init(Instant::now).elapsed().as_micros() as i64
}

/// Audio reference clock as last reported by the audio output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSnapshot {
    /// Stream time of the sample being heard at `avtime`
    pub audio_clock: i64,
    pub avtime: i64,
    pub epoch: u32,
    /// User-adjustable audio/video offset
    pub avdelta: i64,
}

impl ClockSnapshot {
    pub fn is_valid(&self) -> bool {
        pts_is_set(self.audio_clock)
    }

    /// Extrapolate the audio clock to wallclock `now`
    pub fn now(&self, now: i64) -> Option<i64> {
        self.is_valid()
            .then(|| self.audio_clock + (now - self.avtime) + self.avdelta)
    }
}

impl Default for ClockSnapshot {
    fn default() -> Self {
        Self {
            audio_clock: PTS_UNSET,
            avtime: 0,
            epoch: 0,
            avdelta: 0,
        }
    }
}

/// Shared clock state, guarded by its own lock so the audio output can set
/// it without contending with queue traffic.
#[derive(Debug, Default)]
pub struct AudioClock {
    state: Mutex<ClockSnapshot>,
}

impl AudioClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pts: i64, avtime: i64, epoch: u32) {
        if !pts_is_set(pts) {
            return;
        }
        let mut st = self.state.lock();
        st.audio_clock = pts;
        st.avtime = avtime;
        st.epoch = epoch;
    }

    pub fn invalidate(&self) {
        let mut st = self.state.lock();
        st.audio_clock = PTS_UNSET;
        st.epoch = 0;
    }

    pub fn set_avdelta(&self, delta: i64) {
        self.state.lock().avdelta = delta;
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        *self.state.lock()
    }
}
