//! Per-session media pipe.
//!
//! One [`MediaQueue`] per stream kind, an event queue for control requests
//! and the shared audio clock. Queue contents, events and hold state live
//! behind a single state lock so that "capacity or event" can be waited on
//! atomically; the clock has its own lock.

use super::buffer::{ControlCmd, MediaBuffer, SkipMode};
use super::queue::MediaQueue;
use super::service::MediaService;
use super::track::TrackInfo;
use super::{MediaError, PTS_UNSET, Result, StreamKind, pts_is_set};
use crate::config::{Config, PipeConfig, SeekConfig};
use crate::event::Event;
use crate::props::PropertyTree;
use crate::sync::AudioClock;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub use crate::config::BufferMode;

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $val:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($val);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

flag_set! {
    /// What the current source supports
    Capabilities {
        CAN_SEEK = 0x1,
        CAN_PAUSE = 0x2,
        CAN_EJECT = 0x4,
        /// Hold playback until enough data is queued
        PRE_BUFFERING = 0x8,
        /// Drop queued data when held (live sources)
        FLUSH_ON_HOLD = 0x10,
        /// Never counts as hungry
        ALWAYS_SATISFIED = 0x20,
        VIDEO = 0x40,
    }
}

flag_set! {
    /// Reasons a pipe is held; any set flag holds playback
    HoldFlags {
        PAUSE = 0x1,
        PRE_BUFFERING = 0x2,
        OS = 0x4,
        STREAM = 0x8,
        DISPLAY = 0x10,
        SYNC = 0x20,
    }
}

/// Returned by [`MediaPipe::enqueue_with_events`] when an event arrived
/// before the buffer could be queued. The buffer is handed back untouched.
#[derive(Debug)]
pub struct Preempted {
    pub event: Event,
    pub buffer: MediaBuffer,
}

struct PipeState {
    queues: [MediaQueue; 3],
    events: VecDeque<Event>,
    caps: Capabilities,
    hold: HoldFlags,
    buffer_mode: BufferMode,
    byte_limit: usize,
    epoch: u32,
    seek_base: i64,
    duration: Option<i64>,
    eof: bool,
    satisfied: bool,
    shutdown: bool,
    producer_attached: bool,
}

impl PipeState {
    fn queue(&mut self, kind: StreamKind) -> &mut MediaQueue {
        &mut self.queues[kind.index()]
    }

    fn bytes(&self) -> usize {
        self.queues.iter().map(MediaQueue::bytes).sum()
    }

    fn packets(&self) -> usize {
        self.queues.iter().map(MediaQueue::packets).sum()
    }

    fn buffer_delay(&self) -> i64 {
        self.queues
            .iter()
            .map(MediaQueue::buffer_delay)
            .max()
            .unwrap_or(0)
    }

    fn av_queues_empty(&self) -> bool {
        self.queues[StreamKind::Audio.index()].is_empty()
            && self.queues[StreamKind::Video.index()].is_empty()
    }

    fn has_capacity(&self, config: &PipeConfig, size: usize) -> bool {
        let packets = self.packets();
        if packets == 0 {
            return true;
        }

        // a starving consumer must always be fed
        let starving = [StreamKind::Audio, StreamKind::Video].iter().any(|k| {
            let q = &self.queues[k.index()];
            q.is_active() && q.packets() < config.min_packets
        });
        if starving {
            return true;
        }

        let delay_ok = config
            .max_realtime_delay_ms
            .is_none_or(|ms| self.buffer_delay() < ms as i64 * 1000);

        delay_ok && self.bytes() + size <= self.byte_limit && packets < config.max_packets
    }
}

/// Playback session shared by one producer and its consumers
pub struct MediaPipe {
    name: String,
    config: PipeConfig,
    seek: SeekConfig,
    state: Mutex<PipeState>,
    /// Producer side: capacity freed, event posted, queues drained
    producer_cv: Condvar,
    /// Consumer side, one per stream kind
    avail: [Condvar; 3],
    clock: AudioClock,
    props: Arc<PropertyTree>,
    service: Arc<MediaService>,
    primary: AtomicBool,
}

impl MediaPipe {
    /// Create a pipe
    ///
    /// # Arguments
    /// * `name` - Used in logs
    /// * `config` - Queue ceilings and seek steps
    /// * `service` - Process-wide primary/hungry bookkeeping
    pub fn new(name: impl Into<String>, config: &Config, service: &Arc<MediaService>) -> Arc<Self> {
        let byte_limit = config.pipe.byte_limit(config.pipe.buffer_mode);
        let pipe = Arc::new(Self {
            name: name.into(),
            config: config.pipe.clone(),
            seek: config.seek.clone(),
            state: Mutex::new(PipeState {
                queues: StreamKind::ALL.map(MediaQueue::new),
                events: VecDeque::new(),
                caps: Capabilities::empty(),
                hold: HoldFlags::empty(),
                buffer_mode: config.pipe.buffer_mode,
                byte_limit,
                epoch: 1,
                seek_base: 0,
                duration: None,
                eof: false,
                satisfied: false,
                shutdown: false,
                producer_attached: false,
            }),
            producer_cv: Condvar::new(),
            avail: [Condvar::new(), Condvar::new(), Condvar::new()],
            clock: AudioClock::new(),
            props: Arc::new(PropertyTree::new()),
            service: service.clone(),
            primary: AtomicBool::new(false),
        });
        pipe.props.set("playstatus", "play");
        pipe.props.set("buffer.limit", byte_limit as i64);
        service.note_hungry(true);
        debug!("Created media pipe {}", pipe.name);
        pipe
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn props(&self) -> &Arc<PropertyTree> {
        &self.props
    }

    pub fn clock(&self) -> &AudioClock {
        &self.clock
    }

    pub fn service(&self) -> &Arc<MediaService> {
        &self.service
    }

    pub fn seek_config(&self) -> &SeekConfig {
        &self.seek
    }

    /// Declare what the opened source supports
    pub fn configure(&self, caps: Capabilities, mode: BufferMode, duration: Option<i64>) {
        let mut st = self.state.lock();
        st.caps = caps;
        st.buffer_mode = mode;
        st.byte_limit = self.config.byte_limit(mode);
        st.duration = duration;
        st.eof = false;

        self.props.set("canSeek", caps.contains(Capabilities::CAN_SEEK));
        self.props.set("canPause", caps.contains(Capabilities::CAN_PAUSE));
        self.props.set("canEject", caps.contains(Capabilities::CAN_EJECT));
        self.props.set("buffer.limit", st.byte_limit as i64);
        match duration {
            Some(d) => self.props.set("duration", d),
            None => self.props.set("duration", crate::props::PropValue::Void),
        }

        if caps.contains(Capabilities::PRE_BUFFERING) && st.av_queues_empty() {
            let mut hold = st.hold;
            hold.insert(HoldFlags::PRE_BUFFERING);
            self.set_hold_locked(&mut st, hold, Some("buffering"));
        }
        debug!("{}: configured {:?} buffer={:?}", self.name, caps, mode);
    }

    pub fn capabilities(&self) -> Capabilities {
        self.state.lock().caps
    }

    pub fn buffer_mode(&self) -> BufferMode {
        self.state.lock().buffer_mode
    }

    pub fn duration(&self) -> Option<i64> {
        self.state.lock().duration
    }

    pub fn epoch(&self) -> u32 {
        self.state.lock().epoch
    }

    /// Last known playback position, the base for relative seeks
    pub fn seek_base(&self) -> i64 {
        self.state.lock().seek_base
    }

    /// Single-producer contract: panics if another producer is attached
    pub fn attach_producer(self: &Arc<Self>) -> ProducerGuard {
        let mut st = self.state.lock();
        assert!(
            !st.producer_attached,
            "second producer attached to media pipe {}",
            self.name
        );
        st.producer_attached = true;
        ProducerGuard { pipe: self.clone() }
    }

    // ---- streams ----

    pub fn set_stream(&self, kind: StreamKind, stream: i32) {
        self.state.lock().queue(kind).set_stream(stream);
        self.props
            .set(&format!("{}.current", kind.name()), stream as i64);
    }

    pub fn stream(&self, kind: StreamKind) -> i32 {
        self.state.lock().queue(kind).stream()
    }

    /// Switch the stream feeding one queue. Only that queue is flushed.
    pub fn select_stream(&self, kind: StreamKind, stream: i32) {
        let mut st = self.state.lock();
        let q = st.queue(kind);
        if q.stream() == stream {
            return;
        }
        let dropped = q.flush();
        q.set_stream(stream);
        if stream >= 0 {
            q.push(MediaBuffer::control(ControlCmd::Flush { seek: false }));
        }
        debug!(
            "{}: {} stream -> {} ({} buffers dropped)",
            self.name,
            kind.name(),
            stream,
            dropped
        );
        self.avail[kind.index()].notify_all();
        self.producer_cv.notify_all();
        self.publish_stats(&st);
        drop(st);
        self.props
            .set(&format!("{}.current", kind.name()), stream as i64);
    }

    pub fn set_tracks(&self, kind: StreamKind, tracks: &[TrackInfo]) {
        super::track::publish(&self.props, kind, tracks);
    }

    // ---- data path ----

    /// Queue a buffer, blocking while the pipe is full
    pub fn enqueue(&self, kind: StreamKind, buf: MediaBuffer) -> Result<()> {
        let mut st = self.state.lock();
        loop {
            if st.shutdown {
                return Err(MediaError::PipeShutdown);
            }
            if st.has_capacity(&self.config, buf.size()) {
                break;
            }
            self.producer_cv.wait(&mut st);
        }
        self.push_locked(&mut st, kind, buf);
        Ok(())
    }

    /// Queue a buffer without waiting; gives it back if the pipe is full
    pub fn try_enqueue(&self, kind: StreamKind, buf: MediaBuffer) -> std::result::Result<(), MediaBuffer> {
        let mut st = self.state.lock();
        if st.shutdown || !st.has_capacity(&self.config, buf.size()) {
            return Err(buf);
        }
        self.push_locked(&mut st, kind, buf);
        Ok(())
    }

    /// Queue a buffer, or return the first pending event instead.
    ///
    /// Pending events win over capacity. While the pipe is full the caller
    /// sleeps until either space frees up or an event is posted. A shut
    /// down pipe preempts with [`Event::Stop`].
    pub fn enqueue_with_events(
        &self,
        kind: StreamKind,
        buf: MediaBuffer,
    ) -> std::result::Result<(), Preempted> {
        let mut st = self.state.lock();
        loop {
            if let Some(event) = st.events.pop_front() {
                return Err(Preempted { event, buffer: buf });
            }
            if st.shutdown {
                return Err(Preempted {
                    event: Event::Stop,
                    buffer: buf,
                });
            }
            if st.has_capacity(&self.config, buf.size()) {
                break;
            }
            self.producer_cv.wait(&mut st);
        }
        self.push_locked(&mut st, kind, buf);
        Ok(())
    }

    fn push_locked(&self, st: &mut PipeState, kind: StreamKind, mut buf: MediaBuffer) {
        buf.epoch = st.epoch;
        trace!(
            "{}: enq {} pts={} size={} skip={}",
            self.name,
            kind.name(),
            buf.pts,
            buf.size(),
            buf.skip.as_u8()
        );
        st.queue(kind).push(buf);
        self.avail[kind.index()].notify_one();

        if st.hold.contains(HoldFlags::PRE_BUFFERING)
            && (st.buffer_delay() >= self.config.pre_buffer_ms as i64 * 1000
                || !st.has_capacity(&self.config, 0))
        {
            let mut hold = st.hold;
            hold.remove(HoldFlags::PRE_BUFFERING);
            self.set_hold_locked(st, hold, None);
        }
        self.update_satisfied(st);
        self.publish_stats(st);
    }

    /// Take the next buffer, blocking until one is available.
    ///
    /// Control markers come first. While the pipe is held only buffers
    /// marked [`SkipMode::Discard`] are released.
    pub fn dequeue(&self, kind: StreamKind) -> MediaBuffer {
        let mut st = self.state.lock();
        loop {
            if let Some(buf) = self.pop_locked(&mut st, kind) {
                return buf;
            }
            self.avail[kind.index()].wait(&mut st);
        }
    }

    /// Like [`dequeue`](Self::dequeue) with an upper bound on the wait
    pub fn dequeue_deadline(&self, kind: StreamKind, timeout: Duration) -> Option<MediaBuffer> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if let Some(buf) = self.pop_locked(&mut st, kind) {
                return Some(buf);
            }
            if self.avail[kind.index()]
                .wait_until(&mut st, deadline)
                .timed_out()
            {
                return self.pop_locked(&mut st, kind);
            }
        }
    }

    fn pop_locked(&self, st: &mut PipeState, kind: StreamKind) -> Option<MediaBuffer> {
        let held = !st.hold.is_empty();
        let buf = st.queue(kind).pop(held)?;
        if buf.is_control() {
            return Some(buf);
        }
        self.producer_cv.notify_all();

        if st.caps.contains(Capabilities::PRE_BUFFERING)
            && !st.eof
            && !st.hold.contains(HoldFlags::PRE_BUFFERING)
            && st.av_queues_empty()
        {
            debug!("{}: underrun, buffering", self.name);
            let mut hold = st.hold;
            hold.insert(HoldFlags::PRE_BUFFERING);
            self.set_hold_locked(st, hold, Some("buffering"));
        }
        self.update_satisfied(st);
        self.publish_stats(st);
        Some(buf)
    }

    /// Drop everything queued for one stream kind
    pub fn flush_queue(&self, kind: StreamKind) {
        let mut st = self.state.lock();
        st.queue(kind).flush();
        self.producer_cv.notify_all();
        self.update_satisfied(&mut st);
        self.publish_stats(&st);
    }

    /// Flush every queue and start a new epoch
    pub fn flush(&self) {
        let mut st = self.state.lock();
        self.flush_locked(&mut st, None);
    }

    /// Flush for a reposition to `target`; buffers before the target are
    /// marked for discard until one reaches it
    pub fn flush_for_seek(&self, target: i64) {
        let mut st = self.state.lock();
        self.flush_locked(&mut st, Some(target));
        st.seek_base = target;
        drop(st);
        self.props.set("currenttime", target);
    }

    fn flush_locked(&self, st: &mut PipeState, seek_target: Option<i64>) {
        st.epoch = st.epoch.wrapping_add(1).max(1);
        st.eof = false;
        for q in st.queues.iter_mut() {
            q.flush();
            q.set_seek_target(seek_target.unwrap_or(PTS_UNSET));
            if q.is_active() {
                q.push(MediaBuffer::control(ControlCmd::Flush {
                    seek: seek_target.is_some(),
                }));
            }
        }
        debug!("{}: flushed, epoch {}", self.name, st.epoch);
        for cv in &self.avail {
            cv.notify_all();
        }
        self.producer_cv.notify_all();
        self.update_satisfied(st);
        self.publish_stats(st);
    }

    /// Skip policy for the next buffer of `kind`, see [`MediaQueue::skip_for`]
    pub fn skip_for(&self, kind: StreamKind, pts: i64) -> SkipMode {
        self.state.lock().queue(kind).skip_for(pts)
    }

    pub fn send_cmd(&self, kind: StreamKind, cmd: ControlCmd) {
        let mut st = self.state.lock();
        st.queue(kind).push(MediaBuffer::control(cmd));
        self.avail[kind.index()].notify_all();
    }

    pub fn send_cmd_head(&self, kind: StreamKind, cmd: ControlCmd) {
        let mut st = self.state.lock();
        st.queue(kind).push_control_head(cmd);
        self.avail[kind.index()].notify_all();
    }

    pub fn set_eof(&self, eof: bool) {
        let mut st = self.state.lock();
        if st.eof == eof {
            return;
        }
        st.eof = eof;
        if eof && st.hold.contains(HoldFlags::PRE_BUFFERING) {
            let mut hold = st.hold;
            hold.remove(HoldFlags::PRE_BUFFERING);
            self.set_hold_locked(&mut st, hold, None);
        }
        self.update_satisfied(&mut st);
        drop(st);
        self.props.set("eof", eof);
    }

    pub fn queued_bytes(&self, kind: StreamKind) -> usize {
        self.state.lock().queue(kind).bytes()
    }

    pub fn queued_packets(&self, kind: StreamKind) -> usize {
        self.state.lock().queue(kind).packets()
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().bytes()
    }

    pub fn total_packets(&self) -> usize {
        self.state.lock().packets()
    }

    // ---- events ----

    /// Post a control event to the producer
    pub fn enqueue_event(&self, event: Event) {
        let mut st = self.state.lock();
        self.enqueue_event_locked(&mut st, event);
    }

    fn enqueue_event_locked(&self, st: &mut PipeState, event: Event) {
        let event = match event {
            Event::Seek(ts) => {
                if !st.caps.contains(Capabilities::CAN_SEEK) {
                    debug!("{}: not seekable, dropping seek", self.name);
                    return;
                }
                let ts = ts.max(0);
                st.seek_base = ts;
                self.props.set("currenttime", ts);
                if let Some(pending) = st.events.iter_mut().find(|e| matches!(e, Event::Seek(_))) {
                    *pending = Event::Seek(ts);
                    return;
                }
                Event::Seek(ts)
            }
            Event::Prev
                if st.caps.contains(Capabilities::CAN_SEEK)
                    && st.seek_base >= self.seek.skip_limit_ms * 1000 =>
            {
                Event::RestartTrack
            }
            Event::Stop => {
                self.props.set("playstatus", "stop");
                Event::Stop
            }
            e => e,
        };

        if event.replaces_pending() {
            let kind = event.kind();
            st.events.retain(|e| e.kind() != kind);
        }
        trace!("{}: event {}", self.name, event);
        st.events.push_back(event);
        self.producer_cv.notify_all();
    }

    /// Block until an event arrives
    pub fn dequeue_event(&self) -> Event {
        let mut st = self.state.lock();
        loop {
            if let Some(e) = st.events.pop_front() {
                return e;
            }
            if st.shutdown {
                return Event::Stop;
            }
            self.producer_cv.wait(&mut st);
        }
    }

    /// Wait for an event, giving up after `timeout`
    pub fn dequeue_event_deadline(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if let Some(e) = st.events.pop_front() {
                return Some(e);
            }
            if st.shutdown {
                return Some(Event::Stop);
            }
            if self.producer_cv.wait_until(&mut st, deadline).timed_out() {
                return st.events.pop_front();
            }
        }
    }

    pub fn try_dequeue_event(&self) -> Option<Event> {
        self.state.lock().events.pop_front()
    }

    /// Wait for the consumers to drain audio and video, returning early
    /// with an event if one is posted first
    pub fn wait_for_empty_queues(&self) -> Option<Event> {
        let mut st = self.state.lock();
        loop {
            if let Some(e) = st.events.pop_front() {
                return Some(e);
            }
            if st.shutdown {
                return Some(Event::Stop);
            }
            if st.av_queues_empty() {
                return None;
            }
            self.producer_cv.wait(&mut st);
        }
    }

    // ---- hold ----

    pub fn hold(&self, flag: HoldFlags, msg: Option<&str>) {
        let mut st = self.state.lock();
        let mut hold = st.hold;
        hold.insert(flag);
        self.set_hold_locked(&mut st, hold, msg);
    }

    pub fn unhold(&self, flag: HoldFlags) {
        let mut st = self.state.lock();
        let mut hold = st.hold;
        hold.remove(flag);
        self.set_hold_locked(&mut st, hold, None);
    }

    pub fn is_held(&self) -> bool {
        !self.state.lock().hold.is_empty()
    }

    pub fn hold_flags(&self) -> HoldFlags {
        self.state.lock().hold
    }

    fn set_hold_locked(&self, st: &mut PipeState, hold: HoldFlags, msg: Option<&str>) {
        let was = !st.hold.is_empty();
        st.hold = hold;
        self.props.set("hold", hold.bits() as i64);
        let now = !hold.is_empty();
        if was == now {
            return;
        }

        if now && st.caps.contains(Capabilities::FLUSH_ON_HOLD) {
            for q in st.queues.iter_mut() {
                q.flush();
            }
        }

        let cmd = if now { ControlCmd::Pause } else { ControlCmd::Play };
        for q in st.queues.iter_mut().filter(|q| q.is_active()) {
            q.push_control_head(cmd);
        }
        for cv in &self.avail {
            cv.notify_all();
        }

        debug!("{}: hold {:?}", self.name, hold);
        self.props.set("playstatus", if now { "pause" } else { "play" });
        self.props.set("pausereason", msg.unwrap_or(""));
        self.enqueue_event_locked(st, Event::Hold(now));
    }

    // ---- clock and position ----

    /// Record the playback position reported by the audio output.
    /// Ignored for unset timestamps and for stale epochs.
    pub fn set_current_time(&self, ts: i64, epoch: u32) {
        if !pts_is_set(ts) {
            return;
        }
        let mut st = self.state.lock();
        if epoch != st.epoch {
            return;
        }
        st.seek_base = ts;
        drop(st);
        self.props.set("currenttime", ts);
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    pub(crate) fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::Release);
        self.props.set("primary", primary);
    }

    /// Wake every waiter and tell the consumers to exit
    pub fn shutdown(&self) {
        let mut st = self.state.lock();
        if st.shutdown {
            return;
        }
        st.shutdown = true;
        for q in st.queues.iter_mut() {
            q.push(MediaBuffer::control(ControlCmd::Exit));
        }
        for cv in &self.avail {
            cv.notify_all();
        }
        self.producer_cv.notify_all();
        debug!("{}: shut down", self.name);
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    fn update_satisfied(&self, st: &mut PipeState) {
        let satisfied = st.caps.contains(Capabilities::ALWAYS_SATISFIED)
            || st.eof
            || (st.packets() > 0 && st.bytes() * 2 >= st.byte_limit);
        if satisfied != st.satisfied {
            st.satisfied = satisfied;
            self.service.note_hungry(!satisfied);
            self.props.set("satisfied", satisfied);
        }
    }

    fn publish_stats(&self, st: &PipeState) {
        for q in &st.queues {
            let kind = q.kind().name();
            self.props.set(&format!("{kind}.packets"), q.packets() as i64);
            self.props.set(&format!("{kind}.bytes"), q.bytes() as i64);
        }
        self.props.set("buffer.current", st.bytes() as i64);
        self.props.set("buffer.delay", st.buffer_delay());
    }
}

impl Drop for MediaPipe {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if !st.satisfied {
            self.service.note_hungry(false);
        }
    }
}

impl fmt::Debug for MediaPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaPipe").field("name", &self.name).finish()
    }
}

/// Marks a pipe as owned by one producer; released on drop
pub struct ProducerGuard {
    pipe: Arc<MediaPipe>,
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.pipe.state.lock().producer_attached = false;
    }
}
