use super::buffer::{ControlCmd, MediaBuffer, SkipMode};
use super::{PTS_UNSET, StreamKind, pts_is_set};
use std::collections::VecDeque;

/// FIFO of media buffers for one stream kind.
///
/// Data buffers and control markers travel in separate lanes. Only data
/// counts toward the byte/packet totals used for backpressure, and control
/// markers are handed out ahead of data. The queue itself is not
/// synchronized; [`MediaPipe`](super::MediaPipe) owns it behind its lock.
#[derive(Debug)]
pub struct MediaQueue {
    kind: StreamKind,
    data: VecDeque<MediaBuffer>,
    ctrl: VecDeque<MediaBuffer>,
    bytes: usize,
    /// Selected stream index, -1 when the queue is disabled
    stream: i32,
    seek_target: i64,
}

impl MediaQueue {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            data: VecDeque::new(),
            ctrl: VecDeque::new(),
            bytes: 0,
            stream: -1,
            seek_target: PTS_UNSET,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Append at the tail
    pub fn push(&mut self, buf: MediaBuffer) {
        if buf.is_control() {
            self.ctrl.push_back(buf);
        } else {
            self.bytes += buf.size();
            self.data.push_back(buf);
        }
    }

    /// Put a control marker in front of anything already queued
    pub fn push_control_head(&mut self, cmd: ControlCmd) {
        self.ctrl.push_front(MediaBuffer::control(cmd));
    }

    /// Remove the head buffer. While `held`, only control markers and
    /// buffers flagged for silent discard are released.
    pub fn pop(&mut self, held: bool) -> Option<MediaBuffer> {
        if let Some(ctrl) = self.ctrl.pop_front() {
            return Some(ctrl);
        }
        if held && self.data.front().is_none_or(|b| b.skip != SkipMode::Discard) {
            return None;
        }
        let buf = self.data.pop_front()?;
        self.bytes -= buf.size();
        Some(buf)
    }

    pub fn has_deliverable(&self, held: bool) -> bool {
        !self.ctrl.is_empty()
            || self
                .data
                .front()
                .is_some_and(|b| !held || b.skip == SkipMode::Discard)
    }

    /// Drop every queued data buffer and pending control marker except `Exit`.
    /// Returns the number of data buffers discarded.
    pub fn flush(&mut self) -> usize {
        let dropped = self.data.len();
        self.data.clear();
        self.bytes = 0;
        self.ctrl.retain(|b| b.control_cmd() == Some(ControlCmd::Exit));
        dropped
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn packets(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn stream(&self) -> i32 {
        self.stream
    }

    pub fn set_stream(&mut self, stream: i32) {
        self.stream = stream;
    }

    pub fn is_active(&self) -> bool {
        self.stream >= 0
    }

    pub fn seek_target(&self) -> i64 {
        self.seek_target
    }

    pub fn set_seek_target(&mut self, ts: i64) {
        self.seek_target = ts;
    }

    /// Skip policy for the next buffer with timestamp `pts`.
    ///
    /// Until a buffer at or past the pending seek target shows up, buffers
    /// are marked for discard. The first one that reaches the target is
    /// marked [`SkipMode::Resume`] and clears the target.
    pub fn skip_for(&mut self, pts: i64) -> SkipMode {
        if !pts_is_set(self.seek_target) {
            return SkipMode::Deliver;
        }
        if pts_is_set(pts) && pts >= self.seek_target {
            self.seek_target = PTS_UNSET;
            SkipMode::Resume
        } else {
            SkipMode::Discard
        }
    }

    /// Duration spanned by queued data of the head buffer's epoch
    pub fn buffer_delay(&self) -> i64 {
        let Some(first) = self.data.front() else {
            return 0;
        };
        let ts = |b: &MediaBuffer| if pts_is_set(b.dts) { b.dts } else { b.pts };
        let start = ts(first);
        if !pts_is_set(start) {
            return 0;
        }
        self.data
            .iter()
            .rev()
            .find(|b| b.epoch == first.epoch && pts_is_set(ts(b)))
            .map(|last| (ts(last) - start).max(0))
            .unwrap_or(0)
    }
}
