use super::MediaPipe;
use crate::event::Event;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use tracing::info;

/// Process-wide media bookkeeping.
///
/// Tracks which pipe owns audio output focus ("primary") and how many
/// pipes are starving for data. Pipes that gained primary later in time sit
/// on top of the stack; releasing the top hands focus back to the one below.
#[derive(Debug, Default)]
pub struct MediaService {
    primary_stack: Mutex<Vec<Weak<MediaPipe>>>,
    hungry: AtomicI32,
}

impl MediaService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Give `pipe` audio focus. The previous primary is told it lost focus.
    pub fn become_primary(&self, pipe: &Arc<MediaPipe>) {
        let mut stack = self.primary_stack.lock();
        stack.retain(|w| w.strong_count() > 0);

        if let Some(top) = stack.last().and_then(Weak::upgrade) {
            if Arc::ptr_eq(&top, pipe) {
                return;
            }
            top.set_primary(false);
            top.enqueue_event(Event::MpNoLongerPrimary);
        }

        stack.retain(|w| !std::ptr::eq(w.as_ptr(), Arc::as_ptr(pipe)));
        stack.push(Arc::downgrade(pipe));
        pipe.set_primary(true);
        pipe.enqueue_event(Event::MpIsPrimary);
        info!("{} is now primary", pipe.name());
    }

    /// Remove `pipe` from the focus stack; if it was on top, the next pipe
    /// down becomes primary again
    pub fn release_primary(&self, pipe: &Arc<MediaPipe>) {
        let mut stack = self.primary_stack.lock();
        let was_top = stack
            .last()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(pipe)));
        stack.retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), Arc::as_ptr(pipe)));
        pipe.set_primary(false);

        if was_top {
            if let Some(next) = stack.last().and_then(Weak::upgrade) {
                next.set_primary(true);
                next.enqueue_event(Event::MpIsPrimary);
                info!("{} is primary again", next.name());
            }
        }
    }

    pub fn primary(&self) -> Option<Arc<MediaPipe>> {
        self.primary_stack.lock().last().and_then(Weak::upgrade)
    }

    /// Number of pipes currently below their satisfaction level
    pub fn hungry(&self) -> i32 {
        self.hungry.load(Ordering::Relaxed)
    }

    pub(crate) fn note_hungry(&self, hungry: bool) {
        if hungry {
            self.hungry.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hungry.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
