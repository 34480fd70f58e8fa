//! Producers for the supported source types.
//!
//! A backend turns a descriptor into a [`Source`](crate::producer::Source),
//! configures the pipe for it and runs the producer until an event ends the
//! session.

pub mod cdda;
pub mod file;
pub mod pes;
pub mod radio;
pub mod synth;

use crate::event::Event;
use crate::media::{MediaError, MediaPipe, Result};
use std::sync::Arc;
use tracing::{error, info};

pub use cdda::CddaBackend;
pub use file::FileBackend;
pub use pes::PesBackend;
pub use radio::RadioBackend;
pub use synth::SynthBackend;

pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, descriptor: &str) -> bool;

    /// Play `descriptor` into `pipe`, returning the event that ended
    /// playback. With `hold` set the session starts paused.
    fn play(&self, descriptor: &str, pipe: &Arc<MediaPipe>, hold: bool) -> Result<Event>;
}

/// Ordered list of backends; the first one accepting a descriptor wins
#[derive(Default)]
pub struct Backends {
    list: Vec<Box<dyn Backend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in backend, plain files last
    pub fn with_defaults() -> Self {
        let mut backends = Self::new();
        backends.register(Box::new(CddaBackend::new()));
        backends.register(Box::new(SynthBackend::new()));
        backends.register(Box::new(RadioBackend::new()));
        backends.register(Box::new(PesBackend::new()));
        backends.register(Box::new(FileBackend::new()));
        backends
    }

    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.list.push(backend);
    }

    pub fn find(&self, descriptor: &str) -> Option<&dyn Backend> {
        self.list
            .iter()
            .find(|b| b.can_handle(descriptor))
            .map(|b| b.as_ref())
    }

    pub fn play(&self, descriptor: &str, pipe: &Arc<MediaPipe>, hold: bool) -> Result<Event> {
        let backend = self
            .find(descriptor)
            .ok_or_else(|| MediaError::NoBackend(descriptor.to_string()))?;
        info!("Playing {} with the {} backend", descriptor, backend.name());
        backend.play(descriptor, pipe, hold).inspect_err(|e| {
            error!("{}: {}", descriptor, e);
        })
    }
}

/// Split `scheme://rest` into the part after the scheme
pub(crate) fn strip_scheme<'a>(descriptor: &'a str, scheme: &str) -> Option<&'a str> {
    descriptor
        .strip_prefix(scheme)
        .and_then(|rest| rest.strip_prefix("://"))
}
