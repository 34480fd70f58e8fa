use crate::audio::decoder::{AudioDecoder, DecodedAudio, PcmDecoder};
use crate::audio::player::{AudioSink, NullSink};
use crate::config::AudioConfig;
use crate::media::{CodecRef, ControlCmd, MediaBuffer, MediaPipe, SkipMode, StreamKind, pts_is_set};
use crate::sync::avtime;
use anyhow::Result;
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// What the consumer loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Exit,
}

/// Audio consumer: pulls audio buffers from a pipe, decodes them, feeds the
/// sink and drives the pipe's audio clock.
pub struct AudioOutput {
    pipe: Arc<MediaPipe>,
    sink: Box<dyn AudioSink>,
    /// Paces output while another pipe owns the device
    emulator: NullSink,
    pcm: PcmDecoder,
    codec: Option<CodecRef>,
    /// Cleared by a seek flush until the first buffer at the seek target
    clock_enabled: bool,
    warned_no_decoder: bool,
}

impl AudioOutput {
    pub fn new(pipe: &Arc<MediaPipe>, sink: Box<dyn AudioSink>, config: &AudioConfig) -> Self {
        Self {
            pipe: pipe.clone(),
            sink,
            emulator: NullSink::new(true, config.jitter_buffer_ms),
            pcm: PcmDecoder::new(config.sample_rate, config.channels, false),
            codec: None,
            clock_enabled: true,
            warned_no_decoder: false,
        }
    }

    /// Run on a dedicated thread until the pipe delivers `Exit`
    pub fn spawn(mut self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("{}-audio", self.pipe.name()))
            .spawn(move || {
                loop {
                    let buf = self.pipe.dequeue(StreamKind::Audio);
                    match self.process(buf) {
                        Ok(Step::Exit) => break,
                        Ok(Step::Continue) => {}
                        Err(e) => warn!("{}: audio output: {:#}", self.pipe.name(), e),
                    }
                }
                debug!("{}: audio output finished", self.pipe.name());
            })
    }

    /// Handle one dequeued buffer
    pub fn process(&mut self, buf: MediaBuffer) -> Result<Step> {
        if let Some(cmd) = buf.control_cmd() {
            return Ok(self.control(cmd));
        }

        if buf.stream != self.pipe.stream(StreamKind::Audio) {
            trace!("{}: dropping audio of stream {}", self.pipe.name(), buf.stream);
            return Ok(Step::Continue);
        }

        match buf.skip {
            SkipMode::Discard => return Ok(Step::Continue),
            SkipMode::Resume => self.clock_enabled = true,
            SkipMode::Deliver => {}
        }

        let Some(audio) = self.decode(&buf)? else {
            return Ok(Step::Continue);
        };

        if self.pipe.is_primary() {
            let delay = self.sink.deliver(audio)?;
            if self.clock_enabled && buf.drive_clock && pts_is_set(buf.pts) {
                self.pipe.clock().set(buf.pts - delay, avtime(), buf.epoch);
            }
        } else {
            self.emulator.deliver(audio)?;
            self.pipe.clock().invalidate();
        }

        if pts_is_set(buf.pts) {
            self.pipe.set_current_time(buf.pts, buf.epoch);
        }
        Ok(Step::Continue)
    }

    fn control(&mut self, cmd: ControlCmd) -> Step {
        trace!("{}: audio control {:?}", self.pipe.name(), cmd);
        match cmd {
            ControlCmd::Exit => {
                self.sink.flush();
                self.pipe.clock().invalidate();
                return Step::Exit;
            }
            ControlCmd::Pause => {
                self.sink.pause();
                self.emulator.pause();
                self.pipe.clock().invalidate();
            }
            ControlCmd::Play => {
                self.sink.resume();
                self.emulator.resume();
            }
            ControlCmd::Flush { seek } => {
                self.sink.flush();
                self.emulator.flush();
                self.pipe.clock().invalidate();
                if let Some(codec) = &self.codec {
                    codec.flush();
                }
                if seek {
                    self.clock_enabled = false;
                }
            }
        }
        Step::Continue
    }

    fn decode(&mut self, buf: &MediaBuffer) -> Result<Option<DecodedAudio>> {
        let Some(codec) = &buf.codec else {
            return self.pcm.decode(&buf.data, buf.pts);
        };

        if !self.codec.as_ref().is_some_and(|c| Arc::ptr_eq(c, codec)) {
            debug!("{}: audio codec now {:?}", self.pipe.name(), codec.id());
            self.codec = Some(codec.clone());
            self.warned_no_decoder = false;
        }

        if !codec.has_decoder() {
            if !self.warned_no_decoder {
                warn!("{}: no decoder for {:?}, audio muted", self.pipe.name(), codec.id());
                self.warned_no_decoder = true;
            }
            return Ok(None);
        }
        codec.decode_audio(&buf.data, buf.pts)
    }
}
