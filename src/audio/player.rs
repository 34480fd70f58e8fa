use crate::audio::decoder::DecodedAudio;
use anyhow::{Context, Result, bail};
use cpal::{
    SampleRate, Stream, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use crossbeam::channel::{Sender, bounded};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Where decoded audio ends up
pub trait AudioSink: Send {
    /// Queue samples for playback, blocking while the output is full.
    /// Returns the output delay in microseconds: how long until the first
    /// sample of `audio` is audible.
    fn deliver(&mut self, audio: DecodedAudio) -> Result<i64>;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Drop everything queued but not yet played
    fn flush(&mut self);
}

/// Buffer between the consumer thread and the device callback
struct JitterBuffer {
    buffer: VecDeque<Vec<f32>>,
    /// Samples of the front chunk already played
    offset: usize,
    current_size_samples: usize,
    max_size_samples: usize,
    sample_rate: u32,
    channels: u16,
}

impl JitterBuffer {
    fn new(max_size_ms: u32, sample_rate: u32, channels: u16) -> Self {
        let max_size_samples =
            (max_size_ms as usize * sample_rate as usize / 1000) * channels as usize;

        Self {
            buffer: VecDeque::new(),
            offset: 0,
            current_size_samples: 0,
            max_size_samples,
            sample_rate,
            channels,
        }
    }

    fn is_full(&self) -> bool {
        self.current_size_samples >= self.max_size_samples
    }

    fn push(&mut self, samples: Vec<f32>) {
        self.current_size_samples += samples.len();
        self.buffer.push_back(samples);
    }

    /// Fill `out`, padding with silence on underrun. Returns samples taken.
    fn pop_into(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            let Some(front) = self.buffer.front() else {
                break;
            };
            let available = &front[self.offset..];
            let n = available.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&available[..n]);
            written += n;
            self.offset += n;
            if self.offset == front.len() {
                self.buffer.pop_front();
                self.offset = 0;
            }
        }
        out[written..].fill(0.0);
        self.current_size_samples -= written;
        written
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.offset = 0;
        self.current_size_samples = 0;
    }

    /// Queued audio in microseconds
    fn delay(&self) -> i64 {
        let per_second = self.sample_rate as i64 * self.channels as i64;
        if per_second == 0 {
            return 0;
        }
        self.current_size_samples as i64 * 1_000_000 / per_second
    }
}

struct Shared {
    jitter: Mutex<JitterBuffer>,
    drained: Condvar,
    paused: AtomicBool,
}

/// The cpal stream cannot leave the thread that built it, so each open
/// stream lives on its own device thread until `close` is dropped.
struct OpenStream {
    _close: Sender<()>,
    sample_rate: u32,
    channels: u16,
}

/// Audio output on the default cpal device.
///
/// The device stream is opened lazily with the format of the first
/// delivered audio and reopened when the format changes.
pub struct CpalSink {
    shared: Arc<Shared>,
    stream: Option<OpenStream>,
    jitter_buffer_ms: u32,
    volume: f32,
}

impl CpalSink {
    /// Create a new cpal sink
    ///
    /// # Arguments
    /// * `jitter_buffer_ms` - How much audio may be queued ahead of the device
    pub fn new(jitter_buffer_ms: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("No audio output device available")?;
        tracing::info!(
            "Using audio device: {}",
            device.name().unwrap_or("Unknown".to_string())
        );

        Ok(Self {
            shared: Arc::new(Shared {
                jitter: Mutex::new(JitterBuffer::new(jitter_buffer_ms, 44_100, 2)),
                drained: Condvar::new(),
                paused: AtomicBool::new(false),
            }),
            stream: None,
            jitter_buffer_ms,
            volume: 1.0,
        })
    }

    /// Set playback volume (0.0 - 1.0)
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn open(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        if let Some(s) = &self.stream {
            if s.sample_rate == sample_rate && s.channels == channels {
                return Ok(());
            }
        }
        self.stream = None;
        *self.shared.jitter.lock() = JitterBuffer::new(self.jitter_buffer_ms, sample_rate, channels);

        let shared = self.shared.clone();
        let (close_tx, close_rx) = bounded::<()>(0);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        thread::Builder::new()
            .name("audio-device".into())
            .spawn(move || {
                let stream = match build_stream(shared, sample_rate, channels) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // returns once the sink drops its sender
                let _ = close_rx.recv();
                drop(stream);
            })
            .context("Failed to spawn audio device thread")?;
        ready_rx.recv().context("Audio device thread exited")??;

        tracing::debug!("Opened audio stream {} Hz, {} channels", sample_rate, channels);
        self.stream = Some(OpenStream {
            _close: close_tx,
            sample_rate,
            channels,
        });
        Ok(())
    }
}

fn build_stream(shared: Arc<Shared>, sample_rate: u32, channels: u16) -> Result<Stream> {
    let device = cpal::default_host()
        .default_output_device()
        .context("No audio output device available")?;
    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if shared.paused.load(Ordering::Relaxed) {
                    data.fill(0.0);
                    return;
                }
                let mut jitter = shared.jitter.lock();
                let taken = jitter.pop_into(data);
                if taken < data.len() && !jitter.buffer.is_empty() {
                    tracing::warn!("Audio buffer underrun");
                }
                drop(jitter);
                shared.drained.notify_all();
            },
            |err| {
                tracing::error!("Audio stream error: {}", err);
            },
            None,
        )
        .context("Failed to build audio output stream")?;

    stream.play().context("Failed to start audio stream")?;
    Ok(stream)
}

impl AudioSink for CpalSink {
    fn deliver(&mut self, mut audio: DecodedAudio) -> Result<i64> {
        self.open(audio.sample_rate, audio.channels)?;

        if self.volume != 1.0 {
            for sample in &mut audio.samples {
                *sample *= self.volume;
            }
        }

        let mut jitter = self.shared.jitter.lock();
        let mut stalls = 0;
        while jitter.is_full() {
            if self
                .shared
                .drained
                .wait_for(&mut jitter, Duration::from_millis(500))
                .timed_out()
            {
                stalls += 1;
                if stalls == 4 {
                    bail!("Audio device stopped consuming samples");
                }
            }
        }
        let delay = jitter.delay();
        jitter.push(audio.samples);
        Ok(delay)
    }

    fn pause(&mut self) {
        self.shared.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&mut self) {
        self.shared.paused.store(false, Ordering::Relaxed);
    }

    fn flush(&mut self) {
        self.shared.jitter.lock().clear();
        self.shared.drained.notify_all();
    }
}

/// Sink without a device. Paces delivery to real time when asked to,
/// so the audio clock advances as if something were playing.
pub struct NullSink {
    realtime: bool,
    lead: Duration,
    /// Wallclock at which the last delivered sample finishes
    end: Option<Instant>,
    paused_at: Option<Instant>,
}

impl NullSink {
    pub fn new(realtime: bool, lead_ms: u32) -> Self {
        Self {
            realtime,
            lead: Duration::from_millis(lead_ms as u64),
            end: None,
            paused_at: None,
        }
    }
}

impl AudioSink for NullSink {
    fn deliver(&mut self, audio: DecodedAudio) -> Result<i64> {
        if !self.realtime {
            return Ok(0);
        }
        let now = Instant::now();
        let start = self.end.filter(|end| *end > now).unwrap_or(now);
        let ahead = start - now;
        if ahead > self.lead {
            thread::sleep(ahead - self.lead);
        }
        let delay = start.saturating_duration_since(Instant::now());
        self.end = Some(start + Duration::from_micros(audio.duration().max(0) as u64));
        Ok(delay.as_micros() as i64)
    }

    fn pause(&mut self) {
        self.paused_at.get_or_insert_with(Instant::now);
    }

    fn resume(&mut self) {
        if let (Some(at), Some(end)) = (self.paused_at.take(), self.end) {
            self.end = Some(end + at.elapsed());
        }
    }

    fn flush(&mut self) {
        self.end = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(samples: usize) -> DecodedAudio {
        DecodedAudio {
            pts: 0,
            samples: vec![0.25; samples],
            sample_rate: 48000,
            channels: 2,
        }
    }

    #[test]
    fn test_jitter_buffer() {
        let mut buffer = JitterBuffer::new(30, 48000, 2);
        buffer.push(vec![0.5; 1000]);
        assert_eq!(buffer.current_size_samples, 1000);

        let mut out = vec![1.0; 500];
        assert_eq!(buffer.pop_into(&mut out), 500);
        assert_eq!(buffer.current_size_samples, 500);
        assert!(out.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_jitter_buffer_pads_silence() {
        let mut buffer = JitterBuffer::new(30, 48000, 2);
        buffer.push(vec![0.5; 10]);
        buffer.push(vec![0.75; 10]);
        let mut out = vec![1.0; 32];
        assert_eq!(buffer.pop_into(&mut out), 20);
        assert_eq!(out[9], 0.5);
        assert_eq!(out[10], 0.75);
        assert!(out[20..].iter().all(|&s| s == 0.0));
        assert_eq!(buffer.current_size_samples, 0);
    }

    #[test]
    fn test_jitter_delay() {
        let mut buffer = JitterBuffer::new(1000, 48000, 2);
        buffer.push(vec![0.0; 9600]);
        assert_eq!(buffer.delay(), 100_000);
        assert!(!buffer.is_full());
        buffer.clear();
        assert_eq!(buffer.delay(), 0);
    }

    #[test]
    fn test_null_sink_instant() {
        let mut sink = NullSink::new(false, 0);
        assert_eq!(sink.deliver(audio(9600)).unwrap(), 0);
    }

    #[test]
    fn test_null_sink_realtime_delay_grows() {
        let mut sink = NullSink::new(true, 500);
        assert_eq!(sink.deliver(audio(9600)).unwrap(), 0);
        let delay = sink.deliver(audio(9600)).unwrap();
        assert!(delay > 90_000 && delay <= 100_000, "delay {delay}");
        sink.flush();
        assert_eq!(sink.deliver(audio(9600)).unwrap(), 0);
    }
}
