use anyhow::{Context, Result, anyhow};
use clap::Parser;
use showtime_media::{
    audio::{AudioOutput, AudioSink, CpalSink, NullSink},
    backend::Backends,
    config::{AudioConfig, BufferMode, Config},
    event::Event,
    logging,
    media::{MediaPipe, MediaService},
    video::{HeadlessSink, VideoOutput},
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// Play media through the Showtime pipeline
#[derive(Parser, Debug)]
#[command(name = "showtime-media")]
#[command(about = "Media pipeline with audio-clock driven A/V sync", long_about = None)]
struct Args {
    /// Entries to play in order: files, cdda://, synth://, radio:// or pes:// descriptors
    #[arg(required = true)]
    playlist: Vec<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Buffering policy, overrides the configuration file
    #[arg(short, long, value_enum)]
    buffer: Option<BufferModeArg>,

    /// Start the first entry paused
    #[arg(long, default_value_t = false)]
    hold: bool,

    /// Disable audio output (playback is still paced in realtime)
    #[arg(long, default_value_t = false)]
    no_audio: bool,

    /// Log filter, e.g. "debug" or "showtime_media::sync=trace"
    #[arg(long)]
    log: Option<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum BufferModeArg {
    None,
    Shallow,
    Deep,
}

impl From<BufferModeArg> for BufferMode {
    fn from(mode: BufferModeArg) -> Self {
        match mode {
            BufferModeArg::None => BufferMode::None,
            BufferModeArg::Shallow => BufferMode::Shallow,
            BufferModeArg::Deep => BufferMode::Deep,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(mode) = args.buffer {
        config.pipe.buffer_mode = mode.into();
    }
    if args.no_audio {
        config.audio.enabled = false;
    }
    logging::init(args.log.as_deref().unwrap_or(&config.logging.filter))?;

    info!("Starting showtime-media, {} entries", args.playlist.len());
    info!("Buffering: {:?}, audio: {}", config.pipe.buffer_mode, config.audio.enabled);

    let service = MediaService::new();
    let pipe = MediaPipe::new("main", &config, &service);
    service.become_primary(&pipe);

    let audio = AudioOutput::new(&pipe, open_audio_sink(&config.audio), &config.audio).spawn()?;
    let video = VideoOutput::new(&pipe, Box::new(HeadlessSink::new()), &config.sync).spawn()?;
    spawn_commands(pipe.clone())?;

    let backends = Backends::with_defaults();
    run_playlist(&backends, &pipe, &args.playlist, args.hold);

    pipe.shutdown();
    audio.join().map_err(|_| anyhow!("Audio output thread panicked"))?;
    let stats = video.join().map_err(|_| anyhow!("Video output thread panicked"))?;
    if stats.frames_judged > 0 {
        info!(
            "Video: {} frames judged, {} dropped, {} held, average drift {:.1}ms",
            stats.frames_judged, stats.video_frames_dropped, stats.video_frames_held, stats.avg_drift_ms
        );
    }
    service.release_primary(&pipe);
    Ok(())
}

/// Real device when possible, otherwise a realtime emulation so pacing
/// and the audio clock keep working
fn open_audio_sink(config: &AudioConfig) -> Box<dyn AudioSink> {
    if config.enabled {
        match CpalSink::new(config.jitter_buffer_ms) {
            Ok(sink) => return Box::new(sink),
            Err(e) => warn!("Failed to open audio device: {}. Emulating output.", e),
        }
    }
    Box::new(NullSink::new(true, config.jitter_buffer_ms))
}

/// Play entries until the list runs out or a producer reports Stop/Eject
fn run_playlist(backends: &Backends, pipe: &Arc<MediaPipe>, playlist: &[String], hold: bool) {
    let mut index = 0;
    let mut hold = hold;
    while let Some(descriptor) = playlist.get(index) {
        // errors are logged by the backend registry
        let event = backends.play(descriptor, pipe, hold).unwrap_or(Event::Next);
        hold = false;

        info!("{}: ended with {}", descriptor, event);
        index = match event {
            Event::Stop | Event::Eject => break,
            Event::Prev => index.saturating_sub(1),
            Event::PlayqueueJump(target) => match playlist.iter().position(|d| **d == *target) {
                Some(i) => i,
                None => {
                    warn!("{} is not in the playlist", target);
                    index + 1
                }
            },
            _ => index + 1,
        };
    }
}

fn spawn_commands(pipe: Arc<MediaPipe>) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("commands".into()).spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let cmd = line.trim();
            match parse_command(cmd) {
                Some(event) => pipe.enqueue_event(event),
                None if cmd.is_empty() => {}
                None => warn!("Unknown command {:?}", cmd),
            }
        }
    })
}

/// One-letter commands read from stdin
fn parse_command(cmd: &str) -> Option<Event> {
    let mut chars = cmd.chars();
    let head = chars.next()?;
    let arg = chars.as_str().trim();
    let event = match (head, arg) {
        ('p', "") => Event::PlayPause,
        ('s' | 'q', "") => Event::Stop,
        ('n', "") => Event::Next,
        ('b', "") => Event::Prev,
        ('f', "") => Event::SeekForward,
        ('r', "") => Event::SeekBackward,
        ('F', "") => Event::SeekFastForward,
        ('R', "") => Event::SeekFastBackward,
        ('0', "") => Event::RestartTrack,
        ('e', "") => Event::Eject,
        ('g', secs) => Event::Seek((secs.parse::<f64>().ok()? * 1e6) as i64),
        ('a', track) => Event::SelectAudioTrack(track.parse().ok()?),
        ('j', entry) if !entry.is_empty() => Event::PlayqueueJump(entry.into()),
        _ => return None,
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("p"), Some(Event::PlayPause));
        assert_eq!(parse_command("g 90.5"), Some(Event::Seek(90_500_000)));
        assert_eq!(parse_command("a1"), Some(Event::SelectAudioTrack(1)));
        assert_eq!(parse_command("j synth://440"), Some(Event::PlayqueueJump("synth://440".into())));
        assert_eq!(parse_command("gx"), None);
        assert_eq!(parse_command("px"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn test_buffer_mode_arg() {
        assert_eq!(BufferMode::from(BufferModeArg::Deep), BufferMode::Deep);
        assert_eq!(BufferMode::from(BufferModeArg::None), BufferMode::None);
    }
}
