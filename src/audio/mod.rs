//! Audio decoding and playback
pub mod decoder;
pub mod output;
pub mod player;

pub use decoder::{AudioDecoder, DecodedAudio, PcmDecoder, SymphoniaAudioDecoder};
pub use output::{AudioOutput, Step};
pub use player::{AudioSink, CpalSink, NullSink};
