use crate::media::CodecId;
use anyhow::{Result, anyhow};
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{
    CODEC_TYPE_AAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP2, CODEC_TYPE_MP3, CODEC_TYPE_NULL,
    CODEC_TYPE_OPUS, CODEC_TYPE_VORBIS, CodecParameters, Decoder as SymphoniaDecoder,
    DecoderOptions,
};
use symphonia::core::conv::FromSample;
use symphonia::core::formats::Packet;
use symphonia::core::sample::Sample;

/// Decoded audio samples with metadata
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub pts: i64,
    /// Interleaved samples
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Playback length in microseconds
    pub fn duration(&self) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.frames() as i64 * 1_000_000 / self.sample_rate as i64
    }
}

/// Turns encoded units of one stream into PCM
pub trait AudioDecoder: Send {
    fn decode(&mut self, data: &[u8], pts: i64) -> Result<Option<DecodedAudio>>;

    /// Drop internal state after a flush
    fn reset(&mut self);
}

/// Pick a decoder for a codec id, `None` if nothing here can decode it
pub fn decoder_for(id: CodecId, sample_rate: u32, channels: u16) -> Option<Box<dyn AudioDecoder>> {
    match id {
        CodecId::Pcm16 => Some(Box::new(PcmDecoder::new(sample_rate, channels, false))),
        CodecId::Lpcm => Some(Box::new(PcmDecoder::new(sample_rate, channels, true))),
        _ => match SymphoniaAudioDecoder::for_codec(id, sample_rate, channels) {
            Ok(dec) => Some(Box::new(dec)),
            Err(e) => {
                tracing::debug!("No decoder for {:?}: {}", id, e);
                None
            }
        },
    }
}

/// 16-bit PCM, little endian (CD audio) or big endian (DVD LPCM)
pub struct PcmDecoder {
    sample_rate: u32,
    channels: u16,
    big_endian: bool,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32, channels: u16, big_endian: bool) -> Self {
        Self {
            sample_rate,
            channels,
            big_endian,
        }
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8], pts: i64) -> Result<Option<DecodedAudio>> {
        if data.len() < 2 {
            return Ok(None);
        }
        let samples = data
            .chunks_exact(2)
            .map(|b| {
                let raw = if self.big_endian {
                    i16::from_be_bytes([b[0], b[1]])
                } else {
                    i16::from_le_bytes([b[0], b[1]])
                };
                f32::from_sample(raw)
            })
            .collect();
        Ok(Some(DecodedAudio {
            pts,
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
        }))
    }

    fn reset(&mut self) {}
}

/// Any codec symphonia knows
pub struct SymphoniaAudioDecoder {
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
}

impl SymphoniaAudioDecoder {
    /// Build from the parameters a symphonia demuxer reported for a track
    pub fn new(params: &CodecParameters, track_id: u32) -> Result<Self> {
        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| anyhow!("Symphonia decoder init failed: {}", e))?;

        Ok(Self {
            decoder,
            track_id,
            sample_rate: params.sample_rate.unwrap_or(44_100),
            channels: params.channels.map(|c| c.count() as u16).unwrap_or(2),
        })
    }

    /// Build for a bare elementary stream
    pub fn for_codec(id: CodecId, sample_rate: u32, channels: u16) -> Result<Self> {
        let codec = match id {
            CodecId::Mp2 => CODEC_TYPE_MP2,
            CodecId::Mp3 => CODEC_TYPE_MP3,
            CodecId::Aac => CODEC_TYPE_AAC,
            CodecId::Flac => CODEC_TYPE_FLAC,
            CodecId::Vorbis => CODEC_TYPE_VORBIS,
            CodecId::Opus => CODEC_TYPE_OPUS,
            _ => CODEC_TYPE_NULL,
        };
        if codec == CODEC_TYPE_NULL {
            return Err(anyhow!("Unknown codec for Symphonia: {:?}", id));
        }

        let mut params = CodecParameters::new();
        params.for_codec(codec).with_sample_rate(sample_rate);
        Self::new(&params, 0).map(|mut dec| {
            dec.channels = channels;
            dec
        })
    }

    fn convert_buffer(decoded: &AudioBufferRef) -> Vec<f32> {
        let mut samples = Vec::new();
        match decoded {
            AudioBufferRef::F32(buf) => interleave(buf, &mut samples),
            AudioBufferRef::F64(buf) => interleave(buf, &mut samples),
            AudioBufferRef::S32(buf) => interleave(buf, &mut samples),
            AudioBufferRef::S16(buf) => interleave(buf, &mut samples),
            AudioBufferRef::U8(buf) => interleave(buf, &mut samples),
            _ => tracing::warn!("Unsupported sample format from Symphonia"),
        }
        samples
    }
}

fn interleave<S: Sample>(buf: &AudioBuffer<S>, out: &mut Vec<f32>)
where
    f32: FromSample<S>,
{
    let channels = buf.spec().channels.count();
    out.reserve(buf.frames() * channels);
    for i in 0..buf.frames() {
        for c in 0..channels {
            out.push(f32::from_sample(buf.chan(c)[i]));
        }
    }
}

impl AudioDecoder for SymphoniaAudioDecoder {
    fn decode(&mut self, data: &[u8], pts: i64) -> Result<Option<DecodedAudio>> {
        let packet = Packet::new_from_slice(self.track_id, 0, 0, data);

        match self.decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let samples = Self::convert_buffer(&decoded);
                if samples.is_empty() {
                    return Ok(None);
                }
                self.sample_rate = spec.rate;
                self.channels = spec.channels.count() as u16;
                Ok(Some(DecodedAudio {
                    pts,
                    samples,
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                }))
            }
            // corrupt frames are skipped, the stream goes on
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                tracing::debug!("Skipping undecodable frame: {}", e);
                Ok(None)
            }
            Err(e) => Err(anyhow!("Symphonia decode error: {}", e)),
        }
    }

    fn reset(&mut self) {
        self.decoder.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_little_endian() {
        let mut dec = PcmDecoder::new(44_100, 2, false);
        let data = [0x00, 0x40, 0x00, 0xc0];
        let out = dec.decode(&data, 7).unwrap().unwrap();
        assert_eq!(out.pts, 7);
        assert_eq!(out.samples.len(), 2);
        assert!((out.samples[0] - 0.5).abs() < 1e-3);
        assert!((out.samples[1] + 0.5).abs() < 1e-3);
        assert_eq!(out.frames(), 1);
    }

    #[test]
    fn test_pcm_big_endian() {
        let mut dec = PcmDecoder::new(48_000, 1, true);
        let out = dec.decode(&[0x40, 0x00], 0).unwrap().unwrap();
        assert!((out.samples[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_pcm_short_input() {
        let mut dec = PcmDecoder::new(44_100, 2, false);
        assert!(dec.decode(&[0x01], 0).unwrap().is_none());
    }

    #[test]
    fn test_duration() {
        let audio = DecodedAudio {
            pts: 0,
            samples: vec![0.0; 44_100 * 2],
            sample_rate: 44_100,
            channels: 2,
        };
        assert_eq!(audio.duration(), 1_000_000);
    }

    #[test]
    fn test_decoder_for() {
        assert!(decoder_for(CodecId::Pcm16, 44_100, 2).is_some());
        assert!(decoder_for(CodecId::Mpeg2Video, 0, 0).is_none());
    }
}
