//! PCM and WAV handling shared by the streaming and speaker paths.
//!
//! The streaming endpoint receives raw little-endian 16-bit PCM frames;
//! the speaker endpoint receives complete WAV clips. Both are widened to
//! f32 in [-1, 1] using the configured normalization factor before they
//! reach any inference engine.

use std::io::Cursor;

use thiserror::Error;

/// Errors produced while interpreting client audio.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("invalid WAV file: {0}")]
    InvalidWav(String),
    #[error("unsupported number of channels: {0}")]
    UnsupportedChannels(u16),
}

/// A decoded, mono, normalized audio clip.
#[derive(Debug, Clone)]
pub struct DecodedWav {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Widen little-endian i16 PCM bytes to f32 samples.
///
/// The caller must have validated that `data` has even length; a trailing
/// odd byte would be silently dropped here.
pub fn pcm16_to_f32(data: &[u8], normalize_factor: f32) -> Vec<f32> {
    let mut samples = Vec::with_capacity(data.len() / 2);
    for chunk in data.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        samples.push(sample as f32 / normalize_factor);
    }
    samples
}

/// Decode a WAV clip into mono normalized samples.
///
/// Accepts 1- or 2-channel 16-bit integer or 32-bit float WAV files.
/// Stereo input is down-mixed by averaging the two channels.
pub fn decode_wav(data: &[u8], normalize_factor: f32) -> Result<DecodedWav, AudioError> {
    let reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| AudioError::InvalidWav(e.to_string()))?;
    let spec = reader.spec();

    if spec.channels == 0 || spec.channels > 2 {
        return Err(AudioError::UnsupportedChannels(spec.channels));
    }

    let mut samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            if spec.bits_per_sample != 16 {
                return Err(AudioError::InvalidWav(format!(
                    "unsupported bit depth: {}",
                    spec.bits_per_sample
                )));
            }
            reader
                .into_samples::<i16>()
                .map(|s| s.map(|v| v as f32 / normalize_factor))
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::InvalidWav(e.to_string()))?
        }
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::InvalidWav(e.to_string()))?,
    };

    if spec.channels == 2 {
        samples = samples
            .chunks_exact(2)
            .map(|pair| (pair[0] + pair[1]) / 2.0)
            .collect();
    }

    Ok(DecodedWav {
        samples,
        sample_rate: spec.sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(spec: hound::WavSpec, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn pcm16_conversion_range() {
        let data = [
            0x00, 0x00, // 0
            0xff, 0x7f, // i16::MAX
            0x00, 0x80, // i16::MIN
        ];
        let samples = pcm16_to_f32(&data, 32768.0);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 0.99997).abs() < 1e-4);
        assert_eq!(samples[2], -1.0);
    }

    #[test]
    fn decode_mono_wav() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, &[0, 16384, -16384]);
        let decoded = decode_wav(&bytes, 32768.0).unwrap();
        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.samples.len(), 3);
        assert!((decoded.samples[1] - 0.5).abs() < 1e-6);
        assert!((decoded.samples[2] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn decode_stereo_downmixes_by_averaging() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        // Interleaved L/R pairs.
        let bytes = wav_bytes(spec, &[16384, 0, 0, -16384]);
        let decoded = decode_wav(&bytes, 32768.0).unwrap();
        assert_eq!(decoded.samples.len(), 2);
        assert!((decoded.samples[0] - 0.25).abs() < 1e-6);
        assert!((decoded.samples[1] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn decode_rejects_garbage() {
        let result = decode_wav(b"definitely not a wav file", 32768.0);
        assert!(matches!(result, Err(AudioError::InvalidWav(_))));
    }
}
