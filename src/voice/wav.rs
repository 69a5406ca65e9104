//! WAV encoding and decoding via `hound`

use std::io::Cursor;
use std::path::Path;

use super::frame::f32_to_i16;
use super::playback::AudioClip;
use super::resample::resample;
use crate::Result;

fn mono_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Encode 16-bit mono PCM as WAV bytes (for STT uploads)
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, mono_spec(sample_rate))?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Write float mono samples to a 16-bit WAV file
///
/// # Errors
///
/// Returns error if the file cannot be written
pub fn write_wav_file(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, mono_spec(sample_rate))?;
    for &s in samples {
        writer.write_sample(f32_to_i16(s))?;
    }
    writer.finalize()?;
    Ok(())
}

fn decode<R: std::io::Read>(mut reader: hound::WavReader<R>) -> Result<AudioClip> {
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            #[allow(clippy::cast_precision_loss)]
            let samples = reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<std::result::Result<_, _>>()?;
            samples
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
    };

    let channels = usize::from(spec.channels.max(1));
    let samples = if channels > 1 {
        #[allow(clippy::cast_precision_loss)]
        let mono = samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        mono
    } else {
        samples
    };

    Ok(AudioClip {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Decode WAV bytes to mono float samples at their native rate
///
/// # Errors
///
/// Returns error if the bytes are not a readable WAV
pub fn decode_wav(bytes: &[u8]) -> Result<AudioClip> {
    decode(hound::WavReader::new(Cursor::new(bytes))?)
}

/// Read a WAV file as mono float samples resampled to `sample_rate`
///
/// # Errors
///
/// Returns error if the file cannot be read or resampled
pub fn read_wav_mono(path: &Path, sample_rate: u32) -> Result<Vec<f32>> {
    let audio = decode(hound::WavReader::open(path)?)?;
    resample(&audio.samples, audio.sample_rate, sample_rate)
}
