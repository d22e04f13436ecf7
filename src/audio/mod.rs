use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use hound::{SampleFormat, WavReader};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::concurrent::CancelToken;
use crate::utils::process::ProcessRunner;

pub const WHISPER_SAMPLE_RATE: u32 = 16_000;

/// Decodes any ffmpeg-readable media file into normalized 16 kHz mono samples.
///
/// The intermediate WAV goes to `scratch_dir` and is removed afterwards.
pub fn load_for_whisper(
    path: &Path,
    ffmpeg: &str,
    scratch_dir: &Path,
    token: &CancelToken,
) -> Result<Vec<f32>> {
    let wav_path = convert_to_wav(path, ffmpeg, scratch_dir, token)?;
    let read = read_wav_file(&wav_path);
    if let Err(e) = std::fs::remove_file(&wav_path) {
        warn!("Failed to remove temporary WAV file {}: {}", wav_path.display(), e);
    }

    let (samples, num_channels, sample_rate) = read?;
    if sample_rate != WHISPER_SAMPLE_RATE {
        return Err(anyhow!(
            "unexpected sample rate {} after conversion",
            sample_rate
        ));
    }
    let mono = convert_to_mono(&samples, num_channels);
    Ok(normalize_audio(&mono))
}

fn convert_to_wav(path: &Path, ffmpeg: &str, scratch_dir: &Path, token: &CancelToken) -> Result<PathBuf> {
    std::fs::create_dir_all(scratch_dir)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_string());
    let output_path = scratch_dir.join(format!("{}.16k.wav", stem));

    info!("Converting {} to 16 kHz mono WAV", path.display());
    ProcessRunner::new(ffmpeg)
        .args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
        .arg(path)
        .args(["-vn", "-acodec", "pcm_s16le", "-ac", "1", "-ar", "16000"])
        .arg(&output_path)
        .run(token, |_| {})?;

    Ok(output_path)
}

/// Samples, channel count and sample rate of a 16-bit integer WAV file.
pub fn read_wav_file(path: &Path) -> Result<(Vec<f32>, usize, u32)> {
    let mut reader =
        WavReader::open(path).map_err(|e| anyhow!("Failed to read WAV file: {}", e))?;
    let spec = reader.spec();

    if spec.sample_format != SampleFormat::Int {
        return Err(anyhow!("Unsupported sample format: expected integer format"));
    }
    if spec.bits_per_sample != 16 {
        return Err(anyhow!("Unsupported bits per sample: expected 16 bits"));
    }

    let samples: Vec<f32> = reader
        .samples::<i16>()
        .map(|s| s.map(|val| val as f32))
        .collect::<std::result::Result<Vec<f32>, _>>()
        .map_err(|e| anyhow!("Failed to read samples: {}", e))?;

    Ok((samples, spec.channels as usize, spec.sample_rate))
}

pub fn convert_to_mono(samples: &[f32], num_channels: usize) -> Vec<f32> {
    if num_channels <= 1 {
        return samples.to_vec();
    }
    samples
        .par_chunks(num_channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// Scales samples into [-1, 1]. Silence is returned unchanged.
pub fn normalize_audio(samples: &[f32]) -> Vec<f32> {
    let max_abs = samples
        .par_iter()
        .map(|s| s.abs())
        .reduce(|| 0.0, f32::max);
    if max_abs == 0.0 {
        return samples.to_vec();
    }
    samples.par_iter().map(|&s| s / max_abs).collect()
}

/// Length in seconds of 16 kHz mono audio.
pub fn duration_secs(samples: &[f32]) -> f64 {
    samples.len() as f64 / WHISPER_SAMPLE_RATE as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};
    use tempfile::TempDir;

    #[test]
    fn test_convert_to_mono() {
        let stereo = [1.0, 3.0, -2.0, 2.0];
        assert_eq!(convert_to_mono(&stereo, 2), vec![2.0, 0.0]);
        assert_eq!(convert_to_mono(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn test_normalize_audio() {
        assert_eq!(normalize_audio(&[2.0, -4.0, 1.0]), vec![0.5, -1.0, 0.25]);
        assert_eq!(normalize_audio(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_read_wav_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("tone.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: WHISPER_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec)?;
        for sample in [100i16, -100, 200, -200] {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;

        let (samples, channels, rate) = read_wav_file(&path)?;
        assert_eq!(samples, vec![100.0, -100.0, 200.0, -200.0]);
        assert_eq!(channels, 2);
        assert_eq!(rate, WHISPER_SAMPLE_RATE);
        assert_eq!(duration_secs(&convert_to_mono(&samples, channels)), 2.0 / 16_000.0);
        Ok(())
    }
}
