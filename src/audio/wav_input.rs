//! WAV file microphone using hound
//!
//! Plays a recording into the session as if it were spoken live: the file
//! is mixed to mono, resampled to the requested rate, and fed to the sink in
//! real time from a background thread.

use super::device::{CaptureStream, Microphone, SampleSink};
use crate::error::{Result, VoiceError};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Samples delivered per callback, like a device period
const BLOCK_SIZE: usize = 1024;

/// Microphone backed by a WAV file
#[derive(Clone, Debug)]
pub struct WavMicrophone {
    path: PathBuf,
    /// Seconds of silence appended so the reply can arrive before input ends
    trailing_silence: f64,
}

impl WavMicrophone {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            trailing_silence: 5.0,
        }
    }
}

#[cfg(test)]
impl WavMicrophone {
    pub fn with_trailing_silence(mut self, seconds: f64) -> Self {
        self.trailing_silence = seconds.max(0.0);
        self
    }
}

impl Microphone for WavMicrophone {
    fn open(&self, sample_rate: u32, mut sink: SampleSink) -> Result<Box<dyn CaptureStream>> {
        let mut samples = load_wav_as_mono(&self.path, sample_rate).map_err(VoiceError::device)?;
        let silence = (self.trailing_silence * sample_rate as f64) as usize;
        samples.resize(samples.len() + silence, 0.0);

        info!(
            "Streaming {:?} as microphone input ({:.1}s at {} Hz)",
            self.path,
            samples.len() as f64 / sample_rate as f64,
            sample_rate
        );

        let is_running = Arc::new(AtomicBool::new(true));
        let running = is_running.clone();
        let block_duration = Duration::from_secs_f64(BLOCK_SIZE as f64 / sample_rate as f64);

        let handle = thread::spawn(move || {
            let started = Instant::now();
            for (i, block) in samples.chunks(BLOCK_SIZE).enumerate() {
                // Pace blocks against wall clock time
                let due = started + block_duration * (i as u32 + 1);
                if let Some(wait) = due.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                sink(block);
            }
            debug!("WAV input finished");
        });

        Ok(Box::new(WavCaptureStream {
            is_running,
            thread_handle: Some(handle),
        }))
    }
}

struct WavCaptureStream {
    is_running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CaptureStream for WavCaptureStream {
    fn close(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WavCaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Load a WAV file as mono f32 samples at `target_rate`
pub fn load_wav_as_mono(path: &Path, target_rate: u32) -> std::result::Result<Vec<f32>, String> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| format!("Failed to open WAV file: {}", e))?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate;
    let channels = spec.channels.max(1) as usize;

    // Read samples based on format
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("Failed to read samples: {}", e))?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let max_val = (1u32 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| format!("Failed to read samples: {}", e))?
        }
    };

    // Convert to mono if stereo
    let mono_samples: Vec<f32> = if channels > 1 {
        samples
            .chunks(channels)
            .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    Ok(resample(&mono_samples, sample_rate, target_rate))
}

/// Simple linear resampling
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * ratio;
        let idx = src_idx as usize;
        let frac = src_idx - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac as f32) + samples[idx + 1] * frac as f32
        } else {
            samples[idx.min(samples.len() - 1)]
        };

        output.push(sample);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn write_wav(path: &Path, rate: u32, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("raitha-voice-{}-{}.wav", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_resample() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        let resampled = resample(&samples, 4, 2);
        assert_eq!(resampled.len(), 2);
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_load_stereo_as_mono() {
        let path = temp_path("stereo");
        write_wav(&path, 16000, 2, &[16384, 0, -16384, 0]);

        let samples = load_wav_as_mono(&path, 16000).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(samples, vec![0.25, -0.25]);
    }

    #[test]
    fn test_missing_file_is_device_error() {
        let mic = WavMicrophone::new("/nonexistent/input.wav");
        let err = mic.open(16000, Box::new(|_| {})).err().unwrap();
        assert!(matches!(err, VoiceError::DeviceUnavailable(_)));
    }

    #[test]
    fn test_streams_all_samples() {
        let path = temp_path("mono");
        write_wav(&path, 16000, 1, &vec![0; 3000]);

        let received = Arc::new(Mutex::new(0usize));
        let counter = received.clone();
        let mic = WavMicrophone::new(&path).with_trailing_silence(0.0);
        let mut stream = mic
            .open(
                16000,
                Box::new(move |block| *counter.lock().unwrap() += block.len()),
            )
            .unwrap();

        // 3000 samples at 16 kHz is under 200 ms of paced playback
        thread::sleep(Duration::from_millis(600));
        stream.close();
        std::fs::remove_file(&path).ok();

        assert_eq!(*received.lock().unwrap(), 3000);
    }
}
