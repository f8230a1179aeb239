// Viva - Audio capture and playback
// Uses cpal for capture and rodio for playback, rubato for resampling.
//
// The capture callback runs on the OS real-time audio thread and must never
// block: it extracts the voice channel and hands the frame to a bounded
// channel. A processing thread does the resample / quantize / metering work
// and invokes the frame callback. Playback queues on a rodio sink without
// blocking the caller. The two paths fail independently.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use crate::meter::{LevelMeter, SharedLevel};
use crate::protocol::{TARGET_CHANNELS, TARGET_SAMPLE_RATE_HZ};

/// Capture frames queued between the audio callback and the processing
/// thread before backpressure drops kick in.
const CAPTURE_QUEUE_FRAMES: usize = 32;
/// Resampler input chunk size in samples.
const RESAMPLE_CHUNK: usize = 1024;

// Global metrics for dropped capture frames.
static CAPTURE_DROP_COUNT: AtomicU64 = AtomicU64::new(0);
static LAST_DROP_LOG_MS: AtomicU64 = AtomicU64::new(0);

/// Total capture frames dropped to backpressure since startup.
pub fn capture_drops() -> u64 {
    CAPTURE_DROP_COUNT.load(Ordering::Relaxed)
}

/// Owned buffer of samples between pipeline stages, tagged with its format.
/// Frames are handed off, never shared, and the capture and playback paths
/// never exchange buffers.
#[derive(Debug)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(
            self.samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("audio configuration failed: {0}")]
    ConfigurationFailed(String),
    #[error("playback failed: {0}")]
    PlaybackFailed(String),
}

/// OS audio capability seam: device selection, permission, hardware
/// voice-processing. The session depends only on this trait; the cpal-backed
/// host is the desktop implementation.
pub trait AudioHost: Send + Sync {
    /// Ask the platform for microphone access. Desktop hosts surface the OS
    /// prompt on first stream open and report granted here.
    fn request_input_permission(&self) -> bool;
    /// Try to enable the platform's hardware voice-processing/AEC mode.
    /// Returns whether it is active; the pipeline works either way.
    fn enable_voice_processing(&self) -> bool;
    fn input_devices(&self) -> Vec<String>;
    fn output_devices(&self) -> Vec<String>;
    fn default_input(&self) -> Option<String>;
    fn default_output(&self) -> Option<String>;
}

pub struct CpalHost;

impl AudioHost for CpalHost {
    fn request_input_permission(&self) -> bool {
        true
    }

    fn enable_voice_processing(&self) -> bool {
        // cpal exposes no AEC control; rely on the OS default input path.
        false
    }

    fn input_devices(&self) -> Vec<String> {
        cpal::default_host()
            .input_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default()
    }

    fn output_devices(&self) -> Vec<String> {
        cpal::default_host()
            .output_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default()
    }

    fn default_input(&self) -> Option<String> {
        cpal::default_host()
            .default_input_device()
            .and_then(|d| d.name().ok())
    }

    fn default_output(&self) -> Option<String> {
        cpal::default_host()
            .default_output_device()
            .and_then(|d| d.name().ok())
    }
}

/// Capture and playback for one session.
///
/// Capture emits 16-bit little-endian mono frames at the target rate through
/// the frame callback; playback accepts the same format. cpal streams are not
/// `Send`, so each stream lives on its own holder thread and is torn down
/// through a stop channel.
pub struct AudioPipeline {
    host: Arc<dyn AudioHost>,
    capture: Option<CaptureHandle>,
    player: Option<Playback>,
    level: SharedLevel,
}

struct CaptureHandle {
    stop_tx: Sender<()>,
}

impl AudioPipeline {
    pub fn new(host: Arc<dyn AudioHost>) -> Self {
        Self {
            host,
            capture: None,
            player: None,
            level: SharedLevel::new(),
        }
    }

    /// Handle to the shared loudness level, readable from any thread.
    pub fn level_handle(&self) -> SharedLevel {
        self.level.clone()
    }

    pub fn current_level(&self) -> f32 {
        self.level.load()
    }

    pub fn reset_level(&self) {
        self.level.reset();
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Start capturing. `on_frame` receives PCM16 mono bytes at 24 kHz, in
    /// capture order, off the real-time thread.
    pub fn start_capture<F>(&mut self, on_frame: F) -> Result<(), AudioError>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        if self.capture.is_some() {
            log::debug!("capture already running");
            return Ok(());
        }
        if !self.host.request_input_permission() {
            return Err(AudioError::PermissionDenied);
        }
        let aec = self.host.enable_voice_processing();
        log::info!(
            "hardware voice processing {}",
            if aec { "enabled" } else { "unavailable" }
        );

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (raw_tx, raw_rx) = std::sync::mpsc::sync_channel::<AudioFrame>(CAPTURE_QUEUE_FRAMES);

        thread::spawn(move || capture_thread(ready_tx, stop_rx, raw_tx));

        let device_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(AudioError::ConfigurationFailed(
                    "capture thread exited before reporting a config".to_string(),
                ))
            }
        };

        let resampler = if device_rate != TARGET_SAMPLE_RATE_HZ {
            match StreamResampler::new(device_rate, TARGET_SAMPLE_RATE_HZ, RESAMPLE_CHUNK) {
                Ok(resampler) => Some(resampler),
                Err(err) => {
                    let _ = stop_tx.send(());
                    return Err(AudioError::ConfigurationFailed(err));
                }
            }
        } else {
            None
        };

        let level = self.level.clone();
        thread::spawn(move || processing_thread(raw_rx, resampler, level, Box::new(on_frame)));

        self.capture = Some(CaptureHandle { stop_tx });
        Ok(())
    }

    /// Stop capture. The stream is dropped on its holder thread; the
    /// processing thread drains queued frames and exits.
    pub fn stop_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            let _ = capture.stop_tx.send(());
            log::info!("capture stopped");
        }
    }

    /// Queue PCM16 mono bytes at 24 kHz for playback. Non-blocking; multiple
    /// calls queue in arrival order. The output stream opens lazily on the
    /// first chunk.
    pub fn playback(&mut self, pcm16: &[u8]) -> Result<(), AudioError> {
        if self.player.is_none() {
            self.player = Some(Playback::open()?);
        }
        let Some(player) = self.player.as_ref() else {
            return Err(AudioError::PlaybackFailed("player unavailable".to_string()));
        };
        player.play_pcm16(pcm16)
    }

    /// Stop playback and discard everything queued.
    pub fn stop_playback(&mut self) {
        if let Some(player) = self.player.as_ref() {
            player.stop();
        }
    }

    pub fn set_volume(&self, volume: f32) {
        if let Some(player) = self.player.as_ref() {
            player.set_volume(volume);
        }
    }
}

/// Owns the cpal input stream for its lifetime; parks until stopped.
fn capture_thread(
    ready_tx: Sender<Result<u32, AudioError>>,
    stop_rx: Receiver<()>,
    raw_tx: SyncSender<AudioFrame>,
) {
    let host = cpal::default_host();
    let device = match host.default_input_device() {
        Some(device) => device,
        None => {
            let _ = ready_tx.send(Err(AudioError::ConfigurationFailed(
                "no input device".to_string(),
            )));
            return;
        }
    };
    log::info!("using input device: {}", device.name().unwrap_or_default());

    let supported = match device.default_input_config() {
        Ok(config) => config,
        Err(err) => {
            let _ = ready_tx.send(Err(AudioError::ConfigurationFailed(err.to_string())));
            return;
        }
    };
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    log::info!(
        "capture config: {} channel(s) at {}Hz (target: mono {}Hz)",
        channels,
        sample_rate,
        TARGET_SAMPLE_RATE_HZ
    );

    let config: cpal::StreamConfig = supported.config();
    let err_fn = |err| log::error!("capture stream error: {err}");

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            let tx = raw_tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = extract_voice_channel(data, channels);
                    push_frame(AudioFrame::mono(mono, sample_rate), &tx);
                },
                err_fn,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let tx = raw_tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let mono: Vec<f32> = data
                        .iter()
                        .step_by(channels.max(1))
                        .map(|&s| (s as f32 / i16::MAX as f32).clamp(-1.0, 1.0))
                        .collect();
                    push_frame(AudioFrame::mono(mono, sample_rate), &tx);
                },
                err_fn,
                None,
            )
        }
        other => {
            let _ = ready_tx.send(Err(AudioError::ConfigurationFailed(format!(
                "unsupported capture sample format {other:?}"
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready_tx.send(Err(AudioError::ConfigurationFailed(err.to_string())));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::ConfigurationFailed(err.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(sample_rate));

    // Park here holding the stream; recv returns on stop or pipeline drop.
    let _ = stop_rx.recv();
    drop(stream);
    log::debug!("capture stream released");
}

/// Bounded send with backpressure - drop the frame if the consumer stalls,
/// never block the audio callback.
fn push_frame(frame: AudioFrame, tx: &SyncSender<AudioFrame>) {
    match tx.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            CAPTURE_DROP_COUNT.fetch_add(1, Ordering::Relaxed);
            // Rate-limit drop logs to avoid log storms when the consumer stalls.
            const DROP_LOG_INTERVAL_MS: u64 = 2000;
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let last_ms = LAST_DROP_LOG_MS.load(Ordering::Relaxed);
            if now_ms.saturating_sub(last_ms) >= DROP_LOG_INTERVAL_MS {
                LAST_DROP_LOG_MS.store(now_ms, Ordering::Relaxed);
                log::warn!(
                    "capture queue full, dropping frames (total drops: {})",
                    CAPTURE_DROP_COUNT.load(Ordering::Relaxed)
                );
            }
        }
        Err(TrySendError::Disconnected(_)) => {
            log::debug!("capture channel disconnected");
        }
    }
}

/// Resample, quantize, meter, emit. Runs until the capture side hangs up.
fn processing_thread(
    raw_rx: Receiver<AudioFrame>,
    mut resampler: Option<StreamResampler>,
    level: SharedLevel,
    mut on_frame: Box<dyn FnMut(Vec<u8>) + Send>,
) {
    let mut meter = LevelMeter::new();
    while let Ok(frame) = raw_rx.recv() {
        let processed = match resampler.as_mut() {
            Some(resampler) => resampler.process(&frame.samples),
            None => frame.samples,
        };
        if processed.is_empty() {
            continue;
        }
        level.store(meter.process(&processed));
        on_frame(quantize_pcm16(&processed));
    }
    log::debug!("capture processing thread exiting");
}

/// Keep channel 0 only. On multi-channel voice-processing taps the first
/// channel carries the processed voice signal; the rest are reference feeds,
/// and averaging them in corrupts the speech.
pub fn extract_voice_channel(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.iter().step_by(channels).copied().collect()
}

/// Quantize f32 samples to little-endian i16 bytes with hard clipping.
pub fn quantize_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode little-endian i16 bytes to f32 samples in [-1, 1].
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let value = i16::from_le_bytes([chunk[0], chunk[1]]);
            (value as f32 / i16::MAX as f32).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Resampler that persists across calls to avoid re-allocating sinc tables.
/// Buffers input internally to feed the fixed chunk size.
pub struct StreamResampler {
    resampler: rubato::SincFixedIn<f32>,
    chunk_size: usize,
    buffer: Vec<f32>,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self, String> {
        use rubato::{
            SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
        };

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(
            target_rate as f64 / source_rate as f64,
            2.0,
            params,
            chunk_size,
            1,
        )
        .map_err(|e| format!("resampler init failed: {e:?}"))?;

        Ok(Self {
            resampler,
            chunk_size,
            buffer: Vec::new(),
        })
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        use rubato::Resampler;

        self.buffer.extend_from_slice(samples);

        let mut output = Vec::new();
        while self.buffer.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.buffer.drain(..self.chunk_size).collect();
            let input = vec![chunk];
            match self.resampler.process(&input, None) {
                Ok(result) => {
                    if let Some(channel) = result.into_iter().next() {
                        output.extend(channel);
                    }
                }
                Err(err) => {
                    log::warn!("resampler process error: {err:?}");
                }
            }
        }
        output
    }
}

/// Playback queue over a rodio sink. The output stream is not `Send`, so it
/// lives on a holder thread; the sink itself is shared here.
struct Playback {
    sink: Sink,
    stop_tx: Sender<()>,
}

impl Playback {
    fn open() -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        thread::spawn(move || {
            let (stream, handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(err) => {
                    let _ = ready_tx.send(Err(AudioError::PlaybackFailed(err.to_string())));
                    return;
                }
            };
            match Sink::try_new(&handle) {
                Ok(sink) => {
                    let _ = ready_tx.send(Ok(sink));
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("output stream released");
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(AudioError::PlaybackFailed(err.to_string())));
                }
            }
        });

        let sink = ready_rx
            .recv()
            .map_err(|_| AudioError::PlaybackFailed("playback thread exited".to_string()))??;
        log::info!("playback stream opened");
        Ok(Self { sink, stop_tx })
    }

    fn play_pcm16(&self, bytes: &[u8]) -> Result<(), AudioError> {
        if bytes.len() % 2 != 0 {
            return Err(AudioError::PlaybackFailed(format!(
                "pcm16 payload must be an even byte count, got {}",
                bytes.len()
            )));
        }
        let samples = pcm16_to_f32(bytes);
        self.sink.append(SamplesBuffer::new(
            TARGET_CHANNELS,
            TARGET_SAMPLE_RATE_HZ,
            samples,
        ));
        Ok(())
    }

    /// Clear the queue and drop the currently-playing source. clear() leaves
    /// the current source active, skip_one() drops it, and play() unpauses
    /// so later appends are audible.
    fn stop(&self) {
        self.sink.clear();
        self.sink.skip_one();
        self.sink.play();
    }

    fn set_volume(&self, volume: f32) {
        self.sink.set_volume(volume.clamp(0.0, 1.0));
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_clips_out_of_range_samples() {
        let bytes = quantize_pcm16(&[1.5, -1.5, 0.0]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values[0], i16::MAX);
        assert_eq!(values[1], i16::MIN);
        assert_eq!(values[2], 0);
    }

    #[test]
    fn quantize_round_trips_within_tolerance() {
        let original = [0.25f32, -0.5, 0.75, -0.999];
        let decoded = pcm16_to_f32(&quantize_pcm16(&original));
        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 0.001, "{a} vs {b}");
        }
    }

    #[test]
    fn extracts_only_the_first_channel() {
        // Interleaved stereo: voice on channel 0, reference feed on channel 1.
        let interleaved = [0.1f32, 0.9, 0.2, 0.8, 0.3, 0.7];
        assert_eq!(extract_voice_channel(&interleaved, 2), vec![0.1, 0.2, 0.3]);

        // Mono passes through untouched.
        let mono = [0.5f32, 0.6];
        assert_eq!(extract_voice_channel(&mono, 1), vec![0.5, 0.6]);
    }

    #[test]
    fn pcm16_decode_scales_extremes() {
        let mut bytes = Vec::new();
        for s in [i16::MIN, 0, i16::MAX] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let samples = pcm16_to_f32(&bytes);
        assert!(samples[0] <= -0.99);
        assert!(samples[1].abs() < 0.001);
        assert!(samples[2] >= 0.99);
    }

    #[test]
    fn frame_duration_follows_rate_and_channels() {
        let frame = AudioFrame::mono(vec![0.0; 24_000], 24_000);
        assert_eq!(frame.duration(), std::time::Duration::from_secs(1));

        let stereo = AudioFrame {
            samples: vec![0.0; 48_000],
            sample_rate: 24_000,
            channels: 2,
        };
        assert_eq!(stereo.duration(), std::time::Duration::from_secs(1));

        let degenerate = AudioFrame::mono(Vec::new(), 0);
        assert_eq!(degenerate.duration(), std::time::Duration::ZERO);
    }

    #[test]
    fn resampler_preserves_duration_roughly() {
        let mut resampler = StreamResampler::new(48_000, 24_000, 256).expect("resampler");
        let input: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.01).sin()).collect();
        let output = resampler.process(&input);
        // 2:1 decimation; allow slack for the chunk still buffered inside.
        let expected = input.len() / 2;
        assert!(
            output.len() > expected / 2 && output.len() <= expected + 256,
            "unexpected output length {} for input {}",
            output.len(),
            input.len()
        );
    }
}
