//! Microphone capture implementation using a dedicated thread

use super::{CaptureConstraints, CaptureError, FftAnalyzer, Frame, FrameCapture, FrameSource};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long acquisition waits for the capture thread to open the device
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Control messages for the capture thread
enum AudioCommand {
    Stop,
}

/// Live microphone capture.
///
/// The `cpal::Stream` is not `Send`, so it lives on its own thread; the
/// stream callback only pushes mono samples into the shared buffer.
pub struct AudioCaptureHandle {
    /// Control channel to the capture thread
    command_tx: mpsc::Sender<AudioCommand>,

    /// Joined on release
    thread_handle: Option<JoinHandle<()>>,

    /// Latest mono samples (shared with the stream callback)
    buffer: Arc<Mutex<AudioBuffer>>,

    /// First error the stream reported after it started playing
    failure: Arc<Mutex<Option<CaptureError>>>,

    /// Write counter of the buffer when the last frame was analysed
    last_written: Option<u64>,

    /// Analyzer run on the polling side, one frame per tick
    analyzer: FftAnalyzer,

    sample_rate: u32,
}

impl AudioCaptureHandle {
    /// Open the input device described by `constraints` and start capturing.
    ///
    /// Blocks until the capture thread reports that the stream is playing,
    /// or fails with the reason it could not be opened.
    pub fn open(constraints: &CaptureConstraints) -> Result<Self, CaptureError> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let buffer = Arc::new(Mutex::new(AudioBuffer::new(constraints.fft_size.max(1))));
        let buffer_clone = buffer.clone();
        let failure = Arc::new(Mutex::new(None));
        let failure_clone = failure.clone();
        let device_name = constraints.device.clone();
        let fft_size = constraints.fft_size;

        let thread_handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                run_audio_thread(
                    device_name,
                    fft_size,
                    command_rx,
                    ready_tx,
                    buffer_clone,
                    failure_clone,
                );
            })
            .map_err(|e| CaptureError::Unsupported(format!("capture thread: {}", e)))?;

        let sample_rate = match ready_rx.recv_timeout(ACQUIRE_TIMEOUT) {
            Ok(Ok(sample_rate)) => sample_rate,
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = command_tx.send(AudioCommand::Stop);
                return Err(CaptureError::DeviceUnavailable(
                    "timed out opening input device".to_string(),
                ));
            }
        };

        Ok(Self {
            command_tx,
            thread_handle: Some(thread_handle),
            buffer,
            failure,
            last_written: None,
            analyzer: FftAnalyzer::new(constraints),
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Stop the stream and join the capture thread. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.command_tx.send(AudioCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            log::info!("Microphone released");
        }
    }
}

impl FrameCapture for AudioCaptureHandle {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.thread_handle.is_none() {
            return Ok(None);
        }

        let failure = self.failure.lock().take();
        if let Some(e) = failure {
            self.stop();
            return Err(e);
        }

        // Copy samples under lock, then release before the FFT
        let latest = self
            .buffer
            .lock()
            .latest_since(self.last_written, self.analyzer.fft_size());
        let Some((samples, written)) = latest else {
            return Ok(None);
        };
        self.last_written = Some(written);

        Ok(self.analyzer.analyze(&samples))
    }

    fn release(&mut self) {
        self.stop();
    }
}

impl Drop for AudioCaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Frame source backed by the host's microphones
#[derive(Debug, Default)]
pub struct MicrophoneSource;

impl MicrophoneSource {
    pub fn new() -> Self {
        Self
    }
}

impl FrameSource for MicrophoneSource {
    fn acquire(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn FrameCapture>, CaptureError> {
        let handle = AudioCaptureHandle::open(constraints)?;
        log::info!(
            "Microphone acquired: {} Hz, {}-point transform, smoothing {:.2}",
            handle.sample_rate(),
            constraints.fft_size,
            constraints.smoothing
        );
        Ok(Box::new(handle))
    }
}

/// Ring of the most recent mono samples
pub struct AudioBuffer {
    samples: Vec<f32>,
    write_pos: usize,
    capacity: usize,
    filled: usize,
    /// Samples pushed since creation
    written: u64,
}

impl AudioBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            write_pos: 0,
            capacity,
            filled: 0,
            written: 0,
        }
    }

    pub fn push_samples(&mut self, data: &[f32]) {
        for &sample in data {
            self.samples[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
        self.filled = (self.filled + data.len()).min(self.capacity);
        self.written += data.len() as u64;
    }

    /// Number of valid samples held
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn get_latest(&self, count: usize) -> Vec<f32> {
        let count = count.min(self.capacity);
        let mut result = Vec::with_capacity(count);

        let start = if self.write_pos >= count {
            self.write_pos - count
        } else {
            self.capacity - (count - self.write_pos)
        };

        for i in 0..count {
            let idx = (start + i) % self.capacity;
            result.push(self.samples[idx]);
        }

        result
    }

    /// Latest `count` samples and the write counter, or `None` while the
    /// buffer holds fewer than `count` samples or nothing was pushed since
    /// `last_written`.
    pub fn latest_since(
        &self,
        last_written: Option<u64>,
        count: usize,
    ) -> Option<(Vec<f32>, u64)> {
        if self.filled < count || last_written == Some(self.written) {
            return None;
        }
        Some((self.get_latest(count), self.written))
    }
}

/// Capture thread body: open the stream, report readiness, park until stopped
fn run_audio_thread(
    device_name: Option<String>,
    fft_size: usize,
    command_rx: mpsc::Receiver<AudioCommand>,
    ready_tx: mpsc::SyncSender<Result<u32, CaptureError>>,
    buffer: Arc<Mutex<AudioBuffer>>,
    failure: Arc<Mutex<Option<CaptureError>>>,
) {
    let stream = match open_stream(device_name, fft_size, buffer, failure) {
        Ok((stream, sample_rate)) => {
            let _ = ready_tx.send(Ok(sample_rate));
            stream
        }
        Err(e) => {
            log::error!("Audio capture failed to start: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Park until told to stop; the stream lives on this thread
    match command_rx.recv() {
        Ok(AudioCommand::Stop) => log::debug!("Audio capture stopping"),
        Err(_) => log::debug!("Audio capture channel disconnected"),
    }

    drop(stream);
}

fn open_stream(
    device_name: Option<String>,
    fft_size: usize,
    buffer: Arc<Mutex<AudioBuffer>>,
    failure: Arc<Mutex<Option<CaptureError>>>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();

    let device = match &device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| classify_backend(e.to_string()))?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("input device not found: {}", name)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".to_string()))?,
    };

    let config = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable(e.to_string())
        }
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            CaptureError::Unsupported(e.to_string())
        }
        other => classify_backend(other.to_string()),
    })?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels().max(1) as usize;

    log::info!("Audio capture: {} Hz, {} channels", sample_rate, channels);

    // A tenth of a second of history, never less than one transform
    let capacity = (sample_rate as usize / 10).max(fft_size).max(1);
    *buffer.lock() = AudioBuffer::new(capacity);

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config.into(), buffer, failure, channels),
        SampleFormat::I16 => build_stream::<i16>(&device, &config.into(), buffer, failure, channels),
        SampleFormat::U16 => build_stream::<u16>(&device, &config.into(), buffer, failure, channels),
        other => {
            return Err(CaptureError::Unsupported(format!(
                "sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => CaptureError::DeviceUnavailable(e.to_string()),
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => CaptureError::Unsupported(e.to_string()),
        other => classify_backend(other.to_string()),
    })?;

    stream.play().map_err(|e| match e {
        cpal::PlayStreamError::DeviceNotAvailable => CaptureError::DeviceUnavailable(e.to_string()),
        other => classify_backend(other.to_string()),
    })?;

    Ok((stream, sample_rate))
}

/// Map an opaque backend message onto the capture error taxonomy
fn classify_backend(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        CaptureError::PermissionDenied(message)
    } else if lower.contains("not available") || lower.contains("no such device") {
        CaptureError::DeviceUnavailable(message)
    } else {
        CaptureError::Unsupported(message)
    }
}

/// Map a runtime stream error onto the capture error taxonomy
fn map_stream_error(err: cpal::StreamError) -> CaptureError {
    match err {
        cpal::StreamError::DeviceNotAvailable => CaptureError::DeviceUnavailable(err.to_string()),
        other => classify_backend(other.to_string()),
    }
}

/// Input stream for sample type `T`, downmixed to mono
fn build_stream<T: cpal::Sample + cpal::SizedSample>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<AudioBuffer>>,
    failure: Arc<Mutex<Option<CaptureError>>>,
    channels: usize,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    f32: cpal::FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // Downmix interleaved frames to mono f32
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| {
                    let sum: f32 = frame
                        .iter()
                        .map(|s| -> f32 { cpal::Sample::from_sample(*s) })
                        .sum();
                    sum / channels as f32
                })
                .collect();

            buffer.lock().push_samples(&mono);
        },
        move |err| {
            log::error!("Audio stream error: {}", err);
            // Keep the first failure; the poller ends the session on it
            failure.lock().get_or_insert_with(|| map_stream_error(err));
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_latest_returns_recent_samples_in_order() {
        let mut buffer = AudioBuffer::new(8);
        buffer.push_samples(&[1.0, 2.0, 3.0, 4.0]);

        let latest = buffer.get_latest(3);
        assert_eq!(latest, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn circular_buffer_wraps_and_preserves_time_order() {
        let mut buffer = AudioBuffer::new(5);
        buffer.push_samples(&[1.0, 2.0, 3.0]);
        buffer.push_samples(&[4.0, 5.0, 6.0]);

        let latest = buffer.get_latest(5);
        assert_eq!(latest, vec![2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn len_tracks_fill_level_up_to_capacity() {
        let mut buffer = AudioBuffer::new(4);
        assert!(buffer.is_empty());

        buffer.push_samples(&[1.0, 2.0]);
        assert_eq!(buffer.len(), 2);

        buffer.push_samples(&[3.0, 4.0, 5.0]);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn latest_since_skips_when_nothing_new_was_written() {
        let mut buffer = AudioBuffer::new(4);
        buffer.push_samples(&[1.0, 2.0]);
        assert!(buffer.latest_since(None, 4).is_none());

        buffer.push_samples(&[3.0, 4.0]);
        let (samples, written) = buffer.latest_since(None, 4).unwrap();
        assert_eq!(samples, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(written, 4);

        // Same audio as last tick
        assert!(buffer.latest_since(Some(written), 4).is_none());

        buffer.push_samples(&[5.0]);
        let (samples, written) = buffer.latest_since(Some(written), 4).unwrap();
        assert_eq!(samples, vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(written, 5);
    }

    #[test]
    fn stream_errors_are_classified() {
        assert_eq!(
            map_stream_error(cpal::StreamError::DeviceNotAvailable).kind(),
            "device_unavailable"
        );
        let denied = cpal::StreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "permission denied".to_string(),
            },
        };
        assert_eq!(map_stream_error(denied).kind(), "permission_denied");
    }

    #[test]
    fn backend_messages_are_classified() {
        assert_eq!(
            classify_backend("Access denied by privacy settings".to_string()).kind(),
            "permission_denied"
        );
        assert_eq!(
            classify_backend("device not available".to_string()).kind(),
            "device_unavailable"
        );
        assert_eq!(
            classify_backend("ALSA function failed".to_string()).kind(),
            "unsupported"
        );
    }
}
