//! Detection session controller
//!
//! Owns the one active session (listening or calibrating), the capture it
//! acquired and the detector state that goes with it. Frames are pulled one
//! per tick, either by the async polling loop ([`run_polling`]) or directly
//! through [`SessionController::poll_at`].

use crate::audio::{CaptureConstraints, CaptureError, FrameCapture, FrameSource};
use crate::detection::{
    build_signature, CalibrationRecorder, ClickDetector, ClickSignature, Detector, FrameContext,
    SignatureError,
};
use crate::dose::DoseRecord;
use crate::events::{EventSink, LogSink};
use crate::state::{SessionState, SessionStatus, Settings};
use crate::store::{DoseHistory, SettingsStore, SignatureStore, Store, StoreError};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

/// Polling period, about one display frame
pub const TICK_INTERVAL: Duration = Duration::from_millis(16);

/// Error kind reported to the sink when a write to the store fails
pub const STORE_ERROR_KIND: &str = "store";

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("A session is already active ({0:?})")]
    SessionActive(SessionState),

    #[error("Not listening")]
    NotListening,

    #[error("Not calibrating")]
    NotCalibrating,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Shared stop flag for one session
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancelToken::cancel`] has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Whether both tokens belong to the same session
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// What one poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No session, or the session was cancelled
    Idle,
    /// Capture had no frame ready
    NoFrame,
    /// Frame processed, nothing detected
    Quiet,
    /// Click detected; running count
    Click(u32),
    /// Calibration sample recorded; samples so far
    Sample(usize),
    /// Capture failed; the session has ended
    CaptureLost,
}

enum ActiveSession {
    Idle,
    Listening {
        capture: Box<dyn FrameCapture>,
        detector: Detector,
        clicks: u32,
        cancel: CancelToken,
    },
    Calibrating {
        capture: Box<dyn FrameCapture>,
        recorder: CalibrationRecorder,
        cancel: CancelToken,
    },
}

impl ActiveSession {
    fn state(&self) -> SessionState {
        match self {
            ActiveSession::Idle => SessionState::Idle,
            ActiveSession::Listening { .. } => SessionState::Listening,
            ActiveSession::Calibrating { .. } => SessionState::Calibrating,
        }
    }

    fn cancel_token(&self) -> Option<&CancelToken> {
        match self {
            ActiveSession::Idle => None,
            ActiveSession::Listening { cancel, .. } | ActiveSession::Calibrating { cancel, .. } => {
                Some(cancel)
            }
        }
    }
}

/// Session lifecycle: Idle, Listening or Calibrating
pub struct SessionController {
    source: Box<dyn FrameSource>,
    store: Box<dyn Store>,
    sink: Box<dyn EventSink>,
    settings: Settings,
    signature: Option<ClickSignature>,
    session: ActiveSession,
    clock: Instant,
}

impl SessionController {
    /// Create an idle controller with settings and signature loaded from `store`
    pub fn new(source: Box<dyn FrameSource>, store: Box<dyn Store>) -> Self {
        let settings = match store.load_settings() {
            Ok(settings) => settings.unwrap_or_default(),
            Err(e) => {
                log::warn!("Ignoring stored settings: {}", e);
                Settings::default()
            }
        };
        let signature = match store.load_signature() {
            Ok(signature) => signature,
            Err(e) => {
                log::warn!("Ignoring stored click signature: {}", e);
                None
            }
        };

        Self {
            source,
            store,
            sink: Box::new(LogSink),
            settings,
            signature,
            session: ActiveSession::Idle,
            clock: Instant::now(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn signature(&self) -> Option<&ClickSignature> {
        self.signature.as_ref()
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Clicks counted in the current listening session
    pub fn click_count(&self) -> u32 {
        match &self.session {
            ActiveSession::Listening { clicks, .. } => *clicks,
            _ => 0,
        }
    }

    pub fn calibration_sample_count(&self) -> usize {
        match &self.session {
            ActiveSession::Calibrating { recorder, .. } => recorder.sample_count(),
            _ => 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state(),
            click_count: self.click_count(),
            calibration_samples: self.calibration_sample_count(),
            has_signature: self.signature.is_some(),
            mode: self.settings.mode,
            sensitivity: self.settings.sensitivity,
        }
    }

    /// Token of the active session, if any
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.session.cancel_token().cloned()
    }

    /// Replace and persist the settings. Only allowed while idle.
    pub fn update_settings(&mut self, settings: Settings) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.settings = settings.sanitized();
        self.store.save_settings(&self.settings)?;
        log::info!(
            "Settings updated: mode {}, sensitivity {:.2}",
            self.settings.mode,
            self.settings.sensitivity
        );
        Ok(())
    }

    /// Forget the calibrated signature. Only allowed while idle.
    pub fn clear_signature(&mut self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.store.clear_signature()?;
        self.signature = None;
        log::info!("Click signature cleared");
        Ok(())
    }

    /// Idle -> Listening
    pub fn start_listening(&mut self) -> Result<CancelToken, SessionError> {
        self.ensure_idle()?;

        let constraints = CaptureConstraints::listening().with_device(self.settings.device.clone());
        let capture = self.acquire(&constraints)?;
        let cancel = CancelToken::new();

        let mut detector = Detector::for_mode(self.settings.mode);
        detector.reset();

        self.session = ActiveSession::Listening {
            capture,
            detector,
            clicks: 0,
            cancel: cancel.clone(),
        };
        log::info!(
            "Listening started ({} mode, sensitivity {:.2}, signature {})",
            self.settings.mode,
            self.settings.sensitivity,
            if self.signature.is_some() { "loaded" } else { "none" }
        );
        Ok(cancel)
    }

    /// Listening -> Idle, discarding the count. Returns the discarded count.
    pub fn stop(&mut self) -> Result<u32, SessionError> {
        let clicks = self.end_listening()?;
        log::info!("Listening stopped after {} clicks", clicks);
        Ok(clicks)
    }

    /// Listening -> Idle, recording the count as a dose first.
    ///
    /// The dose is written before the session ends. If the write fails the
    /// session keeps listening with its count intact, so the caller can retry.
    pub fn stop_and_save(&mut self) -> Result<DoseRecord, SessionError> {
        let clicks = match &self.session {
            ActiveSession::Listening { clicks, .. } => *clicks,
            _ => return Err(SessionError::NotListening),
        };
        let record = DoseRecord::new(clicks, &self.settings.pen, self.settings.mode, unix_millis());

        if let Err(e) = self.store.append_dose(&record) {
            log::error!("Failed to save dose of {} clicks, still listening: {}", clicks, e);
            self.sink.on_error(STORE_ERROR_KIND, &e.to_string());
            return Err(e.into());
        }

        self.end_listening()?;
        self.sink.on_dose_saved(&record);
        log::info!("Listening stopped, saved {} clicks ({:.2} mg)", record.clicks, record.mg);
        Ok(record)
    }

    /// Idle -> Calibrating
    pub fn start_calibration(&mut self) -> Result<CancelToken, SessionError> {
        self.ensure_idle()?;

        let constraints =
            CaptureConstraints::calibration().with_device(self.settings.device.clone());
        let capture = self.acquire(&constraints)?;
        let cancel = CancelToken::new();

        self.session = ActiveSession::Calibrating {
            capture,
            recorder: CalibrationRecorder::new(),
            cancel: cancel.clone(),
        };
        log::info!("Calibration started");
        Ok(cancel)
    }

    /// Calibrating -> Idle, building and persisting a signature from the
    /// collected samples. Too few samples end calibration without one.
    ///
    /// If the signature cannot be written, calibration stays active with its
    /// samples so the caller can retry or cancel.
    pub fn finish_calibration(&mut self) -> Result<Option<ClickSignature>, SessionError> {
        let built = match &self.session {
            ActiveSession::Calibrating { recorder, .. } => {
                build_signature(recorder.samples(), unix_millis())
            }
            _ => return Err(SessionError::NotCalibrating),
        };

        let signature = match built {
            Ok(signature) => signature,
            Err(SignatureError::InsufficientSamples { found, required }) => {
                self.end_calibration();
                log::warn!(
                    "Calibration finished with {} of {} required clicks, no signature built",
                    found,
                    required
                );
                return Ok(None);
            }
        };

        if let Err(e) = self.store.save_signature(&signature) {
            log::error!("Failed to save click signature, still calibrating: {}", e);
            self.sink.on_error(STORE_ERROR_KIND, &e.to_string());
            return Err(e.into());
        }

        self.end_calibration();
        self.signature = Some(signature.clone());
        self.sink.on_signature_ready(&signature);
        log::info!("Calibration finished with {} samples", signature.sample_count);
        Ok(Some(signature))
    }

    /// Calibrating -> Idle, discarding all samples. Returns how many were dropped.
    pub fn cancel_calibration(&mut self) -> Result<usize, SessionError> {
        if self.session.state() != SessionState::Calibrating {
            return Err(SessionError::NotCalibrating);
        }
        let discarded = self.end_calibration();
        log::info!("Calibration cancelled, {} samples discarded", discarded);
        Ok(discarded)
    }

    /// Process at most one frame using the controller's monotonic clock
    pub fn poll(&mut self) -> TickOutcome {
        let now_ms = self.clock.elapsed().as_millis() as u64;
        self.poll_at(now_ms)
    }

    /// Process at most one frame, stamping events with `now_ms`.
    ///
    /// A capture failure ends the session and is reported to the sink once.
    pub fn poll_at(&mut self, now_ms: u64) -> TickOutcome {
        let next = match &mut self.session {
            ActiveSession::Idle => return TickOutcome::Idle,
            ActiveSession::Listening { capture, cancel, .. }
            | ActiveSession::Calibrating { capture, cancel, .. } => {
                if cancel.is_cancelled() {
                    return TickOutcome::Idle;
                }
                capture.next_frame()
            }
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => return TickOutcome::NoFrame,
            Err(e) => {
                self.abort(e);
                return TickOutcome::CaptureLost;
            }
        };

        match &mut self.session {
            ActiveSession::Idle => TickOutcome::Idle,
            ActiveSession::Listening { detector, clicks, .. } => {
                let ctx = FrameContext {
                    sensitivity: self.settings.sensitivity,
                    signature: self.signature.as_ref(),
                    now_ms,
                };
                if !detector.on_frame(&frame, &ctx) {
                    return TickOutcome::Quiet;
                }

                *clicks += 1;
                self.sink.on_click(*clicks, now_ms);
                TickOutcome::Click(*clicks)
            }
            ActiveSession::Calibrating { recorder, .. } => {
                match recorder.on_frame(&frame, now_ms) {
                    Some(sample) => {
                        self.sink.on_calibration_sample(sample);
                        TickOutcome::Sample(recorder.sample_count())
                    }
                    None => TickOutcome::Quiet,
                }
            }
        }
    }

    /// Poll only if `token` still belongs to the active session
    pub fn poll_session(&mut self, token: &CancelToken) -> TickOutcome {
        match self.session.cancel_token() {
            Some(active) if active.same_as(token) => self.poll(),
            _ => TickOutcome::Idle,
        }
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        match self.session.state() {
            SessionState::Idle => Ok(()),
            active => Err(SessionError::SessionActive(active)),
        }
    }

    fn acquire(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn FrameCapture>, SessionError> {
        self.source.acquire(constraints).map_err(|e| {
            log::error!("Failed to acquire audio capture: {}", e);
            self.sink.on_error(e.kind(), &e.to_string());
            SessionError::Capture(e)
        })
    }

    fn end_listening(&mut self) -> Result<u32, SessionError> {
        match std::mem::replace(&mut self.session, ActiveSession::Idle) {
            ActiveSession::Listening {
                mut capture,
                clicks,
                cancel,
                ..
            } => {
                cancel.cancel();
                capture.release();
                Ok(clicks)
            }
            other => {
                self.session = other;
                Err(SessionError::NotListening)
            }
        }
    }

    /// Tear down a calibration session, returning how many samples it held
    fn end_calibration(&mut self) -> usize {
        match std::mem::replace(&mut self.session, ActiveSession::Idle) {
            ActiveSession::Calibrating {
                mut capture,
                recorder,
                cancel,
            } => {
                cancel.cancel();
                capture.release();
                recorder.sample_count()
            }
            other => {
                self.session = other;
                0
            }
        }
    }

    /// End whatever session is active after its capture failed
    fn abort(&mut self, error: CaptureError) {
        match std::mem::replace(&mut self.session, ActiveSession::Idle) {
            ActiveSession::Idle => return,
            ActiveSession::Listening {
                mut capture,
                clicks,
                cancel,
                ..
            } => {
                cancel.cancel();
                capture.release();
                log::error!("Capture lost while listening after {} clicks: {}", clicks, error);
            }
            ActiveSession::Calibrating {
                mut capture,
                recorder,
                cancel,
            } => {
                cancel.cancel();
                capture.release();
                log::error!(
                    "Capture lost while calibrating, {} samples discarded: {}",
                    recorder.sample_count(),
                    error
                );
            }
        }
        self.sink.on_error(error.kind(), &error.to_string());
    }
}

/// Drive the session owning `cancel` once per tick until it is cancelled.
///
/// Missed ticks are skipped, never queued, and each tick evaluates at most
/// one frame.
pub async fn run_polling(controller: Arc<Mutex<SessionController>>, cancel: CancelToken) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    log::info!("Polling task started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Polling task received cancel signal");
                break;
            }
            _ = interval.tick() => {
                if cancel.is_cancelled() {
                    break;
                }
                match controller.lock().poll_session(&cancel) {
                    TickOutcome::Idle | TickOutcome::CaptureLost => break,
                    _ => {}
                }
            }
        }
    }

    log::info!("Polling task stopped");
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
