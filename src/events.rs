//! Outbound session notifications

use crate::detection::{CalibrationSample, ClickSignature};
use crate::dose::DoseRecord;
use std::sync::mpsc;

/// Receives everything a session reports
pub trait EventSink: Send {
    /// A click was detected; `count` is the running total for the session
    fn on_click(&mut self, count: u32, at_ms: u64);

    fn on_calibration_sample(&mut self, sample: &CalibrationSample);

    fn on_signature_ready(&mut self, signature: &ClickSignature);

    fn on_dose_saved(&mut self, record: &DoseRecord);

    /// `kind` is a short machine-readable tag such as `permission_denied`
    fn on_error(&mut self, kind: &str, message: &str);
}

/// Owned copy of a sink notification
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Click { count: u32, at_ms: u64 },
    CalibrationSample(CalibrationSample),
    SignatureReady(ClickSignature),
    DoseSaved(DoseRecord),
    Error { kind: String, message: String },
}

/// Writes every notification to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_click(&mut self, count: u32, at_ms: u64) {
        log::info!("Click {} at {} ms", count, at_ms);
    }

    fn on_calibration_sample(&mut self, sample: &CalibrationSample) {
        log::info!(
            "Calibration sample at {} ms (energy {:.3})",
            sample.timestamp,
            sample.energy
        );
    }

    fn on_signature_ready(&mut self, signature: &ClickSignature) {
        log::info!(
            "Click signature ready from {} samples (avg energy {:.3})",
            signature.sample_count,
            signature.avg_energy
        );
    }

    fn on_dose_saved(&mut self, record: &DoseRecord) {
        log::info!("Dose saved: {} clicks = {:.2} mg", record.clicks, record.mg);
    }

    fn on_error(&mut self, kind: &str, message: &str) {
        log::error!("{}: {}", kind, message);
    }
}

/// Forwards notifications over a channel.
///
/// A dropped receiver is not an error; events are discarded.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("Event receiver dropped");
        }
    }
}

impl EventSink for ChannelSink {
    fn on_click(&mut self, count: u32, at_ms: u64) {
        self.send(SessionEvent::Click { count, at_ms });
    }

    fn on_calibration_sample(&mut self, sample: &CalibrationSample) {
        self.send(SessionEvent::CalibrationSample(sample.clone()));
    }

    fn on_signature_ready(&mut self, signature: &ClickSignature) {
        self.send(SessionEvent::SignatureReady(signature.clone()));
    }

    fn on_dose_saved(&mut self, record: &DoseRecord) {
        self.send(SessionEvent::DoseSaved(record.clone()));
    }

    fn on_error(&mut self, kind: &str, message: &str) {
        self.send(SessionEvent::Error {
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_forwards_events_in_order() {
        let (mut sink, rx) = ChannelSink::new();

        sink.on_click(1, 100);
        sink.on_error("device_unavailable", "unplugged");
        sink.on_click(2, 400);

        let events: Vec<SessionEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                SessionEvent::Click { count: 1, at_ms: 100 },
                SessionEvent::Error {
                    kind: "device_unavailable".to_string(),
                    message: "unplugged".to_string(),
                },
                SessionEvent::Click { count: 2, at_ms: 400 },
            ]
        );
    }

    #[test]
    fn channel_sink_tolerates_dropped_receiver() {
        let (mut sink, rx) = ChannelSink::new();
        drop(rx);

        sink.on_click(1, 0);
    }
}
