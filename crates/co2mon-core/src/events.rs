//! Event system for decoupling the session from its consumers.
//!
//! CLIs, loggers and tests subscribe to session notifications by
//! implementing [`MonitorObserver`] or by draining a [`ChannelObserver`].

use std::fmt;
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::protocol::Measurement;
use crate::reading::Reading;

/// Category of a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DeviceNotFound,
    InterfaceNotFound,
    Transport,
    Endpoint,
    ProtocolAnomaly,
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::DeviceNotFound => write!(f, "device-not-found"),
            ErrorKind::InterfaceNotFound => write!(f, "interface-not-found"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Endpoint => write!(f, "endpoint"),
            ErrorKind::ProtocolAnomaly => write!(f, "protocol-anomaly"),
            ErrorKind::InvalidState => write!(f, "invalid-state"),
        }
    }
}

/// Events emitted by a device session.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// Handshake finished and the interface is claimed.
    Connected { vid: u16, pid: u16 },
    /// Teardown finished (also emitted when there was nothing to tear down).
    Disconnected,
    /// Something went wrong; not necessarily fatal.
    Error { kind: ErrorKind, message: String },
    Co2(Measurement),
    Temperature(Measurement),
    Humidity(Measurement),
    /// All three quantities are known.
    Data(Reading),
    /// Frame as received, before decoding.
    RawFrame(Vec<u8>),
}

impl MonitorEvent {
    /// Event name as seen by subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::Connected { .. } => "connected",
            MonitorEvent::Disconnected => "disconnected",
            MonitorEvent::Error { .. } => "error",
            MonitorEvent::Co2(_) => "co2",
            MonitorEvent::Temperature(_) => "temperature",
            MonitorEvent::Humidity(_) => "humidity",
            MonitorEvent::Data(_) => "data",
            MonitorEvent::RawFrame(_) => "rawFrame",
        }
    }
}

/// Observer trait for receiving session events.
pub trait MonitorObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &MonitorEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl MonitorObserver for NullObserver {
    fn on_event(&self, _event: &MonitorEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl MonitorObserver for TracingObserver {
    fn on_event(&self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Connected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Monitor connected");
            }
            MonitorEvent::Disconnected => {
                tracing::info!("Monitor disconnected");
            }
            MonitorEvent::Error { kind, message } => {
                tracing::error!(kind = %kind, "Error: {}", message);
            }
            MonitorEvent::Co2(m) | MonitorEvent::Temperature(m) | MonitorEvent::Humidity(m) => {
                tracing::info!(kind = %m.kind, raw = m.raw, "{}", m);
            }
            MonitorEvent::Data(reading) => {
                tracing::info!("Reading: {}", reading);
            }
            MonitorEvent::RawFrame(bytes) => {
                tracing::trace!(frame = %format!("{:02X?}", bytes), "Raw frame");
            }
        }
    }
}

/// Observer that forwards every event into an mpsc channel.
pub struct ChannelObserver {
    sender: Mutex<Sender<MonitorEvent>>,
}

impl ChannelObserver {
    /// Create the observer together with the receiving end.
    pub fn channel() -> (Self, Receiver<MonitorEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl MonitorObserver for ChannelObserver {
    fn on_event(&self, event: &MonitorEvent) {
        if let Ok(sender) = self.sender.lock() {
            // A dropped receiver just means nobody is listening any more.
            let _ = sender.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MeasurementKind;

    #[test]
    fn test_event_names() {
        let m = Measurement::new(MeasurementKind::Co2, 400);
        assert_eq!(MonitorEvent::Co2(m).name(), "co2");
        assert_eq!(MonitorEvent::Data(Reading::new()).name(), "data");
        assert_eq!(MonitorEvent::RawFrame(vec![0; 8]).name(), "rawFrame");
        assert_eq!(MonitorEvent::Disconnected.name(), "disconnected");
    }

    #[test]
    fn test_channel_observer_forwards() {
        let (observer, rx) = ChannelObserver::channel();
        observer.on_event(&MonitorEvent::Connected {
            vid: 0x04D9,
            pid: 0xA052,
        });
        observer.on_event(&MonitorEvent::Disconnected);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], MonitorEvent::Disconnected);
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::channel();
        drop(rx);
        observer.on_event(&MonitorEvent::Disconnected);
    }
}
