//! Device session - lifecycle state machine and frame pipeline.
//!
//! A session walks `Idle -> Connecting -> Streaming -> Disconnecting -> Closed`.
//! Every operation checks the current state first and is rejected with
//! [`SessionError::InvalidState`] when it does not apply.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::events::{ErrorKind, MonitorEvent, MonitorObserver, TracingObserver};
use crate::protocol::constants::{
    ARM_INDEX, ARM_REQUEST, ARM_REQUEST_TYPE, ARM_VALUE, DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID,
    FRAME_SIZE, OBFUSCATION_KEY, POLL_DEPTH,
};
use crate::protocol::{Measurement, MeasurementKind, ParsedFrame, RawFrame, parse};
use crate::reading::Reading;
use crate::transport::{ControlSetup, TransportError, UsbSession};

/// Control transfer that arms the device for streaming.
const ARM_SETUP: ControlSetup = ControlSetup {
    request_type: ARM_REQUEST_TYPE,
    request: ARM_REQUEST,
    value: ARM_VALUE,
    index: ARM_INDEX,
};

/// Vendor/product pair the session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

/// What to do when the streaming endpoint fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum EndpointErrorPolicy {
    /// Tear the session down and surface the error.
    #[default]
    Fatal,
    /// Tear down, then connect and restart streaming up to `max_attempts` times.
    Reconnect { max_attempts: u32 },
}

/// Configuration for a device session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device to open.
    pub identity: DeviceIdentity,
    /// Emit `RawFrame` events for every frame received.
    pub emit_raw_frames: bool,
    /// Reaction to endpoint errors while streaming.
    pub endpoint_error_policy: EndpointErrorPolicy,
    /// How long a single poll waits for a frame.
    pub poll_timeout_ms: u64,
    /// Bound on draining in-flight transfers during disconnect.
    pub disconnect_timeout_ms: u64,
    /// Timeout of the arming control transfer and the priming transfer.
    pub control_timeout_ms: u64,
    /// Pause before each reconnect attempt.
    pub reconnect_delay_ms: u64,
    /// Consecutive unrecognized opcodes before an anomaly is reported (0 = never).
    pub unrecognized_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity::default(),
            emit_raw_frames: false,
            endpoint_error_policy: EndpointErrorPolicy::Fatal,
            poll_timeout_ms: 1000,
            disconnect_timeout_ms: 2000,
            control_timeout_ms: 1000,
            reconnect_delay_ms: 1000,
            unrecognized_threshold: 32,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing held.
    #[default]
    Idle,
    /// Handshake done, interface claimed, endpoint resolved; not yet polling.
    Connecting,
    /// Polling frames.
    Streaming,
    /// Teardown in progress.
    Disconnecting,
    /// Torn down. A new `connect` may start over.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Streaming => write!(f, "STREAMING"),
            SessionState::Disconnecting => write!(f, "DISCONNECTING"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Interface not found on device")]
    InterfaceNotFound,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Endpoint error: {0}")]
    Endpoint(TransportError),

    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            SessionError::InterfaceNotFound => ErrorKind::InterfaceNotFound,
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::Endpoint(_) => ErrorKind::Endpoint,
            SessionError::ProtocolAnomaly(_) => ErrorKind::ProtocolAnomaly,
            SessionError::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }
}

/// Resources acquired on the device, released in reverse on teardown.
#[derive(Debug, Default)]
struct Held {
    opened: bool,
    detached: bool,
    claimed: bool,
    endpoint: Option<u8>,
    polling: bool,
}

/// Device session - owns the USB session and drives the frame pipeline.
pub struct DeviceSession<U: UsbSession, O: MonitorObserver = TracingObserver> {
    usb: U,
    observer: Arc<O>,
    config: SessionConfig,
    state: SessionState,
    held: Held,
    reading: Reading,
    unrecognized_streak: u32,
}

impl<U: UsbSession> DeviceSession<U, TracingObserver> {
    /// Create a new session with the default tracing observer.
    pub fn new(usb: U, config: SessionConfig) -> Self {
        Self::with_observer(usb, config, Arc::new(TracingObserver))
    }
}

impl<U: UsbSession, O: MonitorObserver> DeviceSession<U, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(usb: U, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            usb,
            observer,
            config,
            state: SessionState::Idle,
            held: Held::default(),
            reading: Reading::new(),
            unrecognized_streak: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.config.identity
    }

    /// Change the device to open. Only allowed while nothing is held.
    pub fn set_identity(&mut self, identity: DeviceIdentity) -> Result<(), SessionError> {
        self.guard("set identity", &[SessionState::Idle, SessionState::Closed])?;
        self.config.identity = identity;
        Ok(())
    }

    /// Live aggregate of the latest measurements.
    pub fn reading(&self) -> &Reading {
        &self.reading
    }

    pub fn co2(&self) -> Option<Measurement> {
        self.reading.co2
    }

    pub fn temperature(&self) -> Option<Measurement> {
        self.reading.temperature
    }

    pub fn humidity(&self) -> Option<Measurement> {
        self.reading.humidity
    }

    /// Address of the streaming endpoint, once resolved.
    pub fn endpoint(&self) -> Option<u8> {
        self.held.endpoint
    }

    fn emit(&self, event: MonitorEvent) {
        self.observer.on_event(&event);
    }

    fn report(&self, err: &SessionError) {
        self.emit(MonitorEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn goto_state(&mut self, new_state: SessionState) {
        info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }

    fn guard(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let err = SessionError::InvalidState {
            operation,
            state: self.state,
        };
        self.report(&err);
        Err(err)
    }

    /// Open the device, arm it and claim the interface.
    ///
    /// On failure everything acquired so far is released and the session
    /// returns to `Idle`.
    #[instrument(skip(self), fields(device = %self.config.identity))]
    pub fn connect(&mut self) -> Result<(), SessionError> {
        self.guard("connect", &[SessionState::Idle, SessionState::Closed])?;
        self.goto_state(SessionState::Connecting);

        match self.handshake() {
            Ok(()) => {
                self.emit(MonitorEvent::Connected {
                    vid: self.usb.vendor_id(),
                    pid: self.usb.product_id(),
                });
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Connect failed, releasing partial session");
                self.report(&err);
                self.teardown();
                self.goto_state(SessionState::Idle);
                Err(err)
            }
        }
    }

    fn handshake(&mut self) -> Result<(), SessionError> {
        let DeviceIdentity {
            vendor_id: vid,
            product_id: pid,
        } = self.config.identity;

        self.usb.open(vid, pid).map_err(|e| match e {
            TransportError::DeviceNotFound { vid, pid } => SessionError::DeviceNotFound { vid, pid },
            other => SessionError::Transport(other),
        })?;
        self.held.opened = true;

        if !self.usb.has_interface() {
            return Err(SessionError::InterfaceNotFound);
        }

        if self.usb.supports_kernel_driver() {
            self.held.detached = self.usb.detach_kernel_driver()?;
            debug!(detached = self.held.detached, "Kernel driver check");
        }

        self.usb
            .control_transfer(ARM_SETUP, &OBFUSCATION_KEY, self.config.control_timeout())?;
        debug!("Device armed");

        self.usb.claim_interface()?;
        self.held.claimed = true;

        let endpoint = self.usb.resolve_endpoint()?;
        self.held.endpoint = Some(endpoint);
        info!(endpoint = %format!("0x{:02X}", endpoint), "Session established");
        Ok(())
    }

    /// Prime the endpoint and start polling.
    #[instrument(skip(self))]
    pub fn start_transfer(&mut self) -> Result<(), SessionError> {
        self.guard("start transfer", &[SessionState::Connecting])?;

        let result = self
            .usb
            .transfer(FRAME_SIZE, self.config.control_timeout())
            .and_then(|primed| {
                trace!(frame = %format!("{:02X?}", primed), "Priming transfer complete");
                self.usb.start_poll(FRAME_SIZE, POLL_DEPTH)
            });

        if let Err(e) = result {
            let err = SessionError::Transport(e);
            self.report(&err);
            return Err(err);
        }

        self.held.polling = true;
        self.goto_state(SessionState::Streaming);
        Ok(())
    }

    /// Wait for one frame and route it. Returns whether a frame arrived.
    pub fn poll(&mut self) -> Result<bool, SessionError> {
        self.guard("poll", &[SessionState::Streaming])?;

        match self.usb.next_frame(self.config.poll_timeout()) {
            Ok(Some(frame)) => {
                // Per-frame problems are reported inside and never stop the stream.
                self.route_frame(&frame);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => self.handle_endpoint_error(e),
        }
    }

    /// Pump frames until `shutdown` is raised, then disconnect.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), SessionError> {
        let result = loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested");
                break Ok(());
            }
            if let Err(e) = self.poll() {
                break Err(e);
            }
        };

        if matches!(
            self.state,
            SessionState::Connecting | SessionState::Streaming
        ) {
            self.disconnect()?;
        }
        result
    }

    fn handle_endpoint_error(&mut self, e: TransportError) -> Result<bool, SessionError> {
        let err = SessionError::Endpoint(e);
        self.report(&err);

        match self.config.endpoint_error_policy {
            EndpointErrorPolicy::Fatal => {
                self.disconnect()?;
                Err(err)
            }
            EndpointErrorPolicy::Reconnect { max_attempts } => {
                self.disconnect()?;
                for attempt in 1..=max_attempts {
                    thread::sleep(Duration::from_millis(self.config.reconnect_delay_ms));
                    info!(attempt, max_attempts, "Reconnecting");
                    let restarted = self.connect().and_then(|()| self.start_transfer());
                    match restarted {
                        Ok(()) => return Ok(false),
                        Err(retry_err) => {
                            warn!(attempt, error = %retry_err, "Reconnect attempt failed");
                            if self.state == SessionState::Connecting {
                                self.disconnect()?;
                            }
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Route one frame: decode, parse, aggregate, notify.
    ///
    /// Frames of the wrong length are reported as a protocol anomaly and
    /// dropped, as are unrecognized opcodes.
    fn route_frame(&mut self, bytes: &[u8]) {
        if self.config.emit_raw_frames {
            self.emit(MonitorEvent::RawFrame(bytes.to_vec()));
        }

        let raw = match RawFrame::try_from(bytes) {
            Ok(raw) => raw,
            Err(e) => {
                let err = SessionError::ProtocolAnomaly(e.to_string());
                warn!(len = bytes.len(), "Dropping malformed frame");
                self.report(&err);
                return;
            }
        };

        let decoded = raw.decode(&OBFUSCATION_KEY);
        trace!(?raw, ?decoded, clear = raw.is_clear(), "Frame received");

        match parse(&decoded) {
            ParsedFrame::Measurement(m) => {
                self.unrecognized_streak = 0;
                let outcome = self.reading.apply(m);
                self.emit(match m.kind {
                    MeasurementKind::Co2 => MonitorEvent::Co2(m),
                    MeasurementKind::Temperature => MonitorEvent::Temperature(m),
                    MeasurementKind::Humidity => MonitorEvent::Humidity(m),
                });
                if outcome.complete {
                    self.emit(MonitorEvent::Data(self.reading));
                }
            }
            ParsedFrame::Unrecognized { opcode } => {
                self.unrecognized_streak = self.unrecognized_streak.saturating_add(1);
                trace!(opcode = %format!("0x{:02X}", opcode), "Unrecognized opcode");
                let threshold = self.config.unrecognized_threshold;
                if threshold > 0 && self.unrecognized_streak == threshold {
                    self.report(&SessionError::ProtocolAnomaly(format!(
                        "{} consecutive frames with unrecognized opcodes (last 0x{:02X})",
                        threshold, opcode
                    )));
                }
            }
        }
    }

    /// Stop polling and release everything the session holds.
    ///
    /// Safe in any state: with nothing held it only reports completion.
    #[instrument(skip(self))]
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        self.guard(
            "disconnect",
            &[
                SessionState::Idle,
                SessionState::Connecting,
                SessionState::Streaming,
                SessionState::Closed,
            ],
        )?;

        if matches!(self.state, SessionState::Idle | SessionState::Closed) {
            debug!("Nothing to tear down");
        } else {
            self.goto_state(SessionState::Disconnecting);
            self.teardown();
        }

        self.goto_state(SessionState::Closed);
        self.emit(MonitorEvent::Disconnected);
        Ok(())
    }

    /// Best-effort release of held resources in reverse order of acquisition.
    fn teardown(&mut self) {
        let held = std::mem::take(&mut self.held);

        if held.polling {
            if let Err(e) = self.usb.stop_poll(self.config.disconnect_timeout()) {
                self.report_teardown("stop polling", e);
            }
        }
        if held.claimed {
            if let Err(e) = self.usb.release_interface() {
                self.report_teardown("release interface", e);
            }
        }
        // The kernel driver can only bind once the interface is free.
        if held.detached {
            if let Err(e) = self.usb.attach_kernel_driver() {
                self.report_teardown("reattach kernel driver", e);
            }
        }
        if held.opened {
            self.usb.close();
        }
    }

    fn report_teardown(&self, step: &str, e: TransportError) {
        warn!(step, error = %e, "Teardown step failed, continuing");
        self.report(&SessionError::Transport(e));
    }
}

impl<U: UsbSession, O: MonitorObserver> Drop for DeviceSession<U, O> {
    fn drop(&mut self) {
        if matches!(
            self.state,
            SessionState::Connecting | SessionState::Streaming
        ) {
            let _ = self.disconnect();
        }
    }
}
