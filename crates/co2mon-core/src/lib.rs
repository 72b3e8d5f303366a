//! co2mon-core: session and telemetry decoding for USB CO2 monitors.
//!
//! Supports the common "USB-zyTemp" air-quality monitors (VID 04D9, PID A052)
//! that report CO2, temperature and relative humidity through obfuscated
//! 8-byte HID reports.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, frame de-obfuscation, measurement parsing
//! - **Reading**: Aggregation of the latest measurement of each kind
//! - **Transport**: USB session abstraction (nusb, mock)
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Lifecycle state machine and frame pipeline
//!
//! # Example
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use co2mon_core::session::{DeviceSession, SessionConfig};
//! use co2mon_core::transport::NusbSession;
//!
//! let mut session = DeviceSession::new(NusbSession::new(), SessionConfig::default());
//! session.connect().expect("connect failed");
//! session.start_transfer().expect("start failed");
//!
//! let shutdown = AtomicBool::new(false);
//! session.run(&shutdown).expect("stream failed");
//! ```

pub mod events;
pub mod protocol;
pub mod reading;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use events::{
    ChannelObserver, ErrorKind, MonitorEvent, MonitorObserver, NullObserver, TracingObserver,
};
pub use protocol::{Measurement, MeasurementKind, ParsedFrame, RawFrame};
pub use reading::{ApplyOutcome, Reading};
pub use session::{
    DeviceIdentity, DeviceSession, EndpointErrorPolicy, SessionConfig, SessionError, SessionState,
};
pub use transport::{MockUsbSession, NusbSession, TransportError, UsbSession};
