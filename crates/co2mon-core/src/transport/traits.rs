//! USB session abstraction.
//!
//! Defines the `UsbSession` trait consumed by the device session,
//! allowing different implementations (nusb, mock, etc.).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("No handle is open")]
    NotOpen,

    #[error("Kernel driver operation failed on interface {interface}: {message}")]
    KernelDriver { interface: u8, message: String },

    #[error("Control transfer failed: {0}")]
    ControlFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Failed to release interface {interface}: {message}")]
    ReleaseInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Setup packet fields of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Abstract USB session with a single device.
///
/// Methods mirror the primitive steps of the monitor's lifecycle. The
/// device session calls them in order and owns the implementation
/// exclusively between `open` and `close`.
pub trait UsbSession: Send {
    /// Find and open the device with the given IDs.
    fn open(&mut self, vid: u16, pid: u16) -> Result<(), TransportError>;

    /// Whether the opened device exposes an interface to claim.
    fn has_interface(&self) -> bool;

    /// Whether this platform lets a kernel driver own the interface.
    fn supports_kernel_driver(&self) -> bool {
        false
    }

    /// Detach an active kernel driver. Returns `false` if none was bound.
    fn detach_kernel_driver(&mut self) -> Result<bool, TransportError> {
        Ok(false)
    }

    /// Give the interface back to the kernel driver.
    fn attach_kernel_driver(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Host-to-device control transfer with `data` as payload.
    fn control_transfer(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    fn claim_interface(&mut self) -> Result<(), TransportError>;

    fn release_interface(&mut self) -> Result<(), TransportError>;

    /// Resolve the streaming (IN) endpoint, returning its address.
    fn resolve_endpoint(&mut self) -> Result<u8, TransportError>;

    /// One synchronous IN transfer of `len` bytes.
    fn transfer(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Keep `depth` transfers of `frame_size` bytes in flight.
    fn start_poll(&mut self, frame_size: usize, depth: usize) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next polled frame. `Ok(None)` means
    /// nothing arrived in time.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    /// Cancel polling and wait for in-flight transfers, bounded by `timeout`.
    fn stop_poll(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Close the device handle.
    fn close(&mut self);

    /// IDs of the opened device.
    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;
}
