//! nusb-based USB session implementation.

use std::time::{Duration, Instant};

use nusb::transfer::{ControlOut, ControlType, In, Interrupt, Recipient};
use nusb::{Device, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{ControlSetup, TransportError, UsbSession};
use crate::protocol::constants::MONITOR_INTERFACE;

/// nusb-based USB session.
#[derive(Default)]
pub struct NusbSession {
    device: Option<Device>,
    interface: Option<Interface>,
    endpoint: Option<nusb::Endpoint<Interrupt, In>>,
    frame_size: usize,
    vid: u16,
    pid: u16,
}

impl NusbSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn device(&self) -> Result<&Device, TransportError> {
        self.device.as_ref().ok_or(TransportError::NotOpen)
    }

    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::NotOpen)
    }

    fn submit_frame(&mut self) -> Result<(), TransportError> {
        let ep = self.endpoint.as_mut().ok_or(TransportError::NotOpen)?;
        let buf = ep.allocate(self.frame_size);
        ep.submit(buf);
        Ok(())
    }
}

/// Split a raw bmRequestType into nusb's type and recipient.
fn split_request_type(request_type: u8) -> Result<(ControlType, Recipient), TransportError> {
    let control_type = match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        2 => ControlType::Vendor,
        _ => {
            return Err(TransportError::ControlFailed(format!(
                "reserved request type 0x{:02X}",
                request_type
            )));
        }
    };
    let recipient = match request_type & 0x1F {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    };
    Ok((control_type, recipient))
}

fn elapsed_timeout(timeout: Duration) -> TransportError {
    TransportError::Timeout {
        timeout_ms: timeout.as_millis() as u64,
    }
}

/// Endpoint with cancelled transfers that must be reaped before it is reused.
trait Reap {
    fn in_flight(&self) -> usize;
    fn reap(&mut self, timeout: Duration) -> bool;
}

impl Reap for nusb::Endpoint<Interrupt, In> {
    fn in_flight(&self) -> usize {
        self.pending()
    }

    fn reap(&mut self, timeout: Duration) -> bool {
        self.wait_next_complete(timeout).is_some()
    }
}

/// Collect completions after `cancel_all` so none is left queued for the
/// next submit.
fn drain_cancelled<E: Reap>(ep: &mut E, timeout: Duration) -> Result<(), TransportError> {
    let deadline = Instant::now() + timeout;
    while ep.in_flight() > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || !ep.reap(remaining) {
            warn!(pending = ep.in_flight(), "Cancelled transfers still in flight");
            return Err(elapsed_timeout(timeout));
        }
    }
    Ok(())
}

impl UsbSession for NusbSession {
    #[instrument(level = "info", skip(self), fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    fn open(&mut self, vid: u16, pid: u16) -> Result<(), TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        self.device = Some(device);
        self.vid = vid;
        self.pid = pid;
        Ok(())
    }

    fn has_interface(&self) -> bool {
        let Some(device) = &self.device else {
            return false;
        };
        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == MONITOR_INTERFACE {
                    return true;
                }
            }
        }
        false
    }

    fn supports_kernel_driver(&self) -> bool {
        cfg!(any(target_os = "linux", target_os = "android"))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn detach_kernel_driver(&mut self) -> Result<bool, TransportError> {
        match self.device()?.detach_kernel_driver(MONITOR_INTERFACE) {
            Ok(()) => {
                debug!(interface = MONITOR_INTERFACE, "Kernel driver detached");
                Ok(true)
            }
            Err(e) => {
                // usbhid not bound (or already detached)
                debug!(error = %e, "No kernel driver detached");
                Ok(false)
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn attach_kernel_driver(&mut self) -> Result<(), TransportError> {
        self.device()?
            .attach_kernel_driver(MONITOR_INTERFACE)
            .map_err(|e| TransportError::KernelDriver {
                interface: MONITOR_INTERFACE,
                message: e.to_string(),
            })
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn control_transfer(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let (control_type, recipient) = split_request_type(setup.request_type)?;
        self.device()?
            .control_out(
                ControlOut {
                    control_type,
                    recipient,
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed(e.to_string()))?;

        debug!(bytes_written = data.len(), "Control transfer complete");
        Ok(())
    }

    fn claim_interface(&mut self) -> Result<(), TransportError> {
        let interface = self
            .device()?
            .claim_interface(MONITOR_INTERFACE)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: MONITOR_INTERFACE,
                message: e.to_string(),
            })?;
        self.interface = Some(interface);
        Ok(())
    }

    fn release_interface(&mut self) -> Result<(), TransportError> {
        // nusb releases the interface when the last handle is dropped.
        self.endpoint = None;
        self.interface = None;
        Ok(())
    }

    fn resolve_endpoint(&mut self) -> Result<u8, TransportError> {
        // First endpoint of the monitor interface
        let mut first = None;
        for config in self.device()?.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != MONITOR_INTERFACE {
                    continue;
                }
                for alt in iface.alt_settings() {
                    if first.is_none() {
                        first = alt.endpoints().next().map(|ep| (ep.address(), ep.direction()));
                    }
                }
            }
        }

        let addr = match first {
            Some((addr, nusb::transfer::Direction::In)) => addr,
            _ => {
                return Err(TransportError::EndpointNotFound {
                    ep_type: "Interrupt".into(),
                    direction: "In".into(),
                });
            }
        };

        // Make sure the interface can actually open it.
        let endpoint = self
            .interface()?
            .endpoint::<Interrupt, In>(addr)
            .map_err(|e| TransportError::TransferFailed(e.to_string()))?;

        info!(in_ep = %format!("0x{:02X}", addr), "Endpoint resolved");
        self.endpoint = Some(endpoint);
        Ok(addr)
    }

    #[instrument(skip(self))]
    fn transfer(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let ep = self.endpoint.as_mut().ok_or(TransportError::NotOpen)?;
        let buf = ep.allocate(len);
        ep.submit(buf);

        let Some(completion) = ep.wait_next_complete(timeout) else {
            ep.cancel_all();
            if let Err(e) = drain_cancelled(ep, timeout) {
                debug!(error = %e, "Priming transfer not reaped");
            }
            return Err(elapsed_timeout(timeout));
        };
        completion
            .status
            .map_err(|e| TransportError::TransferFailed(e.to_string()))?;

        let n = completion.actual_len.min(completion.buffer.len());
        debug!(bytes_read = n, "Transfer complete");
        Ok(completion.buffer[..n].to_vec())
    }

    fn start_poll(&mut self, frame_size: usize, depth: usize) -> Result<(), TransportError> {
        self.frame_size = frame_size;
        for _ in 0..depth {
            self.submit_frame()?;
        }
        debug!(frame_size, depth, "Polling started");
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let ep = self.endpoint.as_mut().ok_or(TransportError::NotOpen)?;
        let Some(completion) = ep.wait_next_complete(timeout) else {
            return Ok(None);
        };

        match completion.status {
            Ok(()) => {
                let n = completion.actual_len.min(completion.buffer.len());
                let frame = completion.buffer[..n].to_vec();
                // Keep the queue depth constant.
                self.submit_frame()?;
                Ok(Some(frame))
            }
            Err(nusb::transfer::TransferError::Disconnected) => Err(TransportError::Disconnected),
            Err(e) => Err(TransportError::TransferFailed(e.to_string())),
        }
    }

    fn stop_poll(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let Some(ep) = self.endpoint.as_mut() else {
            return Ok(());
        };
        ep.cancel_all();
        drain_cancelled(ep, timeout)?;
        debug!("Polling stopped");
        Ok(())
    }

    fn close(&mut self) {
        self.endpoint = None;
        self.interface = None;
        self.device = None;
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::ARM_REQUEST_TYPE;

    #[test]
    fn test_arm_request_type_split() {
        let (control_type, recipient) = split_request_type(ARM_REQUEST_TYPE).unwrap();
        assert!(matches!(control_type, ControlType::Class));
        assert!(matches!(recipient, Recipient::Interface));
    }

    #[test]
    fn test_reserved_request_type_rejected() {
        assert!(split_request_type(0x61).is_err());
    }

    /// Endpoint whose transfers complete only once `ready` allows it.
    struct FakeEndpoint {
        pending: usize,
        ready: usize,
    }

    impl Reap for FakeEndpoint {
        fn in_flight(&self) -> usize {
            self.pending
        }

        fn reap(&mut self, _timeout: Duration) -> bool {
            if self.ready == 0 {
                return false;
            }
            self.ready -= 1;
            self.pending -= 1;
            true
        }
    }

    #[test]
    fn test_drain_collects_cancelled_transfers() {
        let mut ep = FakeEndpoint {
            pending: 3,
            ready: 3,
        };
        drain_cancelled(&mut ep, Duration::from_millis(50)).unwrap();
        assert_eq!(ep.pending, 0);

        // Nothing queued: returns at once.
        drain_cancelled(&mut ep, Duration::ZERO).unwrap();
    }

    #[test]
    fn test_drain_times_out_on_stuck_transfer() {
        let mut ep = FakeEndpoint {
            pending: 2,
            ready: 1,
        };
        assert_eq!(
            drain_cancelled(&mut ep, Duration::from_millis(20)),
            Err(TransportError::Timeout { timeout_ms: 20 })
        );
        assert_eq!(ep.pending, 1);
    }

    #[test]
    fn test_unopened_session() {
        let mut session = NusbSession::new();
        assert!(!session.has_interface());
        assert!(matches!(
            session.claim_interface(),
            Err(TransportError::NotOpen)
        ));
        assert!(session.stop_poll(Duration::from_millis(1)).is_ok());
    }
}
