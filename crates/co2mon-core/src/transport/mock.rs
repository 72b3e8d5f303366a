//! Mock USB session for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{ControlSetup, TransportError, UsbSession};
use crate::protocol::constants::{DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID};

/// Lifecycle step of the mock, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    Open,
    DetachKernelDriver,
    ControlTransfer,
    ClaimInterface,
    ResolveEndpoint,
    Transfer,
    StartPoll,
    StopPoll,
    AttachKernelDriver,
    ReleaseInterface,
}

/// A call received by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open { vid: u16, pid: u16 },
    DetachKernelDriver,
    ControlTransfer { setup: ControlSetup, data: Vec<u8> },
    ClaimInterface,
    ResolveEndpoint,
    Transfer { len: usize },
    StartPoll { frame_size: usize, depth: usize },
    StopPoll,
    AttachKernelDriver,
    ReleaseInterface,
    Close,
}

struct MockState {
    /// IDs of the simulated device; `None` when unplugged.
    device: Option<(u16, u16)>,
    has_interface: bool,
    /// `None` on platforms without kernel drivers, else whether one is bound.
    kernel_driver: Option<bool>,
    open: bool,
    claimed: bool,
    polling: bool,
    failures: HashMap<MockStep, TransportError>,
    /// Queued results for `next_frame`.
    frames: VecDeque<Result<Vec<u8>, TransportError>>,
    calls: Vec<MockCall>,
}

/// Scriptable mock session. Clones share state, so a test can keep a
/// handle after giving the mock to a session.
#[derive(Clone)]
pub struct MockUsbSession {
    state: Arc<Mutex<MockState>>,
}

impl MockUsbSession {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                device: Some((DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID)),
                has_interface: true,
                kernel_driver: None,
                open: false,
                claimed: false,
                polling: false,
                failures: HashMap::new(),
                frames: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Simulate a device with other IDs.
    pub fn set_ids(&self, vid: u16, pid: u16) {
        self.lock().device = Some((vid, pid));
    }

    /// Simulate no device plugged in.
    pub fn unplug(&self) {
        self.lock().device = None;
    }

    pub fn set_has_interface(&self, present: bool) {
        self.lock().has_interface = present;
    }

    /// Simulate a kernel-driver-managed platform.
    pub fn with_kernel_driver(self, active: bool) -> Self {
        self.lock().kernel_driver = Some(active);
        self
    }

    /// Make `step` fail with `error` until cleared.
    pub fn fail_on(&self, step: MockStep, error: TransportError) {
        self.lock().failures.insert(step, error);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Queue a frame for `next_frame`.
    pub fn queue_frame(&self, frame: &[u8]) {
        self.lock().frames.push_back(Ok(frame.to_vec()));
    }

    /// Queue an endpoint error for `next_frame`.
    pub fn queue_error(&self, error: TransportError) {
        self.lock().frames.push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count(&self, call: &MockCall) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn is_claimed(&self) -> bool {
        self.lock().claimed
    }

    pub fn is_polling(&self) -> bool {
        self.lock().polling
    }

    /// Whether the simulated kernel driver is bound.
    pub fn kernel_driver_active(&self) -> Option<bool> {
        self.lock().kernel_driver
    }

    /// Record `call` and return the injected failure for `step`, if any.
    fn record(
        &self,
        call: MockCall,
        step: MockStep,
    ) -> Result<MutexGuard<'_, MockState>, TransportError> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(err) = state.failures.get(&step).cloned() {
            return Err(err);
        }
        Ok(state)
    }
}

impl Default for MockUsbSession {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbSession for MockUsbSession {
    fn open(&mut self, vid: u16, pid: u16) -> Result<(), TransportError> {
        let mut state = self.record(MockCall::Open { vid, pid }, MockStep::Open)?;
        if state.device != Some((vid, pid)) {
            return Err(TransportError::DeviceNotFound { vid, pid });
        }
        state.open = true;
        Ok(())
    }

    fn has_interface(&self) -> bool {
        let state = self.lock();
        state.open && state.has_interface
    }

    fn supports_kernel_driver(&self) -> bool {
        self.lock().kernel_driver.is_some()
    }

    fn detach_kernel_driver(&mut self) -> Result<bool, TransportError> {
        let mut state = self.record(
            MockCall::DetachKernelDriver,
            MockStep::DetachKernelDriver,
        )?;
        match state.kernel_driver {
            Some(true) => {
                state.kernel_driver = Some(false);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn attach_kernel_driver(&mut self) -> Result<(), TransportError> {
        let mut state = self.record(
            MockCall::AttachKernelDriver,
            MockStep::AttachKernelDriver,
        )?;
        if state.kernel_driver.is_some() {
            state.kernel_driver = Some(true);
        }
        Ok(())
    }

    fn control_transfer(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let state = self.record(
            MockCall::ControlTransfer {
                setup,
                data: data.to_vec(),
            },
            MockStep::ControlTransfer,
        )?;
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        Ok(())
    }

    fn claim_interface(&mut self) -> Result<(), TransportError> {
        let mut state = self.record(MockCall::ClaimInterface, MockStep::ClaimInterface)?;
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        state.claimed = true;
        Ok(())
    }

    fn release_interface(&mut self) -> Result<(), TransportError> {
        let mut state =
            self.record(MockCall::ReleaseInterface, MockStep::ReleaseInterface)?;
        state.claimed = false;
        Ok(())
    }

    fn resolve_endpoint(&mut self) -> Result<u8, TransportError> {
        let state = self.record(MockCall::ResolveEndpoint, MockStep::ResolveEndpoint)?;
        if !state.claimed {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Interrupt".into(),
                direction: "In".into(),
            });
        }
        Ok(0x81)
    }

    fn transfer(&mut self, len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let state = self.record(MockCall::Transfer { len }, MockStep::Transfer)?;
        if !state.claimed {
            return Err(TransportError::NotOpen);
        }
        Ok(vec![0; len])
    }

    fn start_poll(&mut self, frame_size: usize, depth: usize) -> Result<(), TransportError> {
        let mut state = self.record(
            MockCall::StartPoll { frame_size, depth },
            MockStep::StartPoll,
        )?;
        state.polling = true;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let mut state = self.lock();
        if !state.polling {
            return Err(TransportError::NotOpen);
        }
        let next = state.frames.pop_front();
        match next {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(err)) => Err(err),
            None => {
                drop(state);
                // Behave like a quiet device without stalling the test.
                std::thread::sleep(timeout.min(Duration::from_millis(1)));
                Ok(None)
            }
        }
    }

    fn stop_poll(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.record(MockCall::StopPoll, MockStep::StopPoll)?;
        state.polling = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.lock();
        state.calls.push(MockCall::Close);
        state.open = false;
        state.claimed = false;
        state.polling = false;
    }

    fn vendor_id(&self) -> u16 {
        self.lock().device.map_or(0, |(vid, _)| vid)
    }

    fn product_id(&self) -> u16 {
        self.lock().device.map_or(0, |(_, pid)| pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_open_requires_matching_ids() {
        let mut mock = MockUsbSession::new();
        assert!(mock.open(0x1234, 0x5678).is_err());
        assert!(!mock.is_open());

        mock.open(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID).unwrap();
        assert!(mock.is_open());
        assert!(mock.has_interface());
    }

    #[test]
    fn test_mock_frame_queue() {
        let mut mock = MockUsbSession::new();
        let timeout = Duration::from_millis(1);
        assert!(mock.next_frame(timeout).is_err());

        mock.start_poll(8, 64).unwrap();
        mock.queue_frame(&[1, 2, 3, 4, 5, 6, 7, 8]);
        mock.queue_error(TransportError::Disconnected);

        assert_eq!(
            mock.next_frame(timeout).unwrap(),
            Some(vec![1, 2, 3, 4, 5, 6, 7, 8])
        );
        assert_eq!(mock.next_frame(timeout), Err(TransportError::Disconnected));
        assert_eq!(mock.next_frame(timeout).unwrap(), None);
    }

    #[test]
    fn test_mock_failure_injection_is_logged() {
        let mut mock = MockUsbSession::new();
        mock.fail_on(MockStep::Open, TransportError::OpenFailed("busy".into()));
        assert!(mock.open(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID).is_err());
        assert_eq!(
            mock.calls(),
            vec![MockCall::Open {
                vid: DEFAULT_VENDOR_ID,
                pid: DEFAULT_PRODUCT_ID
            }]
        );

        mock.clear_failures();
        assert!(mock.open(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID).is_ok());
    }

    #[test]
    fn test_mock_kernel_driver() {
        let mut mock = MockUsbSession::new().with_kernel_driver(true);
        assert!(mock.supports_kernel_driver());
        assert!(mock.detach_kernel_driver().unwrap());
        assert!(!mock.detach_kernel_driver().unwrap());
        mock.attach_kernel_driver().unwrap();
        assert_eq!(mock.kernel_driver_active(), Some(true));
    }
}
