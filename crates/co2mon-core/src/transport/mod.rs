//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockCall, MockStep, MockUsbSession};
pub use nusb::NusbSession;
pub use traits::{ControlSetup, TransportError, UsbSession};
