//! Protocol module - wire format of the CO2 monitor.

pub mod constants;
pub mod frame;
pub mod measurement;

pub use constants::*;
pub use frame::{DecodedFrame, FrameError, RawFrame, decode, encode};
pub use measurement::{Measurement, MeasurementKind, ParsedFrame, parse};
