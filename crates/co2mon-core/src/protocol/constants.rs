//! Protocol constants for the USB CO2 monitor.
//!
//! The device enumerates as a HID-class gadget and streams 8-byte reports
//! once it has been armed with a vendor control transfer.

// ============================================================================
// Device Identification
// ============================================================================

/// Default vendor ID (Holtek Semiconductor).
pub const DEFAULT_VENDOR_ID: u16 = 0x04D9;

/// Default product ID (USB-zyTemp CO2 monitor).
pub const DEFAULT_PRODUCT_ID: u16 = 0xA052;

/// Interface used for the handshake and streaming.
pub const MONITOR_INTERFACE: u8 = 0;

// ============================================================================
// Handshake (Host -> Device)
// ============================================================================

/// Key used both as the arming payload and as the XOR key for decoding.
pub const OBFUSCATION_KEY: [u8; 8] = [0xC4, 0xC6, 0xC0, 0x92, 0x40, 0x23, 0xDC, 0x96];

/// bmRequestType: host-to-device, class, interface.
pub const ARM_REQUEST_TYPE: u8 = 0x21;

/// bRequest: HID SET_REPORT.
pub const ARM_REQUEST: u8 = 0x09;

/// wValue: feature report, report ID 0.
pub const ARM_VALUE: u16 = 0x0300;

/// wIndex.
pub const ARM_INDEX: u16 = 0x0000;

// ============================================================================
// Streaming
// ============================================================================

/// Size of one telemetry frame.
pub const FRAME_SIZE: usize = 8;

/// Number of transfers kept in flight while polling.
pub const POLL_DEPTH: usize = 64;

/// Byte 4 of a raw frame carries this value when the frame is already in clear.
pub const CLEAR_FRAME_SENTINEL: u8 = 0x0D;

/// Index of the sentinel byte in a raw frame.
pub const CLEAR_FRAME_SENTINEL_INDEX: usize = 4;

// ============================================================================
// Obfuscation Tables
// ============================================================================

/// Input position `i` lands at output position `SHUFFLE[i]`.
pub const SHUFFLE: [usize; 8] = [2, 4, 0, 7, 1, 6, 5, 3];

/// Constant subtracted (after nibble swap) in the last decode step ("Htemp99e").
pub const CSTATE: [u8; 8] = [0x48, 0x74, 0x65, 0x6D, 0x70, 0x39, 0x39, 0x65];

// ============================================================================
// Opcodes (Device -> Host, decoded byte 0)
// ============================================================================

/// CO2 concentration in ppm.
pub const OP_CO2: u8 = 0x50;

/// Temperature in 1/16 Kelvin.
pub const OP_TEMPERATURE: u8 = 0x42;

/// Relative humidity in 1/100 %.
pub const OP_HUMIDITY: u8 = 0x41;
