//! Interpretation of decoded frames as typed measurements.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use super::constants::{OP_CO2, OP_HUMIDITY, OP_TEMPERATURE};
use super::frame::DecodedFrame;

/// Physical quantity reported by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementKind {
    Co2,
    Temperature,
    Humidity,
}

impl MeasurementKind {
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            OP_CO2 => Some(Self::Co2),
            OP_TEMPERATURE => Some(Self::Temperature),
            OP_HUMIDITY => Some(Self::Humidity),
            _ => None,
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Self::Co2 => OP_CO2,
            Self::Temperature => OP_TEMPERATURE,
            Self::Humidity => OP_HUMIDITY,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Co2 => "ppm",
            Self::Temperature => "°C",
            Self::Humidity => "% rh",
        }
    }

    /// CO2 is reported as an integer; the other quantities are scaled floats.
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Co2)
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Co2 => write!(f, "co2"),
            Self::Temperature => write!(f, "temperature"),
            Self::Humidity => write!(f, "humidity"),
        }
    }
}

/// A single measurement: kind plus the raw 16-bit magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub kind: MeasurementKind,
    pub raw: u16,
}

impl Measurement {
    pub const fn new(kind: MeasurementKind, raw: u16) -> Self {
        Self { kind, raw }
    }

    /// Scaled value in the kind's unit, rounded to 2 decimals for floats.
    pub fn value(&self) -> f64 {
        let raw = f64::from(self.raw);
        match self.kind {
            MeasurementKind::Co2 => raw,
            MeasurementKind::Temperature => round2(raw / 16.0 - 273.15),
            MeasurementKind::Humidity => round2(raw / 100.0),
        }
    }

    pub fn unit(&self) -> &'static str {
        self.kind.unit()
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_integer() {
            write!(f, "{} {}", self.raw, self.unit())
        } else {
            write!(f, "{:.2} {}", self.value(), self.unit())
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Outcome of parsing one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedFrame {
    Measurement(Measurement),
    /// Opcode this pipeline does not know; dropped by the caller.
    Unrecognized { opcode: u8 },
}

/// Parse a decoded frame into a measurement.
pub fn parse(decoded: &DecodedFrame) -> ParsedFrame {
    let bytes = decoded.as_bytes();
    let opcode = bytes[0];
    let magnitude = BigEndian::read_u16(&bytes[1..3]);

    match MeasurementKind::from_opcode(opcode) {
        Some(kind) => ParsedFrame::Measurement(Measurement::new(kind, magnitude)),
        None => ParsedFrame::Unrecognized { opcode },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(opcode: u8, magnitude: u16) -> DecodedFrame {
        let [hi, lo] = magnitude.to_be_bytes();
        DecodedFrame::new([opcode, hi, lo, 0, 0x0D, 0, 0, 0])
    }

    fn measurement(parsed: ParsedFrame) -> Measurement {
        match parsed {
            ParsedFrame::Measurement(m) => m,
            other => panic!("expected measurement, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_co2() {
        let m = measurement(parse(&frame(0x50, 1000)));
        assert_eq!(m.kind, MeasurementKind::Co2);
        assert_eq!(m.raw, 1000);
        assert_eq!(m.value(), 1000.0);
        assert_eq!(m.to_string(), "1000 ppm");
    }

    #[test]
    fn test_parse_temperature() {
        let m = measurement(parse(&frame(0x42, 4800)));
        assert_eq!(m.kind, MeasurementKind::Temperature);
        assert_eq!(m.value(), 26.85);
        assert_eq!(m.to_string(), "26.85 °C");
    }

    #[test]
    fn test_parse_humidity() {
        let m = measurement(parse(&frame(0x41, 5500)));
        assert_eq!(m.kind, MeasurementKind::Humidity);
        assert_eq!(m.value(), 55.0);
        assert_eq!(m.to_string(), "55.00 % rh");
    }

    #[test]
    fn test_magnitude_is_big_endian() {
        let m = measurement(parse(&frame(0x50, 0x0102)));
        assert_eq!(m.raw, 258);
    }

    #[test]
    fn test_unrecognized_opcode() {
        assert_eq!(
            parse(&frame(0x6D, 0x1234)),
            ParsedFrame::Unrecognized { opcode: 0x6D }
        );
    }

    #[test]
    fn test_opcode_mapping_roundtrip() {
        for kind in [
            MeasurementKind::Co2,
            MeasurementKind::Temperature,
            MeasurementKind::Humidity,
        ] {
            assert_eq!(MeasurementKind::from_opcode(kind.opcode()), Some(kind));
        }
    }
}
