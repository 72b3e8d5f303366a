//! Live aggregate of the most recent measurement of each kind.

use std::fmt;

use crate::protocol::{Measurement, MeasurementKind};

/// Most recent CO2, temperature and humidity measurements.
///
/// The aggregate is never cleared: once complete it stays complete, and later
/// frames update fields in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reading {
    pub co2: Option<Measurement>,
    pub temperature: Option<Measurement>,
    pub humidity: Option<Measurement>,
}

/// Result of applying one measurement to a [`Reading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub updated: bool,
    pub complete: bool,
}

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `measurement` in its slot (most recent wins).
    pub fn apply(&mut self, measurement: Measurement) -> ApplyOutcome {
        let slot = match measurement.kind {
            MeasurementKind::Co2 => &mut self.co2,
            MeasurementKind::Temperature => &mut self.temperature,
            MeasurementKind::Humidity => &mut self.humidity,
        };
        *slot = Some(measurement);

        ApplyOutcome {
            updated: true,
            complete: self.is_complete(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.co2.is_some() && self.temperature.is_some() && self.humidity.is_some()
    }

    pub fn get(&self, kind: MeasurementKind) -> Option<Measurement> {
        match kind {
            MeasurementKind::Co2 => self.co2,
            MeasurementKind::Temperature => self.temperature,
            MeasurementKind::Humidity => self.humidity,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |m: Option<Measurement>| m.map_or_else(|| "-".to_string(), |m| m.to_string());
        write!(
            f,
            "co2={} temperature={} humidity={}",
            show(self.co2),
            show(self.temperature),
            show(self.humidity)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CO2: Measurement = Measurement::new(MeasurementKind::Co2, 1000);
    const TEMP: Measurement = Measurement::new(MeasurementKind::Temperature, 4800);
    const HUM: Measurement = Measurement::new(MeasurementKind::Humidity, 5500);

    #[test]
    fn test_complete_only_after_all_kinds() {
        let orders = [
            [CO2, TEMP, HUM],
            [HUM, CO2, TEMP],
            [TEMP, HUM, CO2],
        ];
        for order in orders {
            let mut reading = Reading::new();
            let a = reading.apply(order[0]);
            let b = reading.apply(order[1]);
            let c = reading.apply(order[2]);
            assert!(a.updated && b.updated && c.updated);
            assert!(!a.complete);
            assert!(!b.complete);
            assert!(c.complete);
        }
    }

    #[test]
    fn test_repeated_kind_does_not_complete() {
        let mut reading = Reading::new();
        reading.apply(CO2);
        reading.apply(CO2);
        let outcome = reading.apply(TEMP);
        assert!(!outcome.complete);
    }

    #[test]
    fn test_stays_complete_and_latest_wins() {
        let mut reading = Reading::new();
        reading.apply(CO2);
        reading.apply(TEMP);
        reading.apply(HUM);

        let newer = Measurement::new(MeasurementKind::Co2, 1200);
        let outcome = reading.apply(newer);
        assert!(outcome.complete);
        assert_eq!(reading.co2, Some(newer));
        assert_eq!(reading.get(MeasurementKind::Temperature), Some(TEMP));
    }

    #[test]
    fn test_display() {
        let mut reading = Reading::new();
        reading.apply(CO2);
        assert_eq!(reading.to_string(), "co2=1000 ppm temperature=- humidity=-");
    }
}
