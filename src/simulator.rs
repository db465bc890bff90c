//! Synthetic device readings for demos and load tests.

use crate::model::Reading;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use rand::Rng;
use serde::Serialize;

const THERMOSTAT_RANGE: (f64, f64) = (18.0, 30.0);
const THERMOSTAT_STEP: f64 = 0.5;
const HEART_RATE_RANGE: (i32, i32) = (60, 180);
const HEART_RATE_STEP: i32 = 2;
const FUEL_FULL: f64 = 100.0;
const FUEL_REFUEL_BELOW: f64 = 10.0;
const FUEL_MAX_CONSUMPTION: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    Thermostat,
    HeartRate,
    FuelSensor,
}

impl DeviceKind {
    pub fn device_type(&self) -> &'static str {
        match self {
            DeviceKind::Thermostat => "THERMOSTAT",
            DeviceKind::HeartRate => "HEART_RATE",
            DeviceKind::FuelSensor => "FUEL_SENSOR",
        }
    }

    fn initial_value(&self) -> f64 {
        match self {
            DeviceKind::Thermostat => 22.0,
            DeviceKind::HeartRate => 70.0,
            DeviceKind::FuelSensor => 85.0,
        }
    }
}

/// Random-walk reading source for one device.
#[derive(Debug, Clone)]
pub struct DeviceSimulator {
    device_id: String,
    kind: DeviceKind,
    zone: String,
    current: f64,
}

impl DeviceSimulator {
    pub fn new(kind: DeviceKind, device_id: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            zone: zone.into(),
            current: kind.initial_value(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn next_value<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        self.current = match self.kind {
            DeviceKind::Thermostat => {
                let step = rng.gen_range(0.0..THERMOSTAT_STEP) * direction(rng);
                (self.current + step).clamp(THERMOSTAT_RANGE.0, THERMOSTAT_RANGE.1)
            }
            DeviceKind::HeartRate => {
                let step = rng.gen_range(0..=HEART_RATE_STEP) as f64 * direction(rng);
                (self.current + step).clamp(
                    f64::from(HEART_RATE_RANGE.0),
                    f64::from(HEART_RATE_RANGE.1),
                )
            }
            DeviceKind::FuelSensor => {
                let level = self.current - rng.gen_range(0.0..FUEL_MAX_CONSUMPTION);
                if level < FUEL_REFUEL_BELOW {
                    FUEL_FULL
                } else {
                    level.clamp(0.0, FUEL_FULL)
                }
            }
        };
        self.current
    }

    pub fn reading_at<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        timestamp: DateTime<Utc>,
    ) -> Reading {
        let value = self.next_value(rng);
        Reading::new(
            self.device_id.clone(),
            self.kind.device_type(),
            Some(self.zone.as_str()),
            value,
            timestamp,
        )
    }
}

fn direction<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    if rng.gen_bool(0.5) {
        1.0
    } else {
        -1.0
    }
}

/// Two thermostats, two heart-rate monitors and one fuel sensor.
pub fn standard_device_set() -> Vec<DeviceSimulator> {
    let mut devices = Vec::with_capacity(5);
    for (i, zone) in ["living-room", "bedroom"].into_iter().enumerate() {
        devices.push(DeviceSimulator::new(
            DeviceKind::Thermostat,
            format!("THERMO-{i}1"),
            zone,
        ));
    }
    for (i, zone) in ["gym", "home"].into_iter().enumerate() {
        devices.push(DeviceSimulator::new(
            DeviceKind::HeartRate,
            format!("HR-{i}1"),
            zone,
        ));
    }
    devices.push(DeviceSimulator::new(
        DeviceKind::FuelSensor,
        "FUEL-01",
        "garage",
    ));
    devices
}

/// Scales `base` by hour-of-day and day-of-year waves plus up to ±5% noise.
pub fn seasonal_variation<R: Rng + ?Sized>(
    rng: &mut R,
    base: f64,
    timestamp: DateTime<Utc>,
) -> f64 {
    let hourly = (f64::from(timestamp.hour()) * 15.0).to_radians().sin() * 0.1;
    let daily = (f64::from(timestamp.ordinal()) * 0.986).to_radians().sin() * 0.05;
    let noise = (rng.gen::<f64>() - 0.5) * 0.1;
    base * (1.0 + hourly + daily + noise)
}

/// Backfill readings for every device in `devices`, one per device per
/// `interval`, covering `[end - days, end)`.
pub fn historical_readings<R: Rng + ?Sized>(
    rng: &mut R,
    devices: &mut [DeviceSimulator],
    end: DateTime<Utc>,
    days: u32,
    interval: ChronoDuration,
) -> Vec<Reading> {
    if interval <= ChronoDuration::zero() || devices.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut current = end - ChronoDuration::days(i64::from(days));
    while current < end {
        for device in devices.iter_mut() {
            let mut reading = device.reading_at(rng, current);
            reading.value = seasonal_variation(rng, reading.value, current);
            out.push(reading);
        }
        current += interval;
    }
    tracing::info!(
        readings = out.len(),
        devices = devices.len(),
        days,
        "generated historical readings"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn standard_set_matches_device_layout() {
        let devices = standard_device_set();
        let ids: Vec<&str> = devices.iter().map(DeviceSimulator::device_id).collect();
        assert_eq!(ids, vec!["THERMO-01", "THERMO-11", "HR-01", "HR-11", "FUEL-01"]);
        assert_eq!(devices[1].zone(), "bedroom");
        assert_eq!(devices[4].kind(), DeviceKind::FuelSensor);
    }

    #[test]
    fn walks_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut thermo = DeviceSimulator::new(DeviceKind::Thermostat, "T", "z");
        let mut heart = DeviceSimulator::new(DeviceKind::HeartRate, "H", "z");
        for _ in 0..5_000 {
            let t = thermo.next_value(&mut rng);
            assert!((18.0..=30.0).contains(&t));
            let h = heart.next_value(&mut rng);
            assert!((60.0..=180.0).contains(&h));
            assert_eq!(h.fract(), 0.0);
        }
    }

    #[test]
    fn fuel_refuels_when_low() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut fuel = DeviceSimulator::new(DeviceKind::FuelSensor, "F", "garage");
        fuel.current = 10.0;
        let mut refueled = false;
        for _ in 0..10 {
            if fuel.next_value(&mut rng) == 100.0 {
                refueled = true;
                break;
            }
        }
        assert!(refueled);
    }

    #[test]
    fn historical_readings_cover_window() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut devices = standard_device_set();
        let end = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let readings =
            historical_readings(&mut rng, &mut devices, end, 1, ChronoDuration::hours(1));
        assert_eq!(readings.len(), 24 * 5);
        assert!(readings.iter().all(|r| r.timestamp < end));
        assert_eq!(readings[0].timestamp, end - ChronoDuration::days(1));
        assert!(readings.iter().all(|r| r.value.is_finite()));
    }
}
