use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// logical sensor placement feeding the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Indoor,
    Outdoor,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Indoor, Role::Outdoor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Indoor => "indoor",
            Role::Outdoor => "outdoor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// physical quantity carried by a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    /// degrees celsius
    Temperature,
    /// relative humidity, percent
    Humidity,
    /// hectopascal
    Pressure,
}

impl Quantity {
    pub const ALL: [Quantity; 3] = [Quantity::Temperature, Quantity::Humidity, Quantity::Pressure];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quantity::Temperature => "temperature",
            Quantity::Humidity => "humidity",
            Quantity::Pressure => "pressure",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Temperature => "°C",
            Quantity::Humidity => "%",
            Quantity::Pressure => "hPa",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// a single calibrated value, immutable once decoded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub role: Role,
    pub quantity: Quantity,
    pub value: f64,
    pub captured_at: SystemTime,
}

impl Reading {
    pub fn new(role: Role, quantity: Quantity, value: f64, captured_at: SystemTime) -> Self {
        Self { role, quantity, value, captured_at }
    }
}

/// decoded output of one sensor transaction
///
/// each sensor fills only the quantities it measures. the sht30 yields
/// temperature + humidity, the qmp6988 pressure, the dht22 temperature + humidity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurement {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
}

impl Measurement {
    pub fn climate(temperature: f64, humidity: f64) -> Self {
        Self { temperature: Some(temperature), humidity: Some(humidity), pressure: None }
    }

    pub fn pressure(hpa: f64) -> Self {
        Self { pressure: Some(hpa), ..Self::default() }
    }

    pub fn get(&self, quantity: Quantity) -> Option<f64> {
        match quantity {
            Quantity::Temperature => self.temperature,
            Quantity::Humidity => self.humidity,
            Quantity::Pressure => self.pressure,
        }
    }

    fn slot(&mut self, quantity: Quantity) -> &mut Option<f64> {
        match quantity {
            Quantity::Temperature => &mut self.temperature,
            Quantity::Humidity => &mut self.humidity,
            Quantity::Pressure => &mut self.pressure,
        }
    }

    /// component-wise mean; a quantity missing from every sample stays None
    pub fn mean(samples: &[Measurement]) -> Measurement {
        let mut out = Measurement::default();
        for q in Quantity::ALL {
            let values: Vec<f64> = samples.iter().filter_map(|m| m.get(q)).collect();
            if !values.is_empty() {
                *out.slot(q) = Some(values.iter().sum::<f64>() / values.len() as f64);
            }
        }
        out
    }

    pub fn readings(&self, role: Role, captured_at: SystemTime) -> Vec<Reading> {
        Quantity::ALL
            .iter()
            .filter_map(|&q| self.get(q).map(|v| Reading::new(role, q, v, captured_at)))
            .collect()
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for q in Quantity::ALL {
            if let Some(v) = self.get(q) {
                if !first {
                    f.write_str(", ")?;
                }
                write!(f, "{:.1}{}", v, q.unit())?;
                first = false;
            }
        }
        if first {
            f.write_str("no data")?;
        }
        Ok(())
    }
}

/// unix seconds
pub fn unix_timestamp(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_skips_missing_quantities() {
        let a = Measurement::climate(20.0, 40.0);
        let b = Measurement { temperature: Some(22.0), humidity: None, pressure: None };
        let m = Measurement::mean(&[a, b]);
        assert_eq!(m.temperature, Some(21.0));
        assert_eq!(m.humidity, Some(40.0));
        assert_eq!(m.pressure, None);
    }

    #[test]
    fn test_readings_and_display() {
        let m = Measurement { pressure: Some(1012.3), ..Measurement::climate(21.5, 48.0) };
        let now = SystemTime::now();
        let readings = m.readings(Role::Indoor, now);
        assert_eq!(readings.len(), 3);
        assert!(readings.iter().all(|r| r.role == Role::Indoor && r.captured_at == now));
        assert_eq!(readings[2].quantity, Quantity::Pressure);
        assert_eq!(m.to_string(), "21.5°C, 48.0%, 1012.3hPa");
    }
}
