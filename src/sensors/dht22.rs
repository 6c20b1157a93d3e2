//! Aosong DHT22 / AM2302 on the single-wire GPIO line (outdoor).
//!
//! A frame is 40 bits: humidity x10 (u16), temperature x10 (sign-magnitude
//! u16), then the low byte of the sum of the four data bytes.

use super::Sensor;
use crate::domain::{Measurement, Quantity, Role};
use crate::error::{DecodeError, SensorError};
use crate::hal::HardwareProvider;

pub const FRAME_LEN: usize = 5;

const TEMPERATURE_RANGE: (f64, f64) = (-40.0, 80.0);
const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);

const SIGN_BIT: u16 = 0x8000;

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<Measurement, DecodeError> {
    let expected = checksum(&frame[..4]);
    if expected != frame[4] {
        return Err(DecodeError::Checksum { expected, actual: frame[4] });
    }

    let humidity = f64::from(u16::from_be_bytes([frame[0], frame[1]])) / 10.0;
    let raw_t = u16::from_be_bytes([frame[2], frame[3]]);
    let magnitude = f64::from(raw_t & !SIGN_BIT) / 10.0;
    let temperature = if raw_t & SIGN_BIT != 0 { -magnitude } else { magnitude };

    if !(TEMPERATURE_RANGE.0..=TEMPERATURE_RANGE.1).contains(&temperature) {
        return Err(DecodeError::Range { quantity: Quantity::Temperature, value: temperature });
    }
    if !(HUMIDITY_RANGE.0..=HUMIDITY_RANGE.1).contains(&humidity) {
        return Err(DecodeError::Range { quantity: Quantity::Humidity, value: humidity });
    }
    Ok(Measurement::climate(temperature, humidity))
}

/// inverse of `decode`, used by the simulated bus
pub fn encode_frame(temperature: f64, humidity: f64) -> [u8; FRAME_LEN] {
    let h = (humidity * 10.0).round().clamp(0.0, 1000.0) as u16;
    let magnitude = (temperature.abs() * 10.0).round().min(f64::from(!SIGN_BIT)) as u16;
    let t = if temperature < 0.0 { magnitude | SIGN_BIT } else { magnitude };
    let [h0, h1] = h.to_be_bytes();
    let [t0, t1] = t.to_be_bytes();
    [h0, h1, t0, t1, checksum(&[h0, h1, t0, t1])]
}

pub struct Dht22 {
    pin: u8,
}

impl Dht22 {
    pub fn new(pin: u8) -> Self {
        Self { pin }
    }
}

impl Sensor for Dht22 {
    fn name(&self) -> &'static str {
        "DHT22"
    }

    fn role(&self) -> Role {
        Role::Outdoor
    }

    fn quantities(&self) -> &'static [Quantity] {
        &[Quantity::Temperature, Quantity::Humidity]
    }

    fn measure(&mut self, hal: &mut dyn HardwareProvider) -> Result<Measurement, SensorError> {
        let frame = hal.read_single_wire(self.pin)?;
        tracing::trace!("[DHT22] GPIO{} frame {}", self.pin, hex::encode(frame));
        Ok(decode(&frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Climate, MockHal};

    #[test]
    fn test_decode_positive() {
        // 65.2 %RH, 35.1 °C
        let m = decode(&[0x02, 0x8C, 0x01, 0x5F, 0xEE]).unwrap();
        assert_eq!(m.humidity, Some(65.2));
        assert_eq!(m.temperature, Some(35.1));
    }

    #[test]
    fn test_decode_negative_temperature() {
        let frame = [0x02, 0x8C, 0x80, 0x65, checksum(&[0x02, 0x8C, 0x80, 0x65])];
        let m = decode(&frame).unwrap();
        assert_eq!(m.temperature, Some(-10.1));
    }

    #[test]
    fn test_bad_checksum() {
        let err = decode(&[0x02, 0x8C, 0x01, 0x5F, 0xEF]).unwrap_err();
        assert_eq!(err, DecodeError::Checksum { expected: 0xEE, actual: 0xEF });
    }

    #[test]
    fn test_out_of_range() {
        // 120.0 %RH
        let frame = [0x04, 0xB0, 0x00, 0xC8, checksum(&[0x04, 0xB0, 0x00, 0xC8])];
        assert!(matches!(decode(&frame), Err(DecodeError::Range { quantity: Quantity::Humidity, .. })));
    }

    #[test]
    fn test_encode_matches_decode() {
        let m = decode(&encode_frame(-3.5, 82.0)).unwrap();
        assert_eq!(m.temperature, Some(-3.5));
        assert_eq!(m.humidity, Some(82.0));
    }

    #[test]
    fn test_measure_through_mock_bus() {
        let indoor = Climate { temperature: 21.0, humidity: 45.0, pressure_hpa: 1009.0 };
        let outdoor = Climate { temperature: 7.3, humidity: 91.4, pressure_hpa: 1009.0 };
        let mut hal = MockHal::new(0x44, 0x70).with_climate(indoor, outdoor);
        let m = Dht22::new(4).measure(&mut hal).unwrap();
        assert_eq!(m.temperature, Some(7.3));
        assert_eq!(m.humidity, Some(91.4));
    }
}
