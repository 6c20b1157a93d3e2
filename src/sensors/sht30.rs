//! Sensirion SHT30 temperature/humidity sensor (ENV III indoor module).
//!
//! single-shot measurement without clock stretching: send a 2-byte command,
//! wait for the conversion, read `T_msb T_lsb T_crc H_msb H_lsb H_crc`.

use super::Sensor;
use crate::domain::{Measurement, Quantity, Role};
use crate::error::{DecodeError, SensorError};
use crate::hal::HardwareProvider;
use crc::{Crc, CRC_8_NRSC_5};
use std::time::Duration;

pub const DEFAULT_ADDRESS: u8 = 0x44;

/// poly 0x31, init 0xFF, msb-first, no final xor (the sensirion crc)
const SENSIRION_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);

/// single shot, clock stretching disabled: high, medium, low repeatability
const MEASURE_COMMANDS: [[u8; 2]; 3] = [[0x2C, 0x06], [0x2C, 0x0D], [0x2C, 0x10]];

/// high repeatability conversion takes up to 15ms
const MEASURE_DELAY: Duration = Duration::from_millis(20);

const FRAME_LEN: usize = 6;

const TEMPERATURE_RANGE: (f64, f64) = (-40.0, 85.0);
const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);

pub fn crc8(data: &[u8]) -> u8 {
    SENSIRION_CRC.checksum(data)
}

pub fn is_measure_command(data: &[u8]) -> bool {
    MEASURE_COMMANDS.iter().any(|cmd| cmd.as_slice() == data)
}

fn word(triplet: &[u8]) -> Result<u16, DecodeError> {
    let expected = crc8(&triplet[..2]);
    if expected != triplet[2] {
        return Err(DecodeError::Checksum { expected, actual: triplet[2] });
    }
    Ok(u16::from_be_bytes([triplet[0], triplet[1]]))
}

fn in_range(quantity: Quantity, value: f64, (lo, hi): (f64, f64)) -> Result<f64, DecodeError> {
    if (lo..=hi).contains(&value) {
        Ok(value)
    } else {
        Err(DecodeError::Range { quantity, value })
    }
}

/// Decode a raw 6-byte measurement frame.
///
/// both words are crc-checked before any arithmetic; results outside the
/// sensor's specified range are rejected, never clamped.
pub fn decode(frame: &[u8]) -> Result<Measurement, DecodeError> {
    if frame.len() != FRAME_LEN {
        return Err(DecodeError::Frame { expected: FRAME_LEN, actual: frame.len() });
    }
    let temp_raw = word(&frame[0..3])?;
    let hum_raw = word(&frame[3..6])?;

    let temperature = -45.0 + 175.0 * f64::from(temp_raw) / 65535.0;
    let humidity = 100.0 * f64::from(hum_raw) / 65535.0;

    Ok(Measurement::climate(
        in_range(Quantity::Temperature, temperature, TEMPERATURE_RANGE)?,
        in_range(Quantity::Humidity, humidity, HUMIDITY_RANGE)?,
    ))
}

/// inverse of `decode`, used by the simulated bus
pub fn encode_frame(temperature: f64, humidity: f64) -> [u8; 6] {
    let t = (((temperature + 45.0) * 65535.0 / 175.0).round().clamp(0.0, 65535.0)) as u16;
    let h = ((humidity * 65535.0 / 100.0).round().clamp(0.0, 65535.0)) as u16;
    let [t0, t1] = t.to_be_bytes();
    let [h0, h1] = h.to_be_bytes();
    [t0, t1, crc8(&[t0, t1]), h0, h1, crc8(&[h0, h1])]
}

pub struct Sht30 {
    address: u8,
}

impl Sht30 {
    pub fn new(address: u8) -> Self {
        Self { address }
    }

    fn measure_with(&self, hal: &mut dyn HardwareProvider, command: &[u8]) -> Result<Measurement, SensorError> {
        hal.i2c_write(self.address, command)?;
        hal.delay(MEASURE_DELAY);
        let frame = hal.i2c_read(self.address, FRAME_LEN)?;
        tracing::trace!("[SHT30] raw frame {}", hex::encode(&frame));
        Ok(decode(&frame)?)
    }
}

impl Sensor for Sht30 {
    fn name(&self) -> &'static str {
        "SHT30"
    }

    fn role(&self) -> Role {
        Role::Indoor
    }

    fn quantities(&self) -> &'static [Quantity] {
        &[Quantity::Temperature, Quantity::Humidity]
    }

    fn is_i2c(&self) -> bool {
        true
    }

    /// walks down the repeatability ladder until one conversion decodes
    fn measure(&mut self, hal: &mut dyn HardwareProvider) -> Result<Measurement, SensorError> {
        let mut last = None;
        for command in &MEASURE_COMMANDS {
            match self.measure_with(hal, command) {
                Ok(m) => return Ok(m),
                Err(e) => {
                    tracing::debug!("[SHT30] command {} failed: {}", hex::encode(command), e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(SensorError::Decode(DecodeError::Frame { expected: FRAME_LEN, actual: 0 })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::hal::{Climate, MockHal};

    #[test]
    fn test_crc_reference_vector() {
        // datasheet example
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn test_decode_known_frames() {
        let m = decode(&[0x6A, 0x41, 0x36, 0x7A, 0x8C, 0x53]).unwrap();
        assert!((m.temperature.unwrap() - 27.64).abs() < 0.01);
        assert!((m.humidity.unwrap() - 47.87).abs() < 0.01);

        let m = decode(&[0x64, 0x8A, 0xF6, 0x7B, 0x0F, 0x8E]).unwrap();
        assert!((m.temperature.unwrap() - 23.73).abs() < 0.01);
        assert!((m.humidity.unwrap() - 48.07).abs() < 0.01);
        assert_eq!(m.pressure, None);
    }

    #[test]
    fn test_corrupted_crc_is_rejected() {
        let mut frame = [0x6A, 0x41, 0x36, 0x7A, 0x8C, 0x53];
        frame[2] ^= 0x01;
        assert!(matches!(decode(&frame), Err(DecodeError::Checksum { actual: 0x37, .. })));

        let mut frame = [0x6A, 0x41, 0x36, 0x7A, 0x8C, 0x53];
        frame[4] ^= 0x80;
        assert!(matches!(decode(&frame), Err(DecodeError::Checksum { .. })));
    }

    #[test]
    fn test_out_of_range_is_rejected_not_clamped() {
        // raw 0xFFFF -> 130 °C
        let err = decode(&[0xFF, 0xFF, 0xAC, 0x80, 0x00, 0xA2]).unwrap_err();
        assert!(matches!(err, DecodeError::Range { quantity: Quantity::Temperature, .. }));
        // raw 0x0000 -> -45 °C
        let err = decode(&[0x00, 0x00, 0x81, 0x80, 0x00, 0xA2]).unwrap_err();
        assert!(matches!(err, DecodeError::Range { quantity: Quantity::Temperature, .. }));
    }

    #[test]
    fn test_every_valid_frame_decodes_inside_sensor_range() {
        for raw in (0u16..=u16::MAX).step_by(257) {
            let [a, b] = raw.to_be_bytes();
            let frame = [a, b, crc8(&[a, b]), a, b, crc8(&[a, b])];
            match decode(&frame) {
                Ok(m) => {
                    let t = m.temperature.unwrap();
                    let h = m.humidity.unwrap();
                    assert!((-40.0..=85.0).contains(&t), "temperature {}", t);
                    assert!((0.0..=100.0).contains(&h), "humidity {}", h);
                }
                Err(e) => assert!(matches!(e, DecodeError::Range { .. })),
            }
        }
    }

    #[test]
    fn test_short_frame() {
        assert_eq!(decode(&[0x6A, 0x41, 0x36]), Err(DecodeError::Frame { expected: 6, actual: 3 }));
    }

    #[test]
    fn test_measure_through_mock_bus() {
        let climate = Climate { temperature: 19.4, humidity: 61.2, pressure_hpa: 1000.0 };
        let mut hal = MockHal::new(0x44, 0x70).with_climate(climate, climate);
        let m = Sht30::new(0x44).measure(&mut hal).unwrap();
        assert!((m.temperature.unwrap() - 19.4).abs() < 0.01);
        assert!((m.humidity.unwrap() - 61.2).abs() < 0.01);
    }

    #[test]
    fn test_measure_reports_transport_error() {
        let mut hal = MockHal::new(0x44, 0x70);
        hal.fail_address(0x44);
        let err = Sht30::new(0x44).measure(&mut hal).unwrap_err();
        assert_eq!(err, SensorError::Transport(TransportError::Nack(0x44)));
    }
}
