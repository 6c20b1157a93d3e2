//! QST QMP6988 barometric pressure sensor (ENV III indoor module).
//!
//! Pressure is compensated with the datasheet procedure: 25 bytes of
//! factory OTP at 0xA0..=0xB8 give twelve coefficients, which turn the raw
//! 24-bit pressure/temperature counts into Pa through a fixed polynomial.
//! No hand-tuned scaling constants.

use super::Sensor;
use crate::domain::{Measurement, Quantity, Role};
use crate::error::{DecodeError, SensorError};
use crate::hal::HardwareProvider;
use std::time::Duration;

pub const DEFAULT_ADDRESS: u8 = 0x70;

pub const REG_CALIBRATION: u8 = 0xA0;
pub const REG_CHIP_ID: u8 = 0xD1;
pub const REG_RESET: u8 = 0xE0;
pub const REG_IIR: u8 = 0xF1;
pub const REG_CTRL_MEAS: u8 = 0xF4;
pub const REG_DATA: u8 = 0xF7;

pub const CHIP_ID: u8 = 0x5C;
const SOFT_RESET: u8 = 0xE6;
pub const CALIBRATION_LEN: usize = 25;
const DATA_LEN: usize = 6;

/// temperature x2, pressure x16, forced mode
const CTRL_FORCED: u8 = 0b010_101_01;

const RESET_DELAY: Duration = Duration::from_millis(10);
const MEASURE_DELAY: Duration = Duration::from_millis(100);

const PRESSURE_RANGE_HPA: (f64, f64) = (300.0, 1100.0);

const OFFSET: f64 = 8_388_608.0; // 2^23

/// `K = A + S * OTP / 32767` conversion factors from the datasheet
struct Conversion {
    a: f64,
    s: f64,
}

impl Conversion {
    const fn new(a: f64, s: f64) -> Self {
        Self { a, s }
    }

    fn apply(&self, otp: i16) -> f64 {
        self.a + self.s * f64::from(otp) / 32767.0
    }
}

const A1: Conversion = Conversion::new(-6.30e-03, 4.30e-04);
const A2: Conversion = Conversion::new(-1.90e-11, 1.20e-10);
const BT1: Conversion = Conversion::new(1.00e-01, 9.10e-02);
const BT2: Conversion = Conversion::new(1.20e-08, 1.20e-06);
const BP1: Conversion = Conversion::new(3.30e-02, 1.90e-02);
const B11: Conversion = Conversion::new(2.10e-07, 1.40e-07);
const BP2: Conversion = Conversion::new(-6.30e-10, 3.50e-10);
const B12: Conversion = Conversion::new(2.90e-13, 7.60e-13);
const B21: Conversion = Conversion::new(2.10e-15, 1.20e-14);
const BP3: Conversion = Conversion::new(1.30e-16, 7.90e-17);

fn s16(otp: &[u8; CALIBRATION_LEN], idx: usize) -> i16 {
    i16::from_be_bytes([otp[idx], otp[idx + 1]])
}

/// 20-bit two's complement
fn s20(raw: u32) -> i32 {
    ((raw << 12) as i32) >> 12
}

/// Compensation coefficients, already converted to floating point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub a0: f64,
    pub a1: f64,
    pub a2: f64,
    pub b00: f64,
    pub bt1: f64,
    pub bt2: f64,
    pub bp1: f64,
    pub b11: f64,
    pub bp2: f64,
    pub b12: f64,
    pub b21: f64,
    pub bp3: f64,
}

impl Calibration {
    pub fn from_otp(otp: &[u8; CALIBRATION_LEN]) -> Self {
        let ex = u32::from(otp[24]);
        let b00 = s20((u32::from(otp[0]) << 12) | (u32::from(otp[1]) << 4) | (ex >> 4));
        let a0 = s20((u32::from(otp[18]) << 12) | (u32::from(otp[19]) << 4) | (ex & 0x0F));

        Self {
            a0: f64::from(a0) / 16.0,
            a1: A1.apply(s16(otp, 20)),
            a2: A2.apply(s16(otp, 22)),
            b00: f64::from(b00) / 16.0,
            bt1: BT1.apply(s16(otp, 2)),
            bt2: BT2.apply(s16(otp, 4)),
            bp1: BP1.apply(s16(otp, 6)),
            b11: B11.apply(s16(otp, 8)),
            bp2: BP2.apply(s16(otp, 10)),
            b12: B12.apply(s16(otp, 12)),
            b21: B21.apply(s16(otp, 14)),
            bp3: BP3.apply(s16(otp, 16)),
        }
    }

    /// compensated temperature in 1/256 °C
    fn tr(&self, dt: f64) -> f64 {
        self.a0 + self.a1 * dt + self.a2 * dt * dt
    }

    /// compensated pressure in Pa
    fn pr(&self, tr: f64, dp: f64) -> f64 {
        self.b00
            + self.bt1 * tr
            + self.bp1 * dp
            + self.b11 * tr * dp
            + self.bt2 * tr * tr
            + self.bp2 * dp * dp
            + self.b12 * dp * tr * tr
            + self.b21 * dp * dp * tr
            + self.bp3 * dp * dp * dp
    }

    /// `(°C, Pa)` from the raw 24-bit counts
    pub fn compensate(&self, raw_pressure: u32, raw_temperature: u32) -> (f64, f64) {
        let dt = f64::from(raw_temperature) - OFFSET;
        let dp = f64::from(raw_pressure) - OFFSET;
        let tr = self.tr(dt);
        (tr / 256.0, self.pr(tr, dp))
    }

    /// Raw `(pressure, temperature)` counts that compensate to the given
    /// values. Newton's method on both polynomials; used by the simulated bus.
    pub fn raw_for(&self, temperature: f64, pressure_pa: f64) -> (u32, u32) {
        let tr = temperature * 256.0;

        let mut dt = (tr - self.a0) / self.a1;
        for _ in 0..20 {
            let slope = self.a1 + 2.0 * self.a2 * dt;
            dt -= (self.tr(dt) - tr) / slope;
        }

        let mut dp = (pressure_pa - self.b00 - self.bt1 * tr - self.bt2 * tr * tr)
            / (self.bp1 + self.b11 * tr + self.b12 * tr * tr);
        for _ in 0..20 {
            let slope = self.bp1
                + self.b11 * tr
                + self.b12 * tr * tr
                + 2.0 * (self.bp2 + self.b21 * tr) * dp
                + 3.0 * self.bp3 * dp * dp;
            dp -= (self.pr(tr, dp) - pressure_pa) / slope;
        }

        let to_raw = |d: f64| (d + OFFSET).round().clamp(0.0, 16_777_215.0) as u32;
        (to_raw(dp), to_raw(dt))
    }
}

/// Decode the 6-byte data block at 0xF7 (`P[23:0]` then `T[23:0]`, msb first).
pub fn decode(calibration: &Calibration, data: &[u8]) -> Result<Measurement, DecodeError> {
    if data.len() != DATA_LEN {
        return Err(DecodeError::Frame { expected: DATA_LEN, actual: data.len() });
    }
    let raw_p = u32::from_be_bytes([0, data[0], data[1], data[2]]);
    let raw_t = u32::from_be_bytes([0, data[3], data[4], data[5]]);
    let (_, pa) = calibration.compensate(raw_p, raw_t);
    let hpa = pa / 100.0;

    let (lo, hi) = PRESSURE_RANGE_HPA;
    if !(lo..=hi).contains(&hpa) {
        return Err(DecodeError::Range { quantity: Quantity::Pressure, value: hpa });
    }
    Ok(Measurement::pressure(hpa))
}

pub struct Qmp6988 {
    address: u8,
    calibration: Option<Calibration>,
}

impl Qmp6988 {
    pub fn new(address: u8) -> Self {
        Self { address, calibration: None }
    }

    /// chip id check, soft reset and one-time OTP read
    fn initialize(&mut self, hal: &mut dyn HardwareProvider) -> Result<Calibration, SensorError> {
        if let Some(calibration) = self.calibration {
            return Ok(calibration);
        }

        let id = hal.i2c_write_read(self.address, &[REG_CHIP_ID], 1)?;
        let found = id.first().copied().unwrap_or(0);
        if found != CHIP_ID {
            return Err(SensorError::ChipId { expected: CHIP_ID, found });
        }

        hal.i2c_write(self.address, &[REG_RESET, SOFT_RESET])?;
        hal.delay(RESET_DELAY);
        hal.i2c_write(self.address, &[REG_IIR, 0x00])?;

        let otp = hal.i2c_write_read(self.address, &[REG_CALIBRATION], CALIBRATION_LEN)?;
        let otp: [u8; CALIBRATION_LEN] = otp
            .as_slice()
            .try_into()
            .map_err(|_| DecodeError::Frame { expected: CALIBRATION_LEN, actual: otp.len() })?;
        tracing::debug!("[QMP6988] calibration otp {}", hex::encode(otp));

        let calibration = Calibration::from_otp(&otp);
        self.calibration = Some(calibration);
        Ok(calibration)
    }
}

impl Sensor for Qmp6988 {
    fn name(&self) -> &'static str {
        "QMP6988"
    }

    fn role(&self) -> Role {
        Role::Indoor
    }

    fn quantities(&self) -> &'static [Quantity] {
        &[Quantity::Pressure]
    }

    fn is_i2c(&self) -> bool {
        true
    }

    fn measure(&mut self, hal: &mut dyn HardwareProvider) -> Result<Measurement, SensorError> {
        let calibration = self.initialize(hal)?;
        hal.i2c_write(self.address, &[REG_CTRL_MEAS, CTRL_FORCED])?;
        hal.delay(MEASURE_DELAY);
        let data = hal.i2c_write_read(self.address, &[REG_DATA], DATA_LEN)?;
        tracing::trace!("[QMP6988] raw data {}", hex::encode(&data));
        Ok(decode(&calibration, &data)?)
    }

    fn reset(&mut self) {
        self.calibration = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Climate, MockHal, SIMULATED_OTP};

    fn calibration() -> Calibration {
        Calibration::from_otp(&SIMULATED_OTP)
    }

    #[test]
    fn test_otp_sign_extension() {
        let cal = calibration();
        assert_eq!(cal.a0, -77.125);
        assert_eq!(cal.b00, 9375.0);
        assert!((cal.a1 - (-6.30e-3 + 4.30e-4 * 1200.0 / 32767.0)).abs() < 1e-12);
        assert!(cal.bp2 < 0.0);
    }

    #[test]
    fn test_zero_offset_counts_reduce_to_constant_terms() {
        let cal = calibration();
        let (celsius, pa) = cal.compensate(8_388_608, 8_388_608);
        assert!((celsius - cal.a0 / 256.0).abs() < 1e-9);
        let expected = cal.b00 + cal.bt1 * cal.a0 + cal.bt2 * cal.a0 * cal.a0;
        assert!((pa - expected).abs() < 1e-6);
    }

    #[test]
    fn test_raw_for_inverts_compensation() {
        let cal = calibration();
        for (t, p) in [(21.0, 100_900.0), (-10.0, 95_000.0), (40.0, 105_000.0)] {
            let (raw_p, raw_t) = cal.raw_for(t, p);
            let (celsius, pa) = cal.compensate(raw_p, raw_t);
            assert!((celsius - t).abs() < 0.01, "{} vs {}", celsius, t);
            assert!((pa - p).abs() < 1.0, "{} vs {}", pa, p);
        }
    }

    #[test]
    fn test_implausible_pressure_is_rejected() {
        let cal = calibration();
        // zero offsets compensate to ~93.7 hPa
        let data = [0x80, 0x00, 0x00, 0x80, 0x00, 0x00];
        assert!(matches!(
            decode(&cal, &data),
            Err(DecodeError::Range { quantity: Quantity::Pressure, .. })
        ));
        assert!(matches!(decode(&cal, &data[..4]), Err(DecodeError::Frame { .. })));
    }

    #[test]
    fn test_measure_through_mock_bus() {
        let climate = Climate { temperature: 22.0, humidity: 50.0, pressure_hpa: 1013.25 };
        let mut hal = MockHal::new(0x44, 0x70).with_climate(climate, climate);
        let mut sensor = Qmp6988::new(0x70);
        let first = sensor.measure(&mut hal).unwrap();
        assert!((first.pressure.unwrap() - 1013.25).abs() < 0.01);
        assert!(sensor.calibration.is_some());
        // second read reuses the cached calibration
        assert!(sensor.measure(&mut hal).is_ok());
    }

    #[test]
    fn test_wrong_chip_id() {
        let mut hal = MockHal::new(0x44, 0x70);
        hal.i2c_write(0x70, &[REG_CHIP_ID, 0x58]).unwrap();
        let err = Qmp6988::new(0x70).measure(&mut hal).unwrap_err();
        assert_eq!(err, SensorError::ChipId { expected: CHIP_ID, found: 0x58 });
    }
}
