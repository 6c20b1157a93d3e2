//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     raw bus transactions for the station: block i2c reads/writes and one
//!     40-bit frame off the single-wire line. no retries live here.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (using a simulated bus).
//!
//! design philosophy:
//!     - "Compile Anywhere": the default build has no hardware dependency.
//!     - "Pick Once": the backend is chosen in `open()` from config, call
//!       sites only ever see `dyn HardwareProvider`.
//!     - "Single Owner": the station owns the provider for its whole
//!       lifetime, so no locking is needed around the bus.
//!
//! relationships:
//!     - used by: sensors/* (transactions), station.rs (ownership, recovery)
//!     - uses: gpio.rs (single-wire bit timing on the pi)
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use crate::config::{AppConfig, Backend};
use crate::error::TransportError;
use crate::sensors::{dht22, qmp6988, sht30};
use std::time::{Duration, SystemTime};

pub trait HardwareProvider: Send {
    /// short human name for logs
    fn name(&self) -> &'static str;

    fn i2c_write(&mut self, addr: u8, data: &[u8]) -> Result<(), TransportError>;

    fn i2c_read(&mut self, addr: u8, len: usize) -> Result<Vec<u8>, TransportError>;

    /// register read: write the pointer, then read `len` bytes
    fn i2c_write_read(&mut self, addr: u8, data: &[u8], len: usize) -> Result<Vec<u8>, TransportError> {
        self.i2c_write(addr, data)?;
        self.i2c_read(addr, len)
    }

    /// one raw single-wire frame: 4 data bytes + checksum
    fn read_single_wire(&mut self, pin: u8) -> Result<[u8; 5], TransportError>;

    /// measurement settling time between command and read
    fn delay(&mut self, duration: Duration);

    /// drop and reopen the i2c handle after the bus wedged
    fn recover_i2c(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// release every held handle; called once at shutdown
    fn close(&mut self) {}
}

/// Acquire the bus for the configured backend.
///
/// this is the only place a transport error is fatal: the caller aborts
/// startup instead of retrying.
pub fn open(config: &AppConfig) -> Result<Box<dyn HardwareProvider>, TransportError> {
    match config.hardware.backend {
        Backend::Mock => {
            let sht30_addr = config.sensors.indoor.address().unwrap_or(sht30::DEFAULT_ADDRESS);
            let qmp_addr = config.sensors.pressure.address().unwrap_or(qmp6988::DEFAULT_ADDRESS);
            tracing::info!("Using MOCK HAL (No hardware access)");
            Ok(Box::new(MockHal::new(sht30_addr, qmp_addr)))
        }
        #[cfg(feature = "hardware")]
        Backend::Pi => {
            tracing::info!("Using REAL HARDWARE HAL (rppal, i2c-{})", config.hardware.i2c_bus);
            Ok(Box::new(pi::PiHal::open(config.hardware.i2c_bus)?))
        }
        #[cfg(not(feature = "hardware"))]
        Backend::Pi => Err(TransportError::Unavailable(
            "backend \"pi\" requires building with --features hardware".to_string(),
        )),
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build)
// ==============================================================================================

/// target values the simulated sensors encode into their frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure_hpa: f64,
}

#[derive(Debug, Clone, Copy)]
enum ClimateSource {
    /// slow daily swing around a base, like a real room
    Simulated,
    #[cfg(test)]
    Fixed { indoor: Climate, outdoor: Climate },
}

/// factory OTP image for the simulated qmp6988 (negative a0 exercises sign extension)
pub const SIMULATED_OTP: [u8; qmp6988::CALIBRATION_LEN] = [
    0x24, 0x9F, 0x01, 0x2C, 0xFF, 0x88, 0x03, 0x20, 0x00, 0x19, 0xFF, 0xC4, 0x00,
    0x28, 0xFF, 0xF6, 0x00, 0x05, 0xFF, 0xB2, 0x04, 0xB0, 0xFE, 0x0C, 0x0E,
];

/// simulated bus that answers sht30, qmp6988 and dht22 transactions with
/// register-accurate frames, so the real decode path runs on any machine.
pub struct MockHal {
    sht30_addr: u8,
    qmp_addr: u8,
    source: ClimateSource,
    sht30_pending: Option<[u8; 6]>,
    qmp_regs: [u8; 256],
    qmp_pointer: u8,
    qmp_calibration: qmp6988::Calibration,
    failing_addrs: Vec<u8>,
    single_wire_failing: bool,
}

impl MockHal {
    pub fn new(sht30_addr: u8, qmp_addr: u8) -> Self {
        let otp = SIMULATED_OTP;
        let mut qmp_regs = [0u8; 256];
        qmp_regs[qmp6988::REG_CHIP_ID as usize] = qmp6988::CHIP_ID;
        let start = qmp6988::REG_CALIBRATION as usize;
        qmp_regs[start..start + otp.len()].copy_from_slice(&otp);

        Self {
            sht30_addr,
            qmp_addr,
            source: ClimateSource::Simulated,
            sht30_pending: None,
            qmp_regs,
            qmp_pointer: 0,
            qmp_calibration: qmp6988::Calibration::from_otp(&otp),
            failing_addrs: Vec::new(),
            single_wire_failing: false,
        }
    }

    /// pin the simulated climate, for deterministic tests
    #[cfg(test)]
    pub fn with_climate(mut self, indoor: Climate, outdoor: Climate) -> Self {
        self.source = ClimateSource::Fixed { indoor, outdoor };
        self
    }

    /// make every transaction with `addr` fail as a missing ack
    #[cfg(test)]
    pub fn fail_address(&mut self, addr: u8) {
        self.failing_addrs.push(addr);
    }

    #[cfg(test)]
    pub fn fail_single_wire(&mut self) {
        self.single_wire_failing = true;
    }

    fn climate(&self) -> (Climate, Climate) {
        match self.source {
            #[cfg(test)]
            ClimateSource::Fixed { indoor, outdoor } => (indoor, outdoor),
            ClimateSource::Simulated => {
                let secs = crate::domain::unix_timestamp(SystemTime::now()) as f64;
                let hour = (secs / 3600.0) % 24.0;
                // peak at 18:00
                let swing = ((hour - 6.0) * std::f64::consts::PI / 12.0).sin();
                let indoor = Climate {
                    temperature: 22.0 + 1.0 * swing,
                    humidity: 55.0 - 3.0 * swing,
                    pressure_hpa: 1013.25 + 0.5 * swing,
                };
                let outdoor = Climate {
                    temperature: 12.0 + 3.0 * swing,
                    humidity: 70.0 - 10.0 * swing,
                    pressure_hpa: indoor.pressure_hpa,
                };
                (indoor, outdoor)
            }
        }
    }

    fn check_addr(&self, addr: u8) -> Result<(), TransportError> {
        if self.failing_addrs.contains(&addr) || (addr != self.sht30_addr && addr != self.qmp_addr) {
            return Err(TransportError::Nack(addr));
        }
        Ok(())
    }

    fn qmp_write(&mut self, data: &[u8]) {
        let Some((&reg, values)) = data.split_first() else {
            return;
        };
        self.qmp_pointer = reg;
        if let Some(&value) = values.first() {
            match reg {
                qmp6988::REG_RESET => {}
                qmp6988::REG_CTRL_MEAS if value & 0x03 != 0 => {
                    self.qmp_regs[reg as usize] = value;
                    let (indoor, _) = self.climate();
                    let (raw_p, raw_t) = self
                        .qmp_calibration
                        .raw_for(indoor.temperature, indoor.pressure_hpa * 100.0);
                    let start = qmp6988::REG_DATA as usize;
                    self.qmp_regs[start..start + 3].copy_from_slice(&raw_p.to_be_bytes()[1..]);
                    self.qmp_regs[start + 3..start + 6].copy_from_slice(&raw_t.to_be_bytes()[1..]);
                }
                _ => self.qmp_regs[reg as usize] = value,
            }
        }
    }
}

impl HardwareProvider for MockHal {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn i2c_write(&mut self, addr: u8, data: &[u8]) -> Result<(), TransportError> {
        self.check_addr(addr)?;
        tracing::trace!("[MOCK I2C] Addr: 0x{:02X}, Write: {}", addr, hex::encode(data));
        if addr == self.sht30_addr {
            if sht30::is_measure_command(data) {
                let (indoor, _) = self.climate();
                self.sht30_pending = Some(sht30::encode_frame(indoor.temperature, indoor.humidity));
            }
        } else {
            self.qmp_write(data);
        }
        Ok(())
    }

    fn i2c_read(&mut self, addr: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        self.check_addr(addr)?;
        let data = if addr == self.sht30_addr {
            // no measurement latched: the sht30 naks the read header
            let frame = self.sht30_pending.take().ok_or(TransportError::Nack(addr))?;
            frame.iter().copied().take(len).collect::<Vec<u8>>()
        } else {
            let start = self.qmp_pointer as usize;
            (0..len).map(|i| self.qmp_regs[(start + i) % 256]).collect()
        };
        tracing::trace!("[MOCK I2C] Addr: 0x{:02X}, Read: {}", addr, hex::encode(&data));
        Ok(data)
    }

    fn read_single_wire(&mut self, pin: u8) -> Result<[u8; 5], TransportError> {
        if self.single_wire_failing {
            return Err(TransportError::Timeout(format!("single-wire GPIO{}", pin)));
        }
        let (_, outdoor) = self.climate();
        let frame = dht22::encode_frame(outdoor.temperature, outdoor.humidity);
        tracing::trace!("[MOCK 1-WIRE] GPIO{} frame: {}", pin, hex::encode(frame));
        Ok(frame)
    }

    fn delay(&mut self, _duration: Duration) {}

    fn recover_i2c(&mut self) -> Result<(), TransportError> {
        tracing::debug!("[MOCK I2C] Bus reset");
        self.sht30_pending = None;
        Ok(())
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
mod pi {
    use super::HardwareProvider;
    use crate::error::TransportError;
    use crate::gpio;
    use rppal::gpio::Gpio;
    use rppal::i2c::I2c;
    use std::time::Duration;

    pub struct PiHal {
        bus: u8,
        i2c: Option<I2c>,
        gpio: Gpio,
    }

    impl PiHal {
        pub fn open(bus: u8) -> Result<Self, TransportError> {
            let i2c = I2c::with_bus(bus).map_err(|e| i2c_error(None, e))?;
            let gpio = Gpio::new().map_err(gpio::map_gpio_error)?;
            Ok(Self { bus, i2c: Some(i2c), gpio })
        }

        fn bus_for(&mut self, addr: u8) -> Result<&mut I2c, TransportError> {
            let i2c = self
                .i2c
                .as_mut()
                .ok_or_else(|| TransportError::Unavailable("i2c handle closed".to_string()))?;
            i2c.set_slave_address(u16::from(addr)).map_err(|e| i2c_error(Some(addr), e))?;
            Ok(i2c)
        }
    }

    /// linux i2c-dev reports a missing ack as EREMOTEIO (121) or ENXIO (6)
    fn i2c_error(addr: Option<u8>, err: rppal::i2c::Error) -> TransportError {
        match err {
            rppal::i2c::Error::Io(io) => match (addr, io.raw_os_error()) {
                (Some(addr), Some(121)) | (Some(addr), Some(6)) => TransportError::Nack(addr),
                _ => io.into(),
            },
            other => TransportError::Unavailable(other.to_string()),
        }
    }

    impl HardwareProvider for PiHal {
        fn name(&self) -> &'static str {
            "rppal"
        }

        fn i2c_write(&mut self, addr: u8, data: &[u8]) -> Result<(), TransportError> {
            self.bus_for(addr)?.write(data).map_err(|e| i2c_error(Some(addr), e))?;
            Ok(())
        }

        fn i2c_read(&mut self, addr: u8, len: usize) -> Result<Vec<u8>, TransportError> {
            let mut buf = vec![0u8; len];
            let read = self.bus_for(addr)?.read(&mut buf).map_err(|e| i2c_error(Some(addr), e))?;
            if read != len {
                return Err(TransportError::Io(format!("short read from 0x{:02X}: {}/{} bytes", addr, read, len)));
            }
            Ok(buf)
        }

        fn i2c_write_read(&mut self, addr: u8, data: &[u8], len: usize) -> Result<Vec<u8>, TransportError> {
            // combined transaction with a repeated start
            let mut buf = vec![0u8; len];
            self.bus_for(addr)?
                .write_read(data, &mut buf)
                .map_err(|e| i2c_error(Some(addr), e))?;
            Ok(buf)
        }

        fn read_single_wire(&mut self, pin: u8) -> Result<[u8; 5], TransportError> {
            gpio::read_frame(&self.gpio, pin)
        }

        fn delay(&mut self, duration: Duration) {
            std::thread::sleep(duration);
        }

        fn recover_i2c(&mut self) -> Result<(), TransportError> {
            tracing::warn!("Reopening i2c-{}", self.bus);
            self.i2c = None;
            std::thread::sleep(Duration::from_secs(1));
            self.i2c = Some(I2c::with_bus(self.bus).map_err(|e| i2c_error(None, e))?);
            Ok(())
        }

        fn close(&mut self) {
            if self.i2c.take().is_some() {
                tracing::info!("Closed i2c-{}", self.bus);
            }
        }
    }
}
