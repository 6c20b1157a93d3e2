//! ==============================================================================
//! sensors - per-model decoders and transactions
//! ==============================================================================
//!
//! each sensor module exposes a pure `decode` (raw bytes -> Measurement or
//! DecodeError) and a driver struct implementing `Sensor`, which runs one
//! bus transaction and decodes it. retries belong to sampling.rs.
//!
//! ==============================================================================

pub mod dht22;
pub mod qmp6988;
pub mod sht30;

use crate::config::AppConfig;
use crate::domain::{Measurement, Quantity, Role};
use crate::error::SensorError;
use crate::hal::HardwareProvider;
use crate::sampling::SamplingPolicy;

pub trait Sensor: Send {
    fn name(&self) -> &'static str;

    /// placement this sensor reports for
    fn role(&self) -> Role;

    /// quantities a successful measurement fills in
    fn quantities(&self) -> &'static [Quantity];

    /// lives on the i2c bus (a failure may warrant bus recovery)
    fn is_i2c(&self) -> bool {
        false
    }

    /// one transaction + decode, no retries
    fn measure(&mut self, hal: &mut dyn HardwareProvider) -> Result<Measurement, SensorError>;

    /// forget cached device state after the bus was reopened
    fn reset(&mut self) {}
}

/// a sensor together with the retry/averaging policy it is sampled under
pub struct Configured {
    pub sensor: Box<dyn Sensor>,
    pub policy: SamplingPolicy,
}

impl Configured {
    pub fn new(sensor: Box<dyn Sensor>, policy: SamplingPolicy) -> Self {
        Self { sensor, policy }
    }
}

/// Instantiate the enabled sensors in sampling order: indoor climate,
/// indoor pressure, outdoor climate.
pub fn from_config(config: &AppConfig) -> anyhow::Result<Vec<Configured>> {
    let mut sensors = Vec::new();
    let s = &config.sensors;
    if s.indoor.enabled {
        sensors.push(Configured::new(
            Box::new(sht30::Sht30::new(s.indoor.address()?)),
            SamplingPolicy::for_sensor(config, s.indoor.max_attempts, s.indoor.attempt_delay_ms),
        ));
    }
    if s.pressure.enabled {
        sensors.push(Configured::new(
            Box::new(qmp6988::Qmp6988::new(s.pressure.address()?)),
            SamplingPolicy::for_sensor(config, s.pressure.max_attempts, s.pressure.attempt_delay_ms),
        ));
    }
    if s.outdoor.enabled {
        sensors.push(Configured::new(
            Box::new(dht22::Dht22::new(s.outdoor.gpio_pin)),
            SamplingPolicy::for_sensor(config, s.outdoor.max_attempts, s.outdoor.attempt_delay_ms),
        ));
    }
    Ok(sensors)
}
