//! ==============================================================================
//! gpio.rs - single-wire bit timing for the dht22
//! ==============================================================================
//!
//! purpose:
//!     reads one raw 40-bit frame off the dht22 data line. the host pulls the
//!     line low to start a conversion, releases it, then times each high
//!     pulse the sensor sends back: ~26us is a 0 bit, ~70us is a 1 bit.
//!
//! relationships:
//!     - used by: hal.rs (PiHal::read_single_wire)
//!     - uses: rppal::gpio (on feature="hardware")
//!
//! timing caveat:
//!     userspace on linux has no real-time guarantees. a preempted read
//!     shows up as a timeout or a bad checksum, and the sampling policy
//!     simply tries again. this layer never retries.
//!
//! ==============================================================================

#![cfg_attr(not(feature = "hardware"), allow(dead_code))]

use crate::error::TransportError;
use std::time::Duration;

/// high pulses longer than this are 1 bits
pub const ONE_THRESHOLD: Duration = Duration::from_micros(48);

pub const FRAME_BITS: usize = 40;

/// Pack the 40 measured high-pulse widths (msb first) into frame bytes.
pub fn pulses_to_frame(highs: &[Duration]) -> Result<[u8; 5], TransportError> {
    if highs.len() != FRAME_BITS {
        return Err(TransportError::Io(format!(
            "single-wire frame had {} bits, expected {}",
            highs.len(),
            FRAME_BITS
        )));
    }
    let mut frame = [0u8; 5];
    for (i, width) in highs.iter().enumerate() {
        if *width > ONE_THRESHOLD {
            frame[i / 8] |= 0x80 >> (i % 8);
        }
    }
    Ok(frame)
}

#[cfg(feature = "hardware")]
mod line {
    use super::{pulses_to_frame, FRAME_BITS};
    use crate::error::TransportError;
    use rppal::gpio::{Gpio, IoPin, Level, Mode};
    use std::time::{Duration, Instant};

    /// host start signal; the dht22 needs at least 1ms low
    const START_LOW: Duration = Duration::from_micros(1100);
    /// sensor response is 80us low + 80us high
    const RESPONSE_TIMEOUT: Duration = Duration::from_micros(200);
    /// every bit is a 50us low followed by at most 70us high
    const BIT_TIMEOUT: Duration = Duration::from_micros(120);

    pub fn map_gpio_error(err: rppal::gpio::Error) -> TransportError {
        match err {
            rppal::gpio::Error::PermissionDenied(path) => TransportError::PermissionDenied(path),
            rppal::gpio::Error::Io(io) => io.into(),
            other => TransportError::Unavailable(other.to_string()),
        }
    }

    /// spin until the line reads `level`; returns how long that took
    fn wait_for(line: &IoPin, level: Level, timeout: Duration, pin: u8) -> Result<Duration, TransportError> {
        let start = Instant::now();
        while line.read() != level {
            if start.elapsed() > timeout {
                return Err(TransportError::Timeout(format!("single-wire GPIO{} waiting for {:?}", pin, level)));
            }
        }
        Ok(start.elapsed())
    }

    pub fn read_frame(gpio: &Gpio, pin: u8) -> Result<[u8; 5], TransportError> {
        let mut line = gpio.get(pin).map_err(map_gpio_error)?.into_io(Mode::Output);

        line.set_low();
        std::thread::sleep(START_LOW);
        line.set_high();
        line.set_mode(Mode::Input);

        wait_for(&line, Level::Low, RESPONSE_TIMEOUT, pin)?;
        wait_for(&line, Level::High, RESPONSE_TIMEOUT, pin)?;
        wait_for(&line, Level::Low, RESPONSE_TIMEOUT, pin)?;

        let mut highs = [Duration::ZERO; FRAME_BITS];
        for width in highs.iter_mut() {
            wait_for(&line, Level::High, BIT_TIMEOUT, pin)?;
            *width = wait_for(&line, Level::Low, BIT_TIMEOUT, pin)?;
        }
        pulses_to_frame(&highs)
    }
}

#[cfg(feature = "hardware")]
pub use line::{map_gpio_error, read_frame};
