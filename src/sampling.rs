//! ==============================================================================
//! sampling.rs - retry and averaging around a sensor read
//! ==============================================================================
//!
//! purpose:
//!     turns a flaky single transaction into one trustworthy measurement:
//!     - retry: a failed read (transport or decode) is retried up to
//!       `max_attempts` times with a fixed delay in between.
//!     - averaging: with `samples > 1`, several good reads are averaged, and
//!       any read that strays from the burst median by more than the
//!       per-quantity limit is dropped as a spike.
//!
//! relationships:
//!     - used by: station.rs (one policy per sensor)
//!     - produces: SamplingError, which station.rs turns into a cache fallback
//!
//! ==============================================================================

use crate::config::{AppConfig, SamplingConfig};
use crate::domain::{Measurement, Quantity};
use crate::error::{SamplingError, SensorError};
use std::time::Duration;

/// largest tolerated distance from the burst median, per quantity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviationLimits {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
}

impl DeviationLimits {
    fn limit(&self, quantity: Quantity) -> f64 {
        match quantity {
            Quantity::Temperature => self.temperature,
            Quantity::Humidity => self.humidity,
            Quantity::Pressure => self.pressure,
        }
    }

    /// true when any quantity of `sample` is further than its limit from `centre`
    pub fn is_outlier(&self, sample: &Measurement, centre: &Measurement) -> bool {
        Quantity::ALL.iter().any(|&q| match (sample.get(q), centre.get(q)) {
            (Some(v), Some(m)) => (v - m).abs() > self.limit(q),
            _ => false,
        })
    }
}

impl From<&SamplingConfig> for DeviationLimits {
    fn from(cfg: &SamplingConfig) -> Self {
        Self {
            temperature: cfg.max_temperature_deviation,
            humidity: cfg.max_humidity_deviation,
            pressure: cfg.max_pressure_deviation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SamplingPolicy {
    pub max_attempts: u32,
    pub attempt_delay: Duration,
    pub samples: u32,
    pub sample_interval: Duration,
    pub limits: DeviationLimits,
}

impl SamplingPolicy {
    /// single sample, plain retry
    pub fn retry(max_attempts: u32, attempt_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_delay,
            samples: 1,
            sample_interval: Duration::ZERO,
            limits: DeviationLimits::from(&SamplingConfig::default()),
        }
    }

    pub fn averaging(mut self, samples: u32, sample_interval: Duration, limits: DeviationLimits) -> Self {
        self.samples = samples.max(1);
        self.sample_interval = sample_interval;
        self.limits = limits;
        self
    }

    /// the policy for one sensor, from its retry budget and the shared averaging settings
    pub fn for_sensor(config: &AppConfig, max_attempts: u32, attempt_delay_ms: u64) -> Self {
        let s = &config.sampling;
        Self::retry(max_attempts, Duration::from_millis(attempt_delay_ms)).averaging(
            s.samples,
            Duration::from_millis(s.sample_interval_ms),
            DeviationLimits::from(s),
        )
    }

    /// One good read, retried up to `max_attempts` times.
    async fn attempt<F>(&self, read: &mut F) -> Result<Measurement, SamplingError>
    where
        F: FnMut() -> Result<Measurement, SensorError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match read() {
                Ok(m) => return Ok(m),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(SamplingError { attempts: attempt, last: e });
                }
                Err(e) => {
                    tracing::debug!("attempt {}/{} failed: {}", attempt, self.max_attempts, e);
                    tokio::time::sleep(self.attempt_delay).await;
                }
            }
        }
    }

    /// Sample a sensor according to this policy.
    ///
    /// fails only when the first sample exhausts every attempt. a later
    /// sample running out of attempts ends the burst early. the burst is
    /// then filtered against its per-quantity median, so a spike is dropped
    /// wherever it lands, and the survivors are averaged.
    pub async fn sample<F>(&self, mut read: F) -> Result<Measurement, SamplingError>
    where
        F: FnMut() -> Result<Measurement, SensorError>,
    {
        let first = self.attempt(&mut read).await?;
        let mut burst = vec![first];

        for n in 1..self.samples {
            tokio::time::sleep(self.sample_interval).await;
            match self.attempt(&mut read).await {
                Ok(sample) => burst.push(sample),
                Err(e) => {
                    tracing::warn!("sample {}/{} failed ({}), averaging {} good samples", n + 1, self.samples, e, burst.len());
                    break;
                }
            }
        }

        if burst.len() == 1 {
            return Ok(first);
        }

        let centre = median(&burst);
        let accepted: Vec<Measurement> = burst
            .into_iter()
            .filter(|sample| {
                let spike = self.limits.is_outlier(sample, &centre);
                if spike {
                    tracing::warn!("discarding outlier sample {} (median {})", sample, centre);
                }
                !spike
            })
            .collect();

        if accepted.is_empty() {
            Ok(centre)
        } else {
            Ok(Measurement::mean(&accepted))
        }
    }
}

/// component-wise lower median; a quantity missing from every sample stays None
fn median(samples: &[Measurement]) -> Measurement {
    let mut out = Measurement::default();
    for q in Quantity::ALL {
        let mut values: Vec<f64> = samples.iter().filter_map(|m| m.get(q)).collect();
        if values.is_empty() {
            continue;
        }
        values.sort_by(f64::total_cmp);
        let mid = values[(values.len() - 1) / 2];
        match q {
            Quantity::Temperature => out.temperature = Some(mid),
            Quantity::Humidity => out.humidity = Some(mid),
            Quantity::Pressure => out.pressure = Some(mid),
        }
    }
    out
}
