//! Running success counters, logged every few cycles and at shutdown.

use crate::error::PublishError;
use crate::publisher::PublishOutcome;
use std::collections::BTreeMap;

/// cycles between two summary lines
pub const SUMMARY_EVERY: u64 = 10;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub success: u64,
    pub failure: u64,
}

impl Counter {
    fn record(&mut self, ok: bool) {
        if ok {
            self.success += 1;
        } else {
            self.failure += 1;
        }
    }

    /// success percentage, 0 before the first attempt
    pub fn rate(&self) -> f64 {
        let total = self.success + self.failure;
        if total == 0 {
            0.0
        } else {
            self.success as f64 * 100.0 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub cycles: u64,
    pub sensors: BTreeMap<&'static str, Counter>,
    pub delivered: u64,
    pub rate_limited: u64,
    pub publish_failed: u64,
    pub skipped: u64,
    pub i2c_recoveries: u64,
}

impl Stats {
    pub fn record_sensor(&mut self, name: &'static str, ok: bool) {
        self.sensors.entry(name).or_default().record(ok);
    }

    pub fn record_publish(&mut self, result: &Result<PublishOutcome, PublishError>) {
        match result {
            Ok(PublishOutcome::Delivered) => self.delivered += 1,
            Ok(PublishOutcome::RateLimited) => self.rate_limited += 1,
            Err(_) => self.publish_failed += 1,
        }
    }

    /// a cycle that had nothing to publish
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn record_recovery(&mut self) {
        self.i2c_recoveries += 1;
    }

    /// Count a finished cycle; true when a summary is due.
    pub fn finish_cycle(&mut self) -> bool {
        self.cycles += 1;
        self.cycles % SUMMARY_EVERY == 0
    }

    pub fn publish_rate(&self) -> f64 {
        Counter {
            success: self.delivered,
            failure: self.rate_limited + self.publish_failed,
        }
        .rate()
    }

    pub fn log_summary(&self) {
        let sensors = self
            .sensors
            .iter()
            .map(|(name, c)| format!("{}: {:.0}%", name, c.rate()))
            .collect::<Vec<_>>()
            .join(" | ");
        tracing::info!(
            "[STATS] {} cycles | {} | Send: {:.0}% ({} ok, {} rate-limited, {} failed, {} skipped) | I2C resets: {}",
            self.cycles,
            if sensors.is_empty() { "no sensors" } else { sensors.as_str() },
            self.publish_rate(),
            self.delivered,
            self.rate_limited,
            self.publish_failed,
            self.skipped,
            self.i2c_recoveries
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let mut stats = Stats::default();
        stats.record_sensor("SHT30", true);
        stats.record_sensor("SHT30", true);
        stats.record_sensor("SHT30", true);
        stats.record_sensor("SHT30", false);
        stats.record_sensor("DHT22", false);
        assert_eq!(stats.sensors["SHT30"].rate(), 75.0);
        assert_eq!(stats.sensors["DHT22"].rate(), 0.0);

        stats.record_publish(&Ok(PublishOutcome::Delivered));
        stats.record_publish(&Ok(PublishOutcome::RateLimited));
        stats.record_publish(&Err(PublishError::Timeout));
        stats.record_publish(&Ok(PublishOutcome::Delivered));
        assert_eq!(stats.publish_rate(), 50.0);
        assert_eq!(stats.rate_limited, 1);
    }

    #[test]
    fn test_summary_cadence() {
        let mut stats = Stats::default();
        let due: Vec<u64> = (1..=25).filter(|_| stats.finish_cycle()).collect();
        assert_eq!(due, vec![10, 20]);
        assert_eq!(Counter::default().rate(), 0.0);
    }
}
