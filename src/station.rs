//! ==============================================================================
//! station.rs - the measurement cycle
//! ==============================================================================
//!
//! purpose:
//!     owns everything one cycle touches (bus, sensors, fallback store,
//!     publisher, counters) and runs the cycle on a fixed interval.
//!
//! one cycle:
//!     1. sampling: every enabled sensor, in order, under its policy.
//!        an i2c sensor that exhausted its attempts triggers a bus recovery.
//!     2. resolution: each (role, quantity) goes through the fallback store,
//!        so a recent last-known value can stand in for a failed read.
//!     3. publishing: roles without values are left out. with no values at
//!        all the push is skipped.
//!
//! relationships:
//!     - used by: main.rs
//!     - uses: hal.rs, sensors/*, sampling.rs, cache.rs, publisher.rs, stats.rs
//!
//! ==============================================================================

use crate::cache::{FallbackStore, Resolved};
use crate::config::{AppConfig, PayloadFormat};
use crate::domain::{unix_timestamp, Quantity, Reading, Role};
use crate::error::PublishError;
use crate::hal::HardwareProvider;
use crate::publisher::{HttpTransport, Payload, PublishOutcome, Publisher};
use crate::sensors::Configured;
use crate::stats::Stats;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;

/// how a cycle ended
#[derive(Debug)]
pub enum CycleOutcome {
    Published(PublishOutcome),
    PublishFailed(PublishError),
    /// nothing live and nothing fresh in the cache
    NoData,
}

pub struct Station<T> {
    hal: Box<dyn HardwareProvider>,
    sensors: Vec<Configured>,
    cache: FallbackStore,
    publisher: Publisher<T>,
    format: PayloadFormat,
    stats: Stats,
    interval: Duration,
    show_sensor_data: bool,
}

impl<T: HttpTransport> Station<T> {
    pub fn new(
        config: &AppConfig,
        hal: Box<dyn HardwareProvider>,
        sensors: Vec<Configured>,
        publisher: Publisher<T>,
    ) -> Self {
        Self {
            hal,
            sensors,
            cache: FallbackStore::new(Duration::from_secs(config.cache.staleness_seconds)),
            publisher,
            format: config.server.payload_format,
            stats: Stats::default(),
            interval: config.interval(),
            show_sensor_data: config.logging.show_sensor_data,
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// (role, quantity) pairs the enabled sensors report, in payload order
    fn provided(&self) -> Vec<(Role, Quantity)> {
        let mut slots: Vec<(Role, Quantity)> = self
            .sensors
            .iter()
            .flat_map(|c| c.sensor.quantities().iter().map(move |&q| (c.sensor.role(), q)))
            .collect();
        slots.sort();
        slots.dedup();
        slots
    }

    /// Sample every sensor and return the live readings of this cycle.
    async fn sample_all(&mut self) -> HashMap<(Role, Quantity), Reading> {
        let mut live = HashMap::new();
        let hal = &mut self.hal;

        for Configured { sensor, policy } in self.sensors.iter_mut() {
            let name = sensor.name();
            let result = policy.sample(|| sensor.measure(hal.as_mut())).await;

            match result {
                Ok(measurement) => {
                    self.stats.record_sensor(name, true);
                    if self.show_sensor_data {
                        tracing::info!("[{}] {}: {}", name, sensor.role(), measurement);
                    }
                    for reading in measurement.readings(sensor.role(), SystemTime::now()) {
                        live.insert((reading.role, reading.quantity), reading);
                    }
                }
                Err(e) => {
                    self.stats.record_sensor(name, false);
                    tracing::warn!("[{}] ⚠ Read failed: {}", name, e);
                    if sensor.is_i2c() {
                        tracing::info!("[I2C] Resetting bus on {}", hal.name());
                        self.stats.record_recovery();
                        if let Err(e) = hal.recover_i2c() {
                            tracing::error!("[I2C] Bus reset failed: {}", e);
                        }
                        sensor.reset();
                    }
                }
            }
        }
        live
    }

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let mut live = self.sample_all().await;

        let mut resolved: Vec<Resolved> = Vec::new();
        for (role, quantity) in self.provided() {
            let current = live.remove(&(role, quantity));
            if let Some(r) = self.cache.get_or_fallback(role, quantity, current) {
                resolved.push(r);
            }
        }

        let payload = Payload::from_resolved(unix_timestamp(SystemTime::now()), &resolved);
        if payload.is_empty() {
            tracing::error!("[PUBLISH] ✗ No sensor data available, skipping this cycle");
            self.stats.record_skip();
            return CycleOutcome::NoData;
        }

        let result = match payload.to_json(self.format) {
            Ok(body) => self.publisher.publish(&body).await,
            Err(e) => Err(e),
        };
        self.stats.record_publish(&result);

        match result {
            Ok(outcome) => {
                if outcome == PublishOutcome::Delivered {
                    tracing::info!("[PUBLISH] ✓ Sent to {}", self.publisher.url());
                }
                CycleOutcome::Published(outcome)
            }
            Err(e) => {
                tracing::error!("[PUBLISH] ✗ {}", e);
                CycleOutcome::PublishFailed(e)
            }
        }
    }

    /// Run cycles until `shutdown` resolves.
    ///
    /// shutdown is only observed between cycles; a cycle in flight always
    /// finishes. a cycle longer than the interval pushes the next one back.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!("[RUNTIME] Starting measurement cycle ({}s interval)", self.interval.as_secs());
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("[RUNTIME] Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                CycleOutcome::Published(outcome) => tracing::debug!("[RUNTIME] Cycle done ({:?})", outcome),
                CycleOutcome::PublishFailed(e) => tracing::debug!("[RUNTIME] Cycle done, not delivered: {}", e),
                CycleOutcome::NoData => tracing::debug!("[RUNTIME] Cycle done, nothing to send"),
            }
            if self.stats.finish_cycle() {
                self.stats.log_summary();
            }
        }

        self.hal.close();
        self.stats.log_summary();
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::hal::{Climate, MockHal};
    use crate::sampling::SamplingPolicy;
    use crate::sensors::{dht22::Dht22, qmp6988::Qmp6988, sht30::Sht30};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const INDOOR: Climate = Climate { temperature: 21.0, humidity: 45.0, pressure_hpa: 1009.0 };
    const OUTDOOR: Climate = Climate { temperature: 7.3, humidity: 91.4, pressure_hpa: 1009.0 };

    /// accepts every push and keeps the bodies
    #[derive(Clone, Default)]
    struct Recorder {
        bodies: Arc<Mutex<Vec<Value>>>,
    }

    impl HttpTransport for Recorder {
        async fn post_json(&self, _url: &str, body: &Value) -> Result<u16, PublishError> {
            self.bodies.lock().unwrap().push(body.clone());
            Ok(200)
        }
    }

    /// mock bus whose sensors can be unplugged while the station owns it
    struct Unpluggable {
        inner: MockHal,
        indoor_down: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
        recoveries: Arc<AtomicU32>,
    }

    impl Unpluggable {
        fn check(&self, addr: u8) -> Result<(), TransportError> {
            if self.indoor_down.load(Ordering::SeqCst) && (addr == 0x44 || addr == 0x70) {
                return Err(TransportError::Nack(addr));
            }
            Ok(())
        }
    }

    impl HardwareProvider for Unpluggable {
        fn name(&self) -> &'static str {
            "unpluggable"
        }
        fn i2c_write(&mut self, addr: u8, data: &[u8]) -> Result<(), TransportError> {
            self.check(addr)?;
            self.inner.i2c_write(addr, data)
        }
        fn i2c_read(&mut self, addr: u8, len: usize) -> Result<Vec<u8>, TransportError> {
            self.check(addr)?;
            self.inner.i2c_read(addr, len)
        }
        fn read_single_wire(&mut self, pin: u8) -> Result<[u8; 5], TransportError> {
            self.inner.read_single_wire(pin)
        }
        fn delay(&mut self, _duration: Duration) {}
        fn recover_i2c(&mut self) -> Result<(), TransportError> {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            self.inner.recover_i2c()
        }
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn sensors() -> Vec<Configured> {
        let policy = SamplingPolicy::retry(3, Duration::ZERO);
        vec![
            Configured::new(Box::new(Sht30::new(0x44)), policy.clone()),
            Configured::new(Box::new(Qmp6988::new(0x70)), policy.clone()),
            Configured::new(Box::new(Dht22::new(4)), policy),
        ]
    }

    fn station(hal: Box<dyn HardwareProvider>, recorder: &Recorder) -> Station<Recorder> {
        let mut config = AppConfig::default();
        config.logging.show_sensor_data = false;
        let publisher = Publisher::new(recorder.clone(), "http://station.test/weather", 3, Duration::ZERO);
        Station::new(&config, hal, sensors(), publisher)
    }

    fn mock() -> MockHal {
        MockHal::new(0x44, 0x70).with_climate(INDOOR, OUTDOOR)
    }

    #[tokio::test]
    async fn test_full_cycle_publishes_both_roles() {
        let recorder = Recorder::default();
        let mut station = station(Box::new(mock()), &recorder);

        assert!(matches!(station.run_cycle().await, CycleOutcome::Published(PublishOutcome::Delivered)));

        let bodies = recorder.bodies.lock().unwrap();
        let body = &bodies[0];
        assert!(body["timestamp"].as_u64().unwrap() > 1_600_000_000);
        assert_eq!(body["indoor"]["temperature"], serde_json::json!(21.0));
        assert_eq!(body["indoor"]["humidity"], serde_json::json!(45.0));
        assert_eq!(body["indoor"]["pressure"], serde_json::json!(1009.0));
        assert_eq!(body["outdoor"]["temperature"], serde_json::json!(7.3));
        assert_eq!(body["outdoor"]["humidity"], serde_json::json!(91.4));
        assert!(body["indoor"].get("cached").is_none());
    }

    #[tokio::test]
    async fn test_dead_indoor_bus_publishes_outdoor_only() {
        let recorder = Recorder::default();
        let mut hal = mock();
        hal.fail_address(0x44);
        hal.fail_address(0x70);
        let mut station = station(Box::new(hal), &recorder);

        assert!(matches!(station.run_cycle().await, CycleOutcome::Published(PublishOutcome::Delivered)));

        let bodies = recorder.bodies.lock().unwrap();
        let body = bodies[0].as_object().unwrap();
        let mut keys: Vec<_> = body.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["outdoor", "timestamp"]);
        assert_eq!(station.stats().i2c_recoveries, 2);
        assert_eq!(station.stats().sensors["SHT30"].failure, 1);
        assert_eq!(station.stats().sensors["DHT22"].success, 1);
    }

    #[tokio::test]
    async fn test_recent_indoor_values_fill_in_when_bus_drops() {
        let recorder = Recorder::default();
        let indoor_down = Arc::new(AtomicBool::new(false));
        let recoveries = Arc::new(AtomicU32::new(0));
        let hal = Unpluggable {
            inner: mock(),
            indoor_down: indoor_down.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            recoveries: recoveries.clone(),
        };
        let mut station = station(Box::new(hal), &recorder);

        station.run_cycle().await;
        indoor_down.store(true, Ordering::SeqCst);
        station.run_cycle().await;

        let bodies = recorder.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 2);
        let indoor = &bodies[1]["indoor"];
        assert_eq!(indoor["cached"], Value::Bool(true));
        assert_eq!(indoor["temperature"], serde_json::json!(21.0));
        assert_eq!(indoor["pressure"], serde_json::json!(1009.0));
        assert!(bodies[1]["outdoor"].get("cached").is_none());
        assert_eq!(recoveries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_nothing_to_publish_skips_push() {
        let recorder = Recorder::default();
        let mut hal = mock();
        hal.fail_address(0x44);
        hal.fail_address(0x70);
        hal.fail_single_wire();
        let mut station = station(Box::new(hal), &recorder);

        assert!(matches!(station.run_cycle().await, CycleOutcome::NoData));
        assert!(recorder.bodies.lock().unwrap().is_empty());
        assert_eq!(station.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_run_stops_between_cycles_and_closes_bus() {
        let recorder = Recorder::default();
        let closed = Arc::new(AtomicBool::new(false));
        let hal = Unpluggable {
            inner: mock(),
            indoor_down: Arc::new(AtomicBool::new(false)),
            closed: closed.clone(),
            recoveries: Arc::new(AtomicU32::new(0)),
        };
        let mut station = station(Box::new(hal), &recorder);

        // the first tick fires at once; the next one is a minute away
        station.run(tokio::time::sleep(Duration::from_millis(100))).await;

        assert_eq!(station.stats().cycles, 1);
        assert_eq!(recorder.bodies.lock().unwrap().len(), 1);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_zero_interval_from_env_does_not_stop_the_loop() {
        let recorder = Recorder::default();
        let mut config = AppConfig::default();
        config.logging.show_sensor_data = false;
        config.apply_env(|key| (key == "WEATHER_INTERVAL").then(|| "0".to_string()));
        let publisher = Publisher::new(recorder.clone(), "http://station.test/weather", 3, Duration::ZERO);
        let mut station = Station::new(&config, Box::new(mock()), sensors(), publisher);

        station.run(tokio::time::sleep(Duration::from_millis(100))).await;

        assert_eq!(station.stats().cycles, 1);
    }

    #[tokio::test]
    async fn test_run_counts_cycles_without_data() {
        let recorder = Recorder::default();
        let mut hal = mock();
        hal.fail_address(0x44);
        hal.fail_address(0x70);
        hal.fail_single_wire();
        let mut station = station(Box::new(hal), &recorder);

        station.run(tokio::time::sleep(Duration::from_millis(100))).await;

        assert_eq!(station.stats().cycles, 1);
        assert_eq!(station.stats().skipped, 1);
        assert!(recorder.bodies.lock().unwrap().is_empty());
    }
}
