//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `station.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     the WEATHER_* environment overrides.
//!
//! structure:
//!     - StationConfig: cycle interval.
//!     - ServerConfig: where and how the payload is pushed.
//!     - HardwareConfig: mock or real bus, i2c bus number.
//!     - SensorsConfig: i2c addresses, gpio pin and retry budget per sensor.
//!     - SamplingConfig: multi-sample averaging and outlier limits.
//!     - CacheConfig: staleness timeout for last-known values.
//!
//! ==============================================================================

use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StationConfig {
    pub interval_seconds: u64,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self { interval_seconds: 60 }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// `{indoor: {...}, outdoor: {...}, timestamp}`
    Nested,
    /// legacy `{temperature, humidity, pressure?, timestamp}` plus suffixed per-role fields
    Flat,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub payload_format: PayloadFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "https://mrx3k1.de/weather-tracker/weather-tracker".to_string(),
            timeout_seconds: 10,
            max_attempts: 3,
            retry_delay_ms: 2000,
            payload_format: PayloadFormat::Nested,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// simulated bus, no hardware access
    Mock,
    /// rppal on a raspberry pi (needs the `hardware` feature)
    Pi,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HardwareConfig {
    pub backend: Backend,
    pub i2c_bus: u8,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self { backend: Backend::Mock, i2c_bus: 1 }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SensorsConfig {
    #[serde(default = "I2cSensorConfig::sht30")]
    pub indoor: I2cSensorConfig,
    #[serde(default = "I2cSensorConfig::qmp6988")]
    pub pressure: I2cSensorConfig,
    #[serde(default)]
    pub outdoor: SingleWireSensorConfig,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            indoor: I2cSensorConfig::sht30(),
            pressure: I2cSensorConfig::qmp6988(),
            outdoor: SingleWireSensorConfig::default(),
        }
    }
}

/// an i2c sensor section; `address` is required once the section is present
#[derive(Debug, Deserialize, Clone)]
pub struct I2cSensorConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub address: String,
    #[serde(default = "i2c_attempts")]
    pub max_attempts: u32,
    #[serde(default = "i2c_attempt_delay_ms")]
    pub attempt_delay_ms: u64,
}

fn enabled() -> bool {
    true
}

fn i2c_attempts() -> u32 {
    3
}

fn i2c_attempt_delay_ms() -> u64 {
    2000
}

impl I2cSensorConfig {
    fn with_address(address: &str) -> Self {
        Self {
            enabled: enabled(),
            address: address.to_string(),
            max_attempts: i2c_attempts(),
            attempt_delay_ms: i2c_attempt_delay_ms(),
        }
    }

    pub fn sht30() -> Self {
        Self::with_address("0x44")
    }

    pub fn qmp6988() -> Self {
        Self::with_address("0x70")
    }

    pub fn address(&self) -> anyhow::Result<u8> {
        parse_address(&self.address)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SingleWireSensorConfig {
    pub enabled: bool,
    pub gpio_pin: u8,
    pub max_attempts: u32,
    pub attempt_delay_ms: u64,
}

impl Default for SingleWireSensorConfig {
    fn default() -> Self {
        // the dht22 needs ~2s between conversions, retries back off twice as long as i2c
        Self { enabled: true, gpio_pin: 4, max_attempts: 3, attempt_delay_ms: 4000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SamplingConfig {
    pub samples: u32,
    pub sample_interval_ms: u64,
    pub max_temperature_deviation: f64,
    pub max_humidity_deviation: f64,
    pub max_pressure_deviation: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            samples: 1,
            sample_interval_ms: 1000,
            max_temperature_deviation: 10.0,
            max_humidity_deviation: 20.0,
            max_pressure_deviation: 10.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub staleness_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { staleness_seconds: 300 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

/// parse "0x44" / "44" style hex addresses into a 7-bit i2c address
pub fn parse_address(raw: &str) -> anyhow::Result<u8> {
    let digits = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
    let addr = u8::from_str_radix(digits, 16)
        .map_err(|e| anyhow!("invalid i2c address {:?}: {}", raw, e))?;
    if !(0x03..=0x77).contains(&addr) {
        return Err(anyhow!("i2c address 0x{:02X} outside the 7-bit range 0x03..=0x77", addr));
    }
    Ok(addr)
}

impl AppConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback, then apply environment overrides.
    ///
    /// runs before the tracing subscriber exists (the log level lives in
    /// this file), so it reports on stdout/stderr directly.
    pub fn load_or_default() -> Self {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var("WEATHER_CONFIG") {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("station.toml"));
        paths.push(PathBuf::from("..").join("config").join("station.toml"));

        let mut config = None;
        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(loaded) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        config = Some(loaded);
                        break;
                    }
                    Err(e) => {
                        eprintln!("[CONFIG] Warning: Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        let mut config = config.unwrap_or_else(|| {
            println!("[CONFIG] Warning: No config file found - using defaults");
            Self::default()
        });
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// WEATHER_SERVER_URL / WEATHER_GPIO_PIN / WEATHER_REQUEST_TIMEOUT / WEATHER_INTERVAL
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("WEATHER_SERVER_URL") {
            self.server.url = url;
        }
        if let Some(pin) = lookup("WEATHER_GPIO_PIN") {
            match pin.parse() {
                Ok(pin) => self.sensors.outdoor.gpio_pin = pin,
                Err(_) => eprintln!("[CONFIG] Warning: ignoring invalid WEATHER_GPIO_PIN={:?}", pin),
            }
        }
        if let Some(timeout) = lookup("WEATHER_REQUEST_TIMEOUT") {
            match timeout.parse() {
                Ok(secs) if secs > 0 => self.server.timeout_seconds = secs,
                _ => eprintln!("[CONFIG] Warning: ignoring invalid WEATHER_REQUEST_TIMEOUT={:?}", timeout),
            }
        }
        if let Some(interval) = lookup("WEATHER_INTERVAL") {
            match interval.parse() {
                Ok(secs) if secs > 0 => self.station.interval_seconds = secs,
                _ => eprintln!("[CONFIG] Warning: ignoring invalid WEATHER_INTERVAL={:?}", interval),
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sensors.indoor.enabled {
            self.sensors.indoor.address().context("sensors.indoor")?;
        }
        if self.sensors.pressure.enabled {
            self.sensors.pressure.address().context("sensors.pressure")?;
        }
        if self.station.interval_seconds == 0 {
            return Err(anyhow!("station.interval_seconds must be at least 1"));
        }
        if self.server.timeout_seconds == 0 {
            return Err(anyhow!("server.timeout_seconds must be at least 1"));
        }
        if self.server.max_attempts == 0 {
            return Err(anyhow!("server.max_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.station.interval_seconds)
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        tracing::info!("┌─────────────────────────────────────────┐");
        tracing::info!("│         STATION CONFIGURATION           │");
        tracing::info!("├─────────────────────────────────────────┤");
        tracing::info!("│ Server: {}", self.server.url);
        tracing::info!("│ Backend: {:?} (i2c-{})", self.hardware.backend, self.hardware.i2c_bus);
        tracing::info!("│ Interval: {}s", self.station.interval_seconds);
        tracing::info!(
            "│ Indoor: SHT30 {} [{}] | QMP6988 {} [{}]",
            self.sensors.indoor.address,
            if self.sensors.indoor.enabled { "on" } else { "off" },
            self.sensors.pressure.address,
            if self.sensors.pressure.enabled { "on" } else { "off" },
        );
        tracing::info!(
            "│ Outdoor: DHT22 GPIO{} [{}]",
            self.sensors.outdoor.gpio_pin,
            if self.sensors.outdoor.enabled { "on" } else { "off" },
        );
        tracing::info!("│ Cache timeout: {}s", self.cache.staleness_seconds);
        tracing::info!("└─────────────────────────────────────────┘");
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            station: StationConfig::default(),
            server: ServerConfig::default(),
            hardware: HardwareConfig::default(),
            sensors: SensorsConfig::default(),
            sampling: SamplingConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x44").unwrap(), 0x44);
        assert_eq!(parse_address("70").unwrap(), 0x70);
        assert!(parse_address("0x00").is_err());
        assert!(parse_address("zz").is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [station]
            interval_seconds = 30

            [server]
            url = "http://localhost:8080/ingest"
            payload_format = "flat"

            [sensors.indoor]
            address = "0x45"
            "#,
        )
        .unwrap();

        assert_eq!(config.station.interval_seconds, 30);
        assert_eq!(config.server.payload_format, PayloadFormat::Flat);
        assert_eq!(config.server.timeout_seconds, 10);
        assert_eq!(config.sensors.indoor.address().unwrap(), 0x45);
        assert_eq!(config.sensors.outdoor.gpio_pin, 4);
        assert_eq!(config.cache.staleness_seconds, 300);
        assert_eq!(config.hardware.backend, Backend::Mock);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let err = AppConfig::from_toml("[sensors.pressure]\naddress = \"0xZZ\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("sensors.pressure"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "WEATHER_SERVER_URL" => Some("http://example.test/post".to_string()),
            "WEATHER_GPIO_PIN" => Some("17".to_string()),
            "WEATHER_REQUEST_TIMEOUT" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.server.url, "http://example.test/post");
        assert_eq!(config.sensors.outdoor.gpio_pin, 17);
        assert_eq!(config.server.timeout_seconds, 10);
    }

    #[test]
    fn test_shipped_config_parses() {
        let config = AppConfig::from_toml(include_str!("../config/station.toml")).unwrap();
        assert_eq!(config.sensors.pressure.address().unwrap(), 0x70);
        assert_eq!(config.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_env_zero_interval_and_timeout_are_ignored() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "WEATHER_INTERVAL" => Some("0".to_string()),
            "WEATHER_REQUEST_TIMEOUT" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.server.timeout_seconds, 10);

        config.apply_env(|key| (key == "WEATHER_INTERVAL").then(|| "15".to_string()));
        assert_eq!(config.interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(AppConfig::from_toml("[server]\ntimeout_seconds = 0\n").is_err());
    }
}
