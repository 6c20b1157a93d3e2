//! ==============================================================================
//! publisher.rs - payload assembly and http push
//! ==============================================================================
//!
//! purpose:
//!     turns the resolved readings of one cycle into a json body and pushes
//!     it to the weather-tracker server.
//!
//! status handling:
//!     - 200: delivered
//!     - 429: rate limited. logged, never retried, not an error
//!     - anything else (other status, timeout, network): retried up to
//!       `max_attempts` with a fixed delay, then `PublishError::Exhausted`
//!
//! payload shapes:
//!     nested: {"timestamp": 1700000000,
//!              "indoor":  {"temperature": 21.5, "humidity": 48.0, "pressure": 1012.3},
//!              "outdoor": {"temperature": 7.3, "humidity": 91.4, "cached": true}}
//!     flat:   {"timestamp", "temperature", "humidity", "pressure",
//!              "temperature_indoor", "sensor_indoor": "ENV3", ...}
//!
//! relationships:
//!     - used by: station.rs
//!     - uses: reqwest (ReqwestTransport)
//!
//! ==============================================================================

use crate::cache::Resolved;
use crate::config::{PayloadFormat, ServerConfig};
use crate::domain::{Quantity, Role};
use crate::error::PublishError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

// ==============================================================================
// payload
// ==============================================================================

/// values of one role, each rounded to one decimal
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoleBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    /// at least one value came from the fallback store
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
}

impl RoleBlock {
    fn set(&mut self, quantity: Quantity, value: f64) {
        let slot = match quantity {
            Quantity::Temperature => &mut self.temperature,
            Quantity::Humidity => &mut self.humidity,
            Quantity::Pressure => &mut self.pressure,
        };
        *slot = Some(round1(value));
    }

    pub fn get(&self, quantity: Quantity) -> Option<f64> {
        match quantity {
            Quantity::Temperature => self.temperature,
            Quantity::Humidity => self.humidity,
            Quantity::Pressure => self.pressure,
        }
    }
}

/// body of one push. a role without values is absent, never null
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Payload {
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indoor: Option<RoleBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outdoor: Option<RoleBlock>,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

impl Payload {
    pub fn from_resolved(timestamp: u64, resolved: &[Resolved]) -> Self {
        let mut payload = Payload { timestamp, ..Default::default() };
        for r in resolved {
            let block = match r.reading.role {
                Role::Indoor => payload.indoor.get_or_insert_with(RoleBlock::default),
                Role::Outdoor => payload.outdoor.get_or_insert_with(RoleBlock::default),
            };
            block.set(r.reading.quantity, r.reading.value);
            block.cached |= r.was_fallback;
        }
        payload
    }

    pub fn role(&self, role: Role) -> Option<&RoleBlock> {
        match role {
            Role::Indoor => self.indoor.as_ref(),
            Role::Outdoor => self.outdoor.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indoor.is_none() && self.outdoor.is_none()
    }

    pub fn to_json(&self, format: PayloadFormat) -> Result<Value, PublishError> {
        match format {
            PayloadFormat::Nested => serde_json::to_value(self).map_err(|e| PublishError::Encode(e.to_string())),
            PayloadFormat::Flat => Ok(Value::Object(self.flat())),
        }
    }

    /// legacy single-sensor shape: unsuffixed fields from indoor, else outdoor
    fn flat(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("timestamp".into(), self.timestamp.into());

        for role in Role::ALL {
            let Some(block) = self.role(role) else { continue };
            for q in Quantity::ALL {
                if let Some(v) = block.get(q) {
                    map.insert(format!("{}_{}", q, role), v.into());
                    map.entry(q.as_str()).or_insert_with(|| v.into());
                }
            }
            let model = match role {
                Role::Indoor => "ENV3",
                Role::Outdoor => "DHT22",
            };
            map.insert(format!("sensor_{}", role), model.into());
            if block.cached {
                map.insert(format!("cached_{}", role), true.into());
            }
        }
        map
    }
}

// ==============================================================================
// transport
// ==============================================================================

#[allow(async_fn_in_trait)]
pub trait HttpTransport {
    /// POST `body` as json, returning the response status
    async fn post_json(&self, url: &str, body: &Value) -> Result<u16, PublishError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<u16, PublishError> {
        let response = self.client.post(url).json(body).send().await?;
        Ok(response.status().as_u16())
    }
}

// ==============================================================================
// publisher
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    RateLimited,
}

pub struct Publisher<T> {
    transport: T,
    url: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<T: HttpTransport> Publisher<T> {
    pub fn new(transport: T, url: impl Into<String>, max_attempts: u32, retry_delay: Duration) -> Self {
        Self { transport, url: url.into(), max_attempts: max_attempts.max(1), retry_delay }
    }

    pub fn from_config(transport: T, server: &ServerConfig) -> Self {
        Self::new(
            transport,
            server.url.clone(),
            server.max_attempts,
            Duration::from_millis(server.retry_delay_ms),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn publish(&self, payload: &Value) -> Result<PublishOutcome, PublishError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.transport.post_json(&self.url, payload).await {
                Ok(200) => return Ok(PublishOutcome::Delivered),
                Ok(429) => {
                    tracing::warn!("[PUBLISH] Rate limited by server, dropping this cycle");
                    return Ok(PublishOutcome::RateLimited);
                }
                Ok(status) => PublishError::Status(status),
                Err(e) => e,
            };

            tracing::warn!("[PUBLISH] Attempt {}/{} failed: {}", attempt, self.max_attempts, err);
            if attempt >= self.max_attempts {
                return Err(PublishError::Exhausted { attempts: attempt, last: Box::new(err) });
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}
