//! Last-known-good readings per (role, quantity).
//!
//! A missing live reading may be replaced by the cached one only while the
//! cached one is younger than the staleness timeout, and the substitution is
//! always flagged. Past the timeout the value is unavailable.

use crate::domain::{Quantity, Reading, Role};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// a reading resolved for the payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolved {
    pub reading: Reading,
    pub was_fallback: bool,
}

pub struct FallbackStore {
    staleness: Duration,
    last_good: HashMap<(Role, Quantity), Reading>,
}

impl FallbackStore {
    pub fn new(staleness: Duration) -> Self {
        Self { staleness, last_good: HashMap::new() }
    }

    pub fn get_or_fallback(&mut self, role: Role, quantity: Quantity, current: Option<Reading>) -> Option<Resolved> {
        self.get_or_fallback_at(role, quantity, current, SystemTime::now())
    }

    pub fn get_or_fallback_at(
        &mut self,
        role: Role,
        quantity: Quantity,
        current: Option<Reading>,
        now: SystemTime,
    ) -> Option<Resolved> {
        if let Some(reading) = current {
            self.last_good.insert((role, quantity), reading);
            return Some(Resolved { reading, was_fallback: false });
        }

        let cached = self.last_good.get(&(role, quantity))?;
        // a capture time in the future (clock step) counts as fresh
        let age = now.duration_since(cached.captured_at).unwrap_or(Duration::ZERO);
        if age < self.staleness {
            tracing::warn!(
                "Using cached {} {} ({:.1}{}, {}s old)",
                role,
                quantity,
                cached.value,
                quantity.unit(),
                age.as_secs()
            );
            Some(Resolved { reading: *cached, was_fallback: true })
        } else {
            tracing::debug!("Cached {} {} is stale ({}s old)", role, quantity, age.as_secs());
            None
        }
    }
}
