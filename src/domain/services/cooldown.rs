//! Post-close re-entry cool-down per user and symbol

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
pub struct CooldownRegistry {
    duration: Duration,
    until: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl CooldownRegistry {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            until: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or extend) the cool-down from `closed_at`
    pub fn start(&self, user_id: &str, symbol: &str, closed_at: DateTime<Utc>) {
        if self.duration <= Duration::zero() {
            return;
        }
        let expires = closed_at + self.duration;
        let mut until = match self.until.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = until
            .entry((user_id.to_string(), symbol.to_string()))
            .or_insert(expires);
        if *entry < expires {
            *entry = expires;
        }
        debug!("Cool-down for {} on {} until {}", user_id, symbol, expires);
    }

    /// Time left before `user_id` may re-enter `symbol`
    pub fn remaining(&self, user_id: &str, symbol: &str, now: DateTime<Utc>) -> Option<Duration> {
        let mut until = match self.until.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        until.retain(|_, expires| *expires > now);
        until
            .get(&(user_id.to_string(), symbol.to_string()))
            .map(|expires| *expires - now)
    }
}
