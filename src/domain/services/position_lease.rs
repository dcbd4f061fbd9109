//! Time-bounded mutual exclusion keyed by position id

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct LeaseEntry {
    token: u64,
    expires_at: Instant,
}

type LeaseTable = Arc<Mutex<HashMap<String, LeaseEntry>>>;

/// Grants at most one live lease per position. A lease that is never released expires
/// after `ttl`, so a stalled worker cannot pin a position forever.
#[derive(Debug)]
pub struct PositionLeases {
    table: LeaseTable,
    ttl: Duration,
    next_token: AtomicU64,
}

impl PositionLeases {
    pub fn new(ttl: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            next_token: AtomicU64::new(1),
        }
    }

    pub fn try_acquire(&self, position_id: &str) -> Option<PositionLease> {
        let now = Instant::now();
        let mut table = match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(entry) = table.get(position_id) {
            if entry.expires_at > now {
                return None;
            }
            warn!("Lease on position {} expired; reassigning", position_id);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        table.insert(
            position_id.to_string(),
            LeaseEntry {
                token,
                expires_at: now + self.ttl,
            },
        );

        Some(PositionLease {
            position_id: position_id.to_string(),
            token,
            table: Arc::clone(&self.table),
        })
    }

    pub fn is_held(&self, position_id: &str) -> bool {
        let table = match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        table
            .get(position_id)
            .map(|e| e.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

/// Released on drop. Dropping an expired lease never releases its successor's.
#[derive(Debug)]
pub struct PositionLease {
    position_id: String,
    token: u64,
    table: LeaseTable,
}

impl PositionLease {
    pub fn position_id(&self) -> &str {
        &self.position_id
    }
}

impl Drop for PositionLease {
    fn drop(&mut self) {
        let mut table = match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        if table.get(&self.position_id).map(|e| e.token) == Some(self.token) {
            table.remove(&self.position_id);
        }
    }
}
