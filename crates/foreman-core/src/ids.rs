// Clock & ID provider
// Wall time, monotonic deltas, entity ids, protocol numbering.

use chrono::{DateTime, Utc};
use std::time::Instant;

/// Wall clock plus a monotonic origin. Event timestamps pair both so journal
/// ordering survives wall-clock adjustments.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Milliseconds since this clock was created. Never decreases.
    pub fn mono_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdProvider;

impl IdProvider {
    pub fn new_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Zero-padded protocol number used as the `NNNN` name prefix.
    pub fn protocol_label(number: u32) -> String {
        format!("{:04}", number)
    }
}
