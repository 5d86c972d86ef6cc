use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::ServerTimestamp;

/// Backend-side clock. Every issued timestamp is strictly greater than the previous one,
/// so two writes in the same millisecond still order deterministically.
#[derive(Debug, Default)]
pub struct ServerClock {
    last_issued: AtomicI64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts issuing after `floor`, used to resume past timestamps already persisted.
    pub fn starting_after(floor: ServerTimestamp) -> Self {
        Self {
            last_issued: AtomicI64::new(floor.as_millis()),
        }
    }

    pub fn now(&self) -> ServerTimestamp {
        let wall = wall_clock_millis();
        let mut previous = self.last_issued.load(Ordering::Acquire);
        loop {
            let next = wall.max(previous.saturating_add(1));
            match self.last_issued.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ServerTimestamp::from_millis(next),
                Err(observed) => previous = observed,
            }
        }
    }
}

fn wall_clock_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}
