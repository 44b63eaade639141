//! Storage for per-key event logs.

use std::collections::HashMap;

use super::counter::EventLog;
use super::key::RateKey;
use crate::error::Result;

/// Backing store for event logs.
///
/// A store is owned by exactly one coordinator, which serializes every call,
/// so implementations need no internal locking. Implementations that can fail
/// report [`GatewayError::StorageFailure`](crate::error::GatewayError::StorageFailure).
pub trait EventStore: Send + 'static {
    /// Fetch the log for a key, if one has been recorded.
    fn load(&self, key: &RateKey) -> Result<Option<EventLog>>;

    /// Replace the log for a key.
    fn save(&mut self, key: &RateKey, log: EventLog) -> Result<()>;

    /// Drop every log whose most recent event is at or before `cutoff_ms`.
    ///
    /// Returns the number of logs removed.
    fn evict_idle(&mut self, cutoff_ms: u64) -> Result<usize>;

    /// Number of keys currently holding a log.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store holding every log in a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: HashMap<RateKey, EventLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryStore {
    fn load(&self, key: &RateKey) -> Result<Option<EventLog>> {
        Ok(self.logs.get(key).cloned())
    }

    fn save(&mut self, key: &RateKey, log: EventLog) -> Result<()> {
        if log.is_empty() {
            self.logs.remove(key);
        } else {
            self.logs.insert(key.clone(), log);
        }
        Ok(())
    }

    fn evict_idle(&mut self, cutoff_ms: u64) -> Result<usize> {
        let before = self.logs.len();
        self.logs.retain(|_, log| log.latest().is_some_and(|latest| latest > cutoff_ms));
        Ok(before - self.logs.len())
    }

    fn len(&self) -> usize {
        self.logs.len()
    }
}
