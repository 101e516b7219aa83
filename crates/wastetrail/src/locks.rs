//! Per-key mutual exclusion.
//!
//! Mutations of one session are serialized on that session's lock; session
//! creation is serialized on the driver's lock. Unrelated keys never
//! contend beyond the brief map lookup.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::ids::{DriverId, SessionId};

/// Held for the duration of a keyed critical section.
pub type KeyGuard = ArcMutexGuard<RawMutex, ()>;

/// A map of lazily created mutexes, one per key.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Create an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Block until the lock for `key` is held.
    pub fn lock(&self, key: &K) -> KeyGuard {
        let slot = {
            let mut slots = self.slots.lock();
            // Drop idle slots so the map tracks only keys in use.
            if slots.len() > 1024 {
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        slot.lock_arc()
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// The lock table shared by every component that writes session state.
#[derive(Debug, Default)]
pub struct LockTable {
    drivers: KeyedLocks<DriverId>,
    sessions: KeyedLocks<SessionId>,
}

impl LockTable {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize session creation for one driver.
    pub fn driver(&self, driver_id: &DriverId) -> KeyGuard {
        self.drivers.lock(driver_id)
    }

    /// Serialize mutations of one session and its handoffs.
    pub fn session(&self, session_id: &SessionId) -> KeyGuard {
        self.sessions.lock(session_id)
    }
}
