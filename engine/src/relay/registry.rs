//! One active reader per stream key

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::errors::EngineError;

#[derive(Debug, Default)]
pub struct StreamRegistry {
    active: Mutex<HashSet<String>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim `key`. The claim lasts until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, key: impl Into<String>) -> Result<StreamGuard, EngineError> {
        let key = key.into();
        if !self.lock().insert(key.clone()) {
            return Err(EngineError::AlreadyAttached(key));
        }
        debug!(stream = %key, "Stream registered");
        Ok(StreamGuard {
            registry: self.clone(),
            key,
        })
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

/// Releases its registry entry on drop
#[derive(Debug)]
pub struct StreamGuard {
    registry: Arc<StreamRegistry>,
    key: String,
}

impl StreamGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
        debug!(stream = %self.key, "Stream released");
    }
}
