use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::types::Source;

/// In-flight guard: at most one pipeline run per (user, source). A second
/// request for the same pair is rejected, never queued.
#[derive(Clone, Default)]
pub struct PipelineGuard {
    in_flight: Arc<Mutex<HashSet<(String, Source)>>>,
}

impl PipelineGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the (user, source) slot. `None` means a run is already
    /// in flight.
    pub fn try_acquire(&self, user: &str, source: Source) -> Option<GuardSlot> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert((user.to_string(), source)) {
            return None;
        }
        Some(GuardSlot {
            guard: self.clone(),
            key: (user.to_string(), source),
        })
    }
}

/// Releases the slot on drop, so early returns and panics cannot leak it.
pub struct GuardSlot {
    guard: PipelineGuard,
    key: (String, Source),
}

impl Drop for GuardSlot {
    fn drop(&mut self) {
        let mut in_flight = self
            .guard
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.key);
    }
}
