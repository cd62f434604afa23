//! Device → owning worker slot mapping
//!
//! The registry is the single place that decides whether a device may start a
//! new session. Entries carry a session generation so that a late completion
//! from a force-ended session can never evict its successor.

use crate::command::{DeviceId, StreamKind};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Identifies one session of a device
pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub session_id: SessionId,
    pub slot: usize,
    pub kind: StreamKind,
}

#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<DeviceId, RegistryEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the device on the slot returned by `dispatch`.
    ///
    /// `dispatch` runs under the registry lock and is expected to hand the
    /// start to the chosen slot, so no stop can be routed to that slot before
    /// the start is queued there. Nothing is recorded if it fails.
    pub fn claim_with<F>(
        &self,
        device_id: &DeviceId,
        session_id: SessionId,
        kind: StreamKind,
        dispatch: F,
    ) -> Result<RegistryEntry>
    where
        F: FnOnce() -> Result<usize>,
    {
        let mut entries = self.entries.lock();
        if entries.contains_key(device_id) {
            return Err(Error::SessionAlreadyActive(device_id.to_string()));
        }
        let entry = RegistryEntry {
            session_id,
            slot: dispatch()?,
            kind,
        };
        debug!(device_id = %device_id, slot = entry.slot, session_id = %session_id, "registry claim");
        entries.insert(device_id.clone(), entry);
        Ok(entry)
    }

    pub fn owner(&self, device_id: &DeviceId) -> Option<RegistryEntry> {
        self.entries.lock().get(device_id).copied()
    }

    /// Remove the entry only if it still belongs to `session_id`
    pub fn release(&self, device_id: &DeviceId, session_id: SessionId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(device_id) {
            Some(entry) if entry.session_id == session_id => {
                entries.remove(device_id);
                debug!(device_id = %device_id, session_id = %session_id, "registry release");
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
