//! Worker pool: isolated execution slots with least-loaded scheduling
//!
//! Sessions are spread over a small number of worker threads. Each slot owns
//! its sessions outright; the pool only routes commands, reads published
//! loads, and relays state changes to the caller in order.

mod worker;

use crate::command::{DeviceId, StartRequest, StateUpdate, StreamKind, StreamStatus};
use crate::config::PoolConfig;
use crate::registry::{SessionId, SessionRegistry};
use crate::session::SessionLauncher;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;
use worker::{WorkerCommand, WorkerSlot};

/// Default number of slots for a host with `cpus` logical CPUs:
/// one per spare CPU, at most four, and a single slot on small hosts.
pub fn default_pool_size(cpus: usize) -> usize {
    if cpus > 2 {
        (cpus - 1).clamp(1, 4)
    } else {
        1
    }
}

/// Event sent from the slots (and the pool itself) to the state relay
pub(crate) enum PoolEvent {
    Status {
        device_id: DeviceId,
        session_id: SessionId,
        kind: StreamKind,
        status: StreamStatus,
        error: Option<String>,
    },
    /// A stop arrived for a device no slot owns
    StopUnknown { device_id: DeviceId },
}

pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    registry: Arc<SessionRegistry>,
    events: mpsc::UnboundedSender<PoolEvent>,
    relay: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the worker slots. State updates for every device arrive on the
    /// returned receiver.
    pub async fn start(
        config: &PoolConfig,
        launcher: Arc<dyn SessionLauncher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StateUpdate>)> {
        config.validate()?;
        let size = config.worker_count();
        let registry = Arc::new(SessionRegistry::new());
        let (events, events_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let mut slots = Vec::with_capacity(size);
        for index in 0..size {
            let slot = WorkerSlot::spawn(
                index,
                Arc::clone(&launcher),
                events.clone(),
                config.stop_settle(),
            )
            .await?;
            slots.push(slot);
        }

        let relay = tokio::spawn(relay_states(
            events_rx,
            Arc::clone(&registry),
            updates_tx,
        ));

        info!(workers = size, settle = ?config.stop_settle(), "worker pool started");
        Ok((
            Self {
                slots,
                registry,
                events,
                relay: Some(relay),
            },
            updates_rx,
        ))
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Load currently published by each slot
    pub fn slot_loads(&self) -> Vec<usize> {
        self.slots.iter().map(|s| s.load()).collect()
    }

    /// Devices with a registered (non-terminal) session
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Slot currently owning the device's session
    pub fn owner_slot(&self, device_id: &DeviceId) -> Option<usize> {
        self.registry.owner(device_id).map(|e| e.slot)
    }

    /// Least-loaded slot; ties go to the lowest index
    fn select_slot(&self) -> usize {
        self.slots
            .iter()
            .min_by_key(|slot| slot.load())
            .map(|slot| slot.index)
            .unwrap_or(0)
    }

    /// Schedule a session. Rejected without side effects if the device
    /// already has a non-terminal session.
    pub async fn start_session(&self, request: StartRequest) -> Result<()> {
        request.validate()?;
        let device_id = request.device_id.clone();
        let kind = request.kind;
        let session_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let command = WorkerCommand::Start {
            request,
            session_id,
            reply: reply_tx,
        };

        let entry = self
            .registry
            .claim_with(&device_id, session_id, kind, || {
                let slot = self.select_slot();
                self.slots[slot]
                    .commands
                    .send(command)
                    .map_err(|_| Error::WorkerUnavailable(format!("slot {} is gone", slot)))?;
                Ok(slot)
            })?;

        match reply_rx.await {
            Ok(Ok(())) => {
                debug!(device_id = %device_id, slot = entry.slot, "start accepted");
                Ok(())
            }
            Ok(Err(e)) => {
                self.registry.release(&device_id, session_id);
                Err(e)
            }
            Err(_) => {
                self.registry.release(&device_id, session_id);
                Err(Error::WorkerUnavailable(format!(
                    "slot {} dropped the start for {}",
                    entry.slot, device_id
                )))
            }
        }
    }

    /// Route a stop to the owning slot. Unknown devices are answered with
    /// `inactive` unless that was already the last word on them.
    pub fn stop_session(&self, device_id: &DeviceId) -> Result<()> {
        if let Some(entry) = self.registry.owner(device_id) {
            let sent = self.slots[entry.slot].commands.send(WorkerCommand::Stop {
                device_id: device_id.clone(),
            });
            if sent.is_ok() {
                return Ok(());
            }
        }
        self.events
            .send(PoolEvent::StopUnknown {
                device_id: device_id.clone(),
            })
            .map_err(|_| Error::WorkerUnavailable("state relay is gone".to_string()))
    }

    /// Stop every session, wait for the slots to drain and join their threads
    pub async fn shutdown(mut self) {
        info!(sessions = self.registry.len(), "shutting down worker pool");
        for slot in &mut self.slots {
            slot.shutdown().await;
        }
        self.slots.clear();
        let relay = self.relay.take();
        drop(self);
        if let Some(relay) = relay {
            let _ = relay.await;
        }
        info!("worker pool stopped");
    }
}

/// Forward slot events to the caller. Terminal states release the registry
/// entry before they are published, and a device never sees the same state
/// twice in a row.
async fn relay_states(
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
    registry: Arc<SessionRegistry>,
    updates: mpsc::UnboundedSender<StateUpdate>,
) {
    let mut last: HashMap<DeviceId, (StreamKind, StreamStatus)> = HashMap::new();

    while let Some(event) = events.recv().await {
        let update = match event {
            PoolEvent::Status {
                device_id,
                session_id,
                kind,
                status,
                error,
            } => {
                if status.is_terminal() {
                    registry.release(&device_id, session_id);
                }
                StateUpdate {
                    device_id,
                    kind,
                    state: status,
                    error,
                }
            }
            PoolEvent::StopUnknown { device_id } => {
                let previous = last.get(&device_id).copied();
                if previous.is_some_and(|(_, status)| status.is_terminal()) {
                    debug!(device_id = %device_id, "stop for already inactive device");
                    continue;
                }
                StateUpdate {
                    kind: previous.map(|(kind, _)| kind).unwrap_or_default(),
                    device_id,
                    state: StreamStatus::Inactive,
                    error: None,
                }
            }
        };

        if last.get(&update.device_id).map(|(_, s)| *s) == Some(update.state) {
            debug!(device_id = %update.device_id, state = %update.state, "suppressing repeated state");
            continue;
        }
        last.insert(update.device_id.clone(), (update.kind, update.state));

        info!(
            device_id = %update.device_id,
            kind = %update.kind,
            state = %update.state,
            error = update.error.as_deref().unwrap_or(""),
            "session state"
        );
        if updates.send(update).is_err() {
            debug!("state receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_size() {
        assert_eq!(default_pool_size(1), 1);
        assert_eq!(default_pool_size(2), 1);
        assert_eq!(default_pool_size(3), 2);
        assert_eq!(default_pool_size(4), 3);
        assert_eq!(default_pool_size(5), 4);
        assert_eq!(default_pool_size(64), 4);
    }
}
