//! One worker slot: a dedicated OS thread running its own current-thread
//! runtime, owning the sessions scheduled onto it.
//!
//! Nothing outside the thread touches the session table. The pool talks to
//! the slot through [`WorkerCommand`]s and reads the published load from a
//! `watch` channel.

use super::PoolEvent;
use crate::command::{DeviceId, SessionOutcome, StartRequest, StreamKind, StreamStatus};
use crate::registry::SessionId;
use crate::session::{SessionContext, SessionControl, SessionLauncher};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) enum WorkerCommand {
    Start {
        request: StartRequest,
        session_id: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        device_id: DeviceId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum LocalEvent {
    Active {
        device_id: DeviceId,
        session_id: SessionId,
    },
    Finished {
        device_id: DeviceId,
        session_id: SessionId,
        outcome: SessionOutcome,
    },
    SettleElapsed {
        device_id: DeviceId,
        session_id: SessionId,
    },
}

struct SlotSession {
    session_id: SessionId,
    kind: StreamKind,
    control: SessionControl,
    stopping: bool,
    settle_timer: Option<JoinHandle<()>>,
}

/// Pool-side handle on a worker thread
pub(crate) struct WorkerSlot {
    pub(crate) index: usize,
    pub(crate) commands: mpsc::UnboundedSender<WorkerCommand>,
    load: watch::Receiver<usize>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerSlot {
    pub(crate) async fn spawn(
        index: usize,
        launcher: Arc<dyn SessionLauncher>,
        events: mpsc::UnboundedSender<PoolEvent>,
        settle: Duration,
    ) -> Result<Self> {
        let (startup_tx, startup_rx) = oneshot::channel::<Result<()>>();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (load_tx, load) = watch::channel(0usize);

        let thread = thread::Builder::new()
            .name(format!("stream-worker-{}", index))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(slot = index, "failed to create worker runtime: {}", e);
                        let _ = startup_tx.send(Err(Error::WorkerUnavailable(format!(
                            "slot {} runtime: {}",
                            index, e
                        ))));
                        return;
                    }
                };

                let _ = startup_tx.send(Ok(()));
                rt.block_on(async move {
                    let (local_tx, local_rx) = mpsc::unbounded_channel();
                    let slot = SlotState {
                        index,
                        launcher,
                        events,
                        load: load_tx,
                        local_tx,
                        settle,
                        sessions: HashMap::new(),
                    };
                    slot.run(command_rx, local_rx).await;
                });
                debug!(slot = index, "worker thread exiting");
            })
            .map_err(|e| Error::WorkerUnavailable(format!("slot {} thread: {}", index, e)))?;

        match startup_rx.await {
            Ok(Ok(())) => Ok(Self {
                index,
                commands,
                load,
                thread: Some(thread),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::WorkerUnavailable(format!(
                "slot {} exited during startup",
                index
            ))),
        }
    }

    /// Load last published by the slot
    pub(crate) fn load(&self) -> usize {
        *self.load.borrow()
    }

    pub(crate) async fn shutdown(&mut self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(WorkerCommand::Shutdown { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        if let Some(handle) = self.thread.take() {
            let index = self.index;
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(slot = index, "worker thread did not exit cleanly");
            }
        }
    }
}

struct SlotState {
    index: usize,
    launcher: Arc<dyn SessionLauncher>,
    events: mpsc::UnboundedSender<PoolEvent>,
    load: watch::Sender<usize>,
    local_tx: mpsc::UnboundedSender<LocalEvent>,
    settle: Duration,
    sessions: HashMap<DeviceId, SlotSession>,
}

impl SlotState {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
        mut local: mpsc::UnboundedReceiver<LocalEvent>,
    ) {
        info!(slot = self.index, "worker slot started");
        let mut draining = false;
        let mut shutdown_reply: Option<oneshot::Sender<()>> = None;

        loop {
            tokio::select! {
                command = commands.recv(), if !draining => match command {
                    Some(WorkerCommand::Start { request, session_id, reply }) => {
                        let _ = reply.send(self.start(request, session_id));
                    }
                    Some(WorkerCommand::Stop { device_id }) => self.begin_stop(&device_id),
                    Some(WorkerCommand::Shutdown { reply }) => {
                        draining = true;
                        shutdown_reply = Some(reply);
                        self.stop_all();
                    }
                    None => {
                        draining = true;
                        self.stop_all();
                    }
                },
                Some(event) = local.recv() => self.handle_local(event),
            }

            if draining && self.sessions.is_empty() {
                break;
            }
        }

        info!(slot = self.index, "worker slot drained");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn start(&mut self, request: StartRequest, session_id: SessionId) -> Result<()> {
        let device_id = request.device_id.clone();
        if self.sessions.contains_key(&device_id) {
            return Err(Error::SessionAlreadyActive(device_id.to_string()));
        }

        let kind = request.kind;
        let (ctx, control) = SessionContext::new(session_id);
        let mut activation = control.activation();
        self.sessions.insert(
            device_id.clone(),
            SlotSession {
                session_id,
                kind,
                control,
                stopping: false,
                settle_timer: None,
            },
        );
        self.publish_load();
        info!(slot = self.index, device_id = %device_id, session_id = %session_id, kind = %kind, "session scheduled");
        self.emit(&device_id, session_id, kind, StreamStatus::Activating, None);

        let launcher = Arc::clone(&self.launcher);
        let local_tx = self.local_tx.clone();
        tokio::spawn(async move {
            let mut run = tokio::spawn(async move { launcher.run(request, ctx).await });
            let mut reported = false;

            let outcome = loop {
                tokio::select! {
                    joined = &mut run => {
                        break match joined {
                            Ok(outcome) => outcome,
                            Err(e) if e.is_panic() => SessionOutcome::failed("session task panicked"),
                            Err(e) => SessionOutcome::failed(e),
                        };
                    }
                    changed = activation.changed(), if !reported => {
                        if changed.is_err() {
                            reported = true;
                        } else if *activation.borrow_and_update() {
                            reported = true;
                            let _ = local_tx.send(LocalEvent::Active {
                                device_id: device_id.clone(),
                                session_id,
                            });
                        }
                    }
                }
            };

            // activation and completion may land in the same poll
            if !reported && *activation.borrow() {
                let _ = local_tx.send(LocalEvent::Active {
                    device_id: device_id.clone(),
                    session_id,
                });
            }
            let _ = local_tx.send(LocalEvent::Finished {
                device_id,
                session_id,
                outcome,
            });
        });

        Ok(())
    }

    fn begin_stop(&mut self, device_id: &DeviceId) {
        let Some(session) = self.sessions.get_mut(device_id) else {
            debug!(slot = self.index, device_id = %device_id, "stop for session not on this slot");
            return;
        };
        if session.stopping {
            debug!(slot = self.index, device_id = %device_id, "stop already in progress");
            return;
        }

        info!(slot = self.index, device_id = %device_id, "stopping session");
        session.stopping = true;
        session.control.stop();

        let local_tx = self.local_tx.clone();
        let settle = self.settle;
        let device_id = device_id.clone();
        let session_id = session.session_id;
        session.settle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let _ = local_tx.send(LocalEvent::SettleElapsed {
                device_id,
                session_id,
            });
        }));
    }

    fn stop_all(&mut self) {
        let devices: Vec<DeviceId> = self.sessions.keys().cloned().collect();
        for device_id in devices {
            self.begin_stop(&device_id);
        }
    }

    fn handle_local(&mut self, event: LocalEvent) {
        match event {
            LocalEvent::Active {
                device_id,
                session_id,
            } => {
                let Some(session) = self.current(&device_id, session_id) else {
                    return;
                };
                if session.stopping {
                    debug!(device_id = %device_id, "ignoring activation of stopping session");
                    return;
                }
                let kind = session.kind;
                self.emit(&device_id, session_id, kind, StreamStatus::Active, None);
            }
            LocalEvent::Finished {
                device_id,
                session_id,
                outcome,
            } => {
                if self.current(&device_id, session_id).is_none() {
                    debug!(device_id = %device_id, session_id = %session_id, "late completion of force-ended session");
                    return;
                }
                let Some(session) = self.sessions.remove(&device_id) else {
                    return;
                };
                if let Some(timer) = session.settle_timer {
                    timer.abort();
                }
                self.publish_load();
                match &outcome {
                    SessionOutcome::Completed { reason } => {
                        info!(slot = self.index, device_id = %device_id, reason = %reason, "session ended")
                    }
                    SessionOutcome::Failed { error } => {
                        warn!(slot = self.index, device_id = %device_id, error = %error, "session failed")
                    }
                }
                self.emit(
                    &device_id,
                    session_id,
                    session.kind,
                    outcome.status(),
                    outcome.error(),
                );
            }
            LocalEvent::SettleElapsed {
                device_id,
                session_id,
            } => {
                if self.current(&device_id, session_id).is_none() {
                    return;
                }
                let Some(session) = self.sessions.remove(&device_id) else {
                    return;
                };
                self.publish_load();
                warn!(
                    slot = self.index,
                    device_id = %device_id,
                    "session did not settle within {:?}, declaring it inactive",
                    self.settle
                );
                self.emit(&device_id, session_id, session.kind, StreamStatus::Inactive, None);
            }
        }
    }

    fn current(&self, device_id: &DeviceId, session_id: SessionId) -> Option<&SlotSession> {
        self.sessions
            .get(device_id)
            .filter(|s| s.session_id == session_id)
    }

    fn publish_load(&self) {
        self.load.send_replace(self.sessions.len());
    }

    fn emit(
        &self,
        device_id: &DeviceId,
        session_id: SessionId,
        kind: StreamKind,
        status: StreamStatus,
        error: Option<String>,
    ) {
        let _ = self.events.send(PoolEvent::Status {
            device_id: device_id.clone(),
            session_id,
            kind,
            status,
            error,
        });
    }
}
