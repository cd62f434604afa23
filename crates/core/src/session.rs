//! Seam between the worker pool and concrete session implementations

use crate::command::{SessionOutcome, StartRequest};
use crate::registry::SessionId;
use async_trait::async_trait;
use tokio::sync::watch;

/// Runs one session from start to its terminal outcome.
///
/// Implementations must return once the context's stop signal fires (the
/// pool force-declares the session inactive if they take longer than the
/// settle delay) and must convert every internal error into
/// [`SessionOutcome::Failed`].
#[async_trait]
pub trait SessionLauncher: Send + Sync + 'static {
    async fn run(&self, request: StartRequest, ctx: SessionContext) -> SessionOutcome;
}

/// What a running session gets from its owner
pub struct SessionContext {
    session_id: SessionId,
    stop_rx: watch::Receiver<bool>,
    active_tx: watch::Sender<bool>,
}

/// Owner side of a [`SessionContext`]
pub struct SessionControl {
    stop_tx: watch::Sender<bool>,
    active_rx: watch::Receiver<bool>,
}

impl SessionContext {
    pub fn new(session_id: SessionId) -> (Self, SessionControl) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (active_tx, active_rx) = watch::channel(false);
        (
            Self {
                session_id,
                stop_rx,
                active_tx,
            },
            SessionControl { stop_tx, active_rx },
        )
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Mark the session as delivering media
    pub fn report_active(&self) {
        self.active_tx.send_replace(true);
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Independent handle on the stop signal, usable inside `select!`
    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            rx: self.stop_rx.clone(),
        }
    }
}

impl SessionControl {
    /// Ask the session to wind down. Repeated calls are harmless.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_active(&self) -> bool {
        *self.active_rx.borrow()
    }

    /// Receiver that flips to `true` when the session reports active
    pub fn activation(&self) -> watch::Receiver<bool> {
        self.active_rx.clone()
    }
}

#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Resolves once a stop is requested or the owner is gone
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
