//! Process-scoped tunnel context.
//!
//! One `TunnelContext` exists per process and is handed explicitly to the
//! lifecycle controller and to every channel bridge. It owns the single
//! authoritative tunnel state.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::config::ConfigStore;
use crate::lifecycle::TunnelState;
use crate::lock;
use crate::platform::Notifier;
use crate::transport::{EngineState, Transport};

#[derive(Debug)]
struct TunnelStatus {
    state: TunnelState,
    /// Reason recorded by the most recent failed attempt of a retry run.
    last_error: Option<String>,
}

pub struct TunnelContext {
    transport: Arc<dyn Transport>,
    config: ConfigStore,
    notifier: Arc<dyn Notifier>,
    status: Mutex<TunnelStatus>,
}

impl TunnelContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ConfigStore,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            notifier,
            status: Mutex::new(TunnelStatus {
                state: TunnelState::Stopped,
                last_error: None,
            }),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.config.credentials_path()
    }

    pub fn state(&self) -> TunnelState {
        lock(&self.status).state.clone()
    }

    /// Reason of the last failure, if any is still recorded.
    pub fn failure_reason(&self) -> Option<String> {
        let status = lock(&self.status);
        match &status.state {
            TunnelState::Failed(reason) => Some(reason.clone()),
            _ => status.last_error.clone(),
        }
    }

    /// True only when the tunnel is enabled, marked ready here, and the engine
    /// itself still reports ready. The engine check catches a tunnel that died
    /// before the controller noticed.
    pub fn is_tunnel_ready(&self) -> bool {
        self.config.is_enabled()
            && self.state().is_ready()
            && self.transport.tunnel_state() == EngineState::Ready
    }

    pub(crate) fn set_state(&self, state: TunnelState) {
        let mut status = lock(&self.status);
        debug!("Tunnel state {} -> {}", status.state, state);
        status.state = state;
    }

    /// Forget any failure so the next start is attempted from scratch.
    pub(crate) fn clear_failure(&self) {
        let mut status = lock(&self.status);
        status.last_error = None;
        if matches!(status.state, TunnelState::Failed(_)) {
            status.state = TunnelState::Stopped;
        }
    }

    pub(crate) fn record_failure(&self, reason: String) {
        lock(&self.status).last_error = Some(reason);
    }

    /// Marks the tunnel ready unless `cancelled` reports true, checked under
    /// the state lock. Returns whether the state changed.
    pub(crate) fn mark_ready_unless(&self, cancelled: impl FnOnce() -> bool) -> bool {
        let mut status = lock(&self.status);
        if cancelled() {
            return false;
        }
        status.state = TunnelState::Ready;
        status.last_error = None;
        true
    }

    /// Moves a run that gave up mid-start back to `Stopped`.
    pub(crate) fn settle_aborted(&self) {
        let mut status = lock(&self.status);
        if status.state == TunnelState::Starting {
            status.state = TunnelState::Stopped;
        }
    }

    pub(crate) fn reset(&self) {
        let mut status = lock(&self.status);
        status.state = TunnelState::Stopped;
        status.last_error = None;
    }
}
