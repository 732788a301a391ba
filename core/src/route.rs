//! Per-connection choice between the tunnel and a direct path.

use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use crate::bridge::ChannelBridge;
use crate::context::TunnelContext;
use crate::pipeline::{ChannelHandler, EventLoopHandle};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tunnel,
    Direct,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Tunnel => write!(f, "tunnel"),
            Route::Direct => write!(f, "direct connection"),
        }
    }
}

/// Builds channels for new connections.
///
/// While the tunnel is enabled every channel goes through it and fails fast
/// when it is not ready. A disabled tunnel sends connections over `direct`.
pub struct Router {
    ctx: Arc<TunnelContext>,
    direct: Arc<dyn Transport>,
}

impl Router {
    pub fn new(ctx: Arc<TunnelContext>, direct: Arc<dyn Transport>) -> Self {
        Self { ctx, direct }
    }

    /// Route decided from the persisted enabled flag at call time.
    pub fn route(&self) -> Route {
        if self.ctx.config().is_enabled() {
            Route::Tunnel
        } else {
            Route::Direct
        }
    }

    pub fn channel(
        &self,
        event_loop: EventLoopHandle,
        handler: Arc<dyn ChannelHandler>,
    ) -> ChannelBridge {
        match self.route() {
            Route::Tunnel => {
                debug!("Tunnel enabled, routing through tunnel");
                ChannelBridge::new(Arc::clone(&self.ctx), event_loop, handler)
            }
            Route::Direct => {
                info!("Tunnel disabled, using direct connection");
                let connection = self.ctx.config().snapshot().connection;
                ChannelBridge::direct(Arc::clone(&self.direct), &connection, event_loop, handler)
            }
        }
    }
}
