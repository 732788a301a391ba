pub mod advisory;
pub mod bridge;
pub mod config;
pub mod context;
pub mod direct;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod route;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use bridge::{ChannelBridge, ChannelState};
pub use config::{Config, ConfigStore};
pub use context::TunnelContext;
pub use error::{ChannelError, ConfigError, TransportError, TunnelError};
pub use lifecycle::{LifecycleController, RetrySchedule, StartOutcome, TunnelState};
pub use pipeline::{ChannelHandler, EventLoop, EventLoopHandle, Outbound, OutboundBuffer};
pub use route::{Route, Router};
pub use transport::{EngineState, Handle, Transport};

/// Interfaces that host shells implement to adapt the core library
/// without pulling in platform-specific dependencies.
pub mod platform {
    use std::path::PathBuf;

    /// Trait for dispatching user-visible notifications.
    ///
    /// Calls are fire-and-forget and may arrive from any thread; an
    /// implementation hops onto its UI thread if it needs to.
    pub trait Notifier: Send + Sync {
        fn info(&self, title: &str, body: &str);
        fn warn(&self, title: &str, body: &str);
        fn error(&self, title: &str, body: &str);
    }

    /// Trait for platform-correct config and credential paths.
    pub trait AppPaths: Send + Sync {
        fn config_path(&self) -> PathBuf;
        fn credentials_path(&self) -> PathBuf;
    }
}

/// Locks a mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
