//! Interface to the external tunnel engine.
//!
//! The engine is an opaque, handle-based TCP transport. Everything above this
//! module talks to it only through [`Transport`].

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::TransportError;

/// Opaque session identifier issued by the engine for one TCP-like connection.
///
/// Only strictly positive values refer to a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(i64);

impl Handle {
    pub const INVALID: Handle = Handle(-1);

    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse state reported by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Ready,
    Failed,
}

impl EngineState {
    /// Numeric code used on the engine's native boundary.
    pub fn as_code(self) -> i32 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Ready => 2,
            Self::Failed => 3,
        }
    }
}

impl TryFrom<i32> for EngineState {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Stopped),
            1 => Ok(Self::Starting),
            2 => Ok(Self::Ready),
            3 => Ok(Self::Failed),
            other => Err(other),
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Handle-based transport supplied by the tunnel engine.
///
/// Threading contract: for any one handle, one thread blocked in [`read`]
/// and one thread in [`write`] may run concurrently. [`close`] may be called
/// from any thread and must wake a reader blocked on the same handle, which
/// then observes EOF or an error. Calls on a closed handle return an error
/// rather than panicking.
///
/// [`read`]: Transport::read
/// [`write`]: Transport::write
/// [`close`]: Transport::close
pub trait Transport: Send + Sync {
    /// Checks that the engine is loaded and returns its version string.
    fn probe(&self) -> Result<String, TransportError>;

    /// Makes one attempt to bring the tunnel up, bounded by `timeout`.
    fn start_tunnel(&self, credentials: &Path, timeout: Duration)
    -> Result<EngineState, TransportError>;

    fn shutdown_tunnel(&self);

    fn tunnel_state(&self) -> EngineState;

    /// Opens a connection to `host:port` through the tunnel. `host` must be an
    /// IP literal; the engine does no name resolution.
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Handle, TransportError>;

    /// Blocks until data arrives. `Ok(0)` means orderly EOF.
    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes all of `data`, returning the number of bytes written.
    fn write(&self, handle: Handle, data: &[u8]) -> Result<usize, TransportError>;

    fn close(&self, handle: Handle);
}
