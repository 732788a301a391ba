//! Pass-through engine that carries connections over plain TCP.
//!
//! Implements [`Transport`] without any tunnel, which is what the CLI shell
//! uses when no real engine is linked in, and what the integration tests
//! drive against local listeners.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};

use crate::error::TransportError;
use crate::lock;
use crate::transport::{EngineState, Handle, Transport};

pub struct DirectTransport {
    state: Mutex<EngineState>,
    streams: Mutex<HashMap<i64, Arc<TcpStream>>>,
    next_handle: AtomicI64,
}

impl DirectTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Stopped),
            streams: Mutex::new(HashMap::new()),
            next_handle: AtomicI64::new(1),
        }
    }

    /// A transport that is already up, for connections that bypass the tunnel.
    pub fn ready() -> Self {
        let transport = Self::new();
        *lock(&transport.state) = EngineState::Ready;
        transport
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        lock(&self.streams).len()
    }

    fn stream(&self, handle: Handle) -> Result<Arc<TcpStream>, TransportError> {
        lock(&self.streams)
            .get(&handle.raw())
            .cloned()
            .ok_or(TransportError::InvalidHandle(handle))
    }
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for DirectTransport {
    fn probe(&self) -> Result<String, TransportError> {
        Ok(format!("direct/{}", env!("CARGO_PKG_VERSION")))
    }

    fn start_tunnel(
        &self,
        credentials: &Path,
        _timeout: Duration,
    ) -> Result<EngineState, TransportError> {
        info!(
            "Direct transport has no tunnel; ignoring credentials at {:?}",
            credentials
        );
        *lock(&self.state) = EngineState::Ready;
        Ok(EngineState::Ready)
    }

    fn shutdown_tunnel(&self) {
        *lock(&self.state) = EngineState::Stopped;
        let streams: Vec<_> = lock(&self.streams).drain().collect();
        for (handle, stream) in streams {
            debug!("Closing handle {handle} on shutdown");
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn tunnel_state(&self) -> EngineState {
        *lock(&self.state)
    }

    fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Handle, TransportError> {
        let state = self.tunnel_state();
        if state != EngineState::Ready {
            return Err(TransportError::ConnectFailed(format!(
                "tunnel is not ready, state: {state}"
            )));
        }

        let ip: IpAddr = host
            .parse()
            .map_err(|_| TransportError::ConnectFailed(format!("not an IP address: {host}")))?;
        let stream = TcpStream::connect_timeout(&SocketAddr::new(ip, port), timeout).map_err(
            |e| match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                    TransportError::Timeout(timeout)
                }
                _ => TransportError::ConnectFailed(e.to_string()),
            },
        )?;
        stream.set_nodelay(true)?;

        let handle = Handle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock(&self.streams).insert(handle.raw(), Arc::new(stream));
        debug!("Opened handle {handle} to {host}:{port}");
        Ok(handle)
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, TransportError> {
        let stream = self.stream(handle)?;
        Ok((&*stream).read(buf)?)
    }

    fn write(&self, handle: Handle, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream(handle)?;
        (&*stream).write_all(data)?;
        Ok(data.len())
    }

    fn close(&self, handle: Handle) {
        if let Some(stream) = lock(&self.streams).remove(&handle.raw()) {
            debug!("Closing handle {handle}");
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
