//! Tunnel-backed duplex channel.
//!
//! A [`ChannelBridge`] presents one tunnel session to an event-driven
//! pipeline. A bridge built with [`ChannelBridge::direct`] runs the same
//! machinery over a plain transport with no tunnel gate. The blocking transport calls run on helper threads (one connect
//! thread per attempt, one reader thread per session) and every effect they
//! produce is posted back onto the channel's event loop. Writes run
//! synchronously on the event loop thread.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::advisory;
use crate::config::ConnectionConfig;
use crate::context::TunnelContext;
use crate::error::{ChannelError, TransportError};
use crate::lock;
use crate::pipeline::{
    self, ChannelHandler, ConnectFuture, ConnectPromise, EventLoopHandle, Outbound, OutboundBuffer,
};
use crate::route::Route;
use crate::transport::{Handle, Transport};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Connecting,
    Active,
    InputShutdown,
    OutputShutdown,
    Closed,
}

/// One outbound connection through the tunnel.
///
/// Owned by the embedding pipeline. Dropping the bridge closes it.
pub struct ChannelBridge {
    session: Arc<ConnectSession>,
}

/// State shared between the bridge and its connect/reader threads.
struct ConnectSession {
    id: u64,
    transport: Arc<dyn Transport>,
    /// Readiness gate; `None` for a direct channel.
    tunnel: Option<Arc<TunnelContext>>,
    event_loop: EventLoopHandle,
    handler: Arc<dyn ChannelHandler>,
    handle: AtomicI64,
    active: AtomicBool,
    input_shutdown: AtomicBool,
    output_shutdown: AtomicBool,
    state: Mutex<ChannelState>,
    local: Mutex<Option<SocketAddr>>,
    remote: Mutex<Option<SocketAddr>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    read_buffer_size: usize,
    allow_half_closure: bool,
}

impl ChannelBridge {
    pub fn new(
        ctx: Arc<TunnelContext>,
        event_loop: EventLoopHandle,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self {
        let connection = ctx.config().snapshot().connection;
        let transport = Arc::clone(ctx.transport());
        Self::build(transport, Some(ctx), &connection, event_loop, handler)
    }

    /// A channel that bypasses the tunnel and connects through `transport`.
    pub fn direct(
        transport: Arc<dyn Transport>,
        connection: &ConnectionConfig,
        event_loop: EventLoopHandle,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self {
        Self::build(transport, None, connection, event_loop, handler)
    }

    fn build(
        transport: Arc<dyn Transport>,
        tunnel: Option<Arc<TunnelContext>>,
        connection: &ConnectionConfig,
        event_loop: EventLoopHandle,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self {
        let session = ConnectSession {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            tunnel,
            event_loop,
            handler,
            handle: AtomicI64::new(Handle::INVALID.raw()),
            active: AtomicBool::new(false),
            input_shutdown: AtomicBool::new(false),
            output_shutdown: AtomicBool::new(false),
            state: Mutex::new(ChannelState::Unconnected),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            reader: Mutex::new(None),
            read_buffer_size: connection.read_buffer_size.max(1),
            allow_half_closure: connection.allow_half_closure,
        };
        Self {
            session: Arc::new(session),
        }
    }

    pub fn id(&self) -> u64 {
        self.session.id
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.session.state)
    }

    pub fn route(&self) -> Route {
        self.session.route()
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        *lock(&self.session.local)
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        *lock(&self.session.remote)
    }

    pub fn is_open(&self) -> bool {
        self.state() != ChannelState::Closed
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    /// Record the local address. Tunnel sessions have no real local bind.
    pub fn bind(&self, local: SocketAddr) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        *lock(&self.session.local) = Some(local);
        Ok(())
    }

    /// Open the session to `remote` through the tunnel.
    ///
    /// Returns immediately; the blocking connect runs on its own thread and
    /// the result is delivered exactly once on the event loop, followed by
    /// `channel_active` on success. A tunnel channel fails fast when the tunnel
    /// is not ready.
    pub fn connect(&self, remote: SocketAddr, timeout: Duration) -> ConnectFuture {
        let (promise, future) = pipeline::connect_promise();
        let session = &self.session;

        if let Err(e) = session.begin_connect() {
            debug!("Channel {} connect rejected: {e}", session.id);
            session.complete_connect(promise, Err(e));
            return future;
        }

        *lock(&session.remote) = Some(remote);
        if session.tunnel.is_some() {
            advisory::warn_if_rejecting(remote);
        }
        debug!("Connecting to {remote} via {}", self.route());

        let worker = Arc::clone(session);
        let spawned = thread::Builder::new()
            .name(format!("tunnel-connect-{}", session.id))
            .spawn(move || worker.run_connect(remote, timeout, promise));
        if let Err(e) = spawned {
            // The promise went down with the closure; the future reports Abandoned.
            error!("Failed to spawn connect thread: {e}");
            session.close();
        }
        future
    }

    /// Start delivering inbound data. Idempotent: at most one reader thread
    /// runs per session.
    pub fn begin_read(&self) -> Result<(), ChannelError> {
        let session = &self.session;
        if session.input_shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        if !session.is_active() {
            return Err(match self.state() {
                ChannelState::Closed => ChannelError::Closed,
                _ => ChannelError::ProtocolMisuse("begin_read before the channel is active"),
            });
        }

        let mut reader = lock(&session.reader);
        if reader.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        debug!("Starting reader thread for channel {}", session.id);
        let worker = Arc::clone(session);
        let thread = thread::Builder::new()
            .name(format!("tunnel-reader-{}", session.id))
            .spawn(move || worker.read_loop())
            .map_err(TransportError::from)?;
        *reader = Some(thread);
        Ok(())
    }

    /// Flush `out` to the transport. Call only from the event loop thread.
    ///
    /// Empty units are skipped; each remaining unit is one blocking transport
    /// write. A failed write discards the rest of the queue, closes the
    /// session, and is returned. Returns the number of bytes written.
    pub fn write(&self, out: &mut OutboundBuffer) -> Result<usize, ChannelError> {
        let session = &self.session;
        let handle = session.current_handle();
        if !handle.is_valid() || self.state() == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        if session.output_shutdown.load(Ordering::Acquire) {
            return Err(ChannelError::OutputShutdown);
        }

        let mut written = 0;
        while let Some(unit) = out.current() {
            if let Outbound::Foreign(kind) = unit {
                return Err(ChannelError::UnsupportedMessage(kind));
            }
            let Some(Outbound::Bytes(bytes)) = out.pop() else {
                break;
            };
            if bytes.is_empty() {
                continue;
            }
            match session.transport.write(handle, &bytes) {
                Ok(n) => {
                    debug!("Wrote {n} bytes to handle {handle}");
                    written += n;
                }
                Err(e) => {
                    error!("Write error on channel {}: {e}", session.id);
                    out.clear();
                    session.close();
                    return Err(ChannelError::Io(e));
                }
            }
        }
        Ok(written)
    }

    /// Stop sending while still receiving. Closes the channel when the input
    /// side is already shut.
    pub fn shutdown_output(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.session.state);
        match *state {
            ChannelState::Closed => Err(ChannelError::Closed),
            ChannelState::InputShutdown => {
                drop(state);
                debug!("Both halves of channel {} shut, closing", self.session.id);
                self.session.close();
                Ok(())
            }
            ChannelState::Active => {
                self.session.output_shutdown.store(true, Ordering::Release);
                *state = ChannelState::OutputShutdown;
                Ok(())
            }
            ChannelState::OutputShutdown => Ok(()),
            ChannelState::Unconnected | ChannelState::Connecting => {
                Err(ChannelError::ProtocolMisuse("shutdown_output before the channel is active"))
            }
        }
    }

    /// Close the channel. Idempotent and callable from any thread.
    pub fn close(&self) {
        self.session.close();
    }

    pub fn disconnect(&self) {
        self.close();
    }
}

impl Drop for ChannelBridge {
    fn drop(&mut self) {
        self.session.close();
    }
}

impl ConnectSession {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.current_handle().is_valid()
    }

    fn current_handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Acquire))
    }

    fn post(&self, task: impl FnOnce() + Send + 'static) {
        if !self.event_loop.execute(task) {
            debug!("Event loop gone, dropping event for channel {}", self.id);
        }
    }

    fn begin_connect(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        match *state {
            ChannelState::Unconnected => {
                if let Some(ctx) = &self.tunnel {
                    if !ctx.is_tunnel_ready() {
                        return Err(ChannelError::TunnelNotReady(
                            ctx.transport().tunnel_state(),
                        ));
                    }
                }
                *state = ChannelState::Connecting;
                Ok(())
            }
            ChannelState::Closed => Err(ChannelError::Closed),
            ChannelState::Connecting => {
                Err(ChannelError::ProtocolMisuse("connect while a connect is pending"))
            }
            _ => Err(ChannelError::ProtocolMisuse("connect on an already connected channel")),
        }
    }

    fn complete_connect(&self, promise: ConnectPromise, result: Result<(), ChannelError>) {
        self.post(move || promise.complete(result));
    }

    fn run_connect(
        self: Arc<Self>,
        remote: SocketAddr,
        timeout: Duration,
        promise: ConnectPromise,
    ) {
        let host = remote.ip().to_string();
        let result = self.transport.connect(&host, remote.port(), timeout);

        let handle = match result {
            Ok(handle) if handle.is_valid() => handle,
            Ok(handle) => {
                self.fail_connect(
                    promise,
                    remote,
                    format!("transport returned invalid handle {handle}"),
                );
                return;
            }
            Err(e) => {
                self.fail_connect(promise, remote, e.to_string());
                return;
            }
        };

        let mut state = lock(&self.state);
        if *state != ChannelState::Connecting {
            drop(state);
            debug!("Channel {} closed while connecting, releasing handle {handle}", self.id);
            self.transport.close(handle);
            self.complete_connect(promise, Err(ChannelError::Closed));
            return;
        }

        self.handle.store(handle.raw(), Ordering::Release);
        self.active.store(true, Ordering::Release);
        *state = ChannelState::Active;
        info!("Connected to {remote} via {}", self.route());
        // Posted under the state lock: a racing close() can only queue
        // channel_inactive after this.
        let handler = Arc::clone(&self.handler);
        self.post(move || {
            promise.complete(Ok(()));
            handler.channel_active();
        });
    }

    fn route(&self) -> Route {
        match self.tunnel {
            Some(_) => Route::Tunnel,
            None => Route::Direct,
        }
    }

    fn fail_connect(&self, promise: ConnectPromise, addr: SocketAddr, reason: String) {
        warn!("Failed to connect to {addr} via {}: {reason}", self.route());
        self.close();
        self.complete_connect(promise, Err(ChannelError::ConnectFailed { addr, reason }));
    }

    fn read_loop(self: Arc<Self>) {
        debug!("Read loop started for channel {}", self.id);
        let mut buffer = vec![0u8; self.read_buffer_size];

        while !self.input_shutdown.load(Ordering::Acquire) && self.is_active() {
            let handle = self.current_handle();
            if !handle.is_valid() {
                break;
            }

            let capacity = buffer.len();
            let read = self.transport.read(handle, &mut buffer).and_then(|n| {
                if n > capacity {
                    Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("transport reported {n} bytes read into a {capacity}-byte buffer"),
                    )))
                } else {
                    Ok(n)
                }
            });

            match read {
                Ok(0) => {
                    if self.input_shutdown.swap(true, Ordering::AcqRel) {
                        break;
                    }
                    debug!("Read returned EOF on channel {}", self.id);
                    self.transition(ChannelState::Active, ChannelState::InputShutdown);
                    let session = Arc::clone(&self);
                    self.post(move || session.on_input_shutdown());
                    break;
                }
                Ok(n) => {
                    debug!("Read {n} bytes from handle {handle}");
                    let data = buffer[..n].to_vec();
                    let session = Arc::clone(&self);
                    self.post(move || {
                        if session.is_active() {
                            session.handler.channel_read(data);
                            session.handler.channel_read_complete();
                        }
                    });
                }
                Err(e) => {
                    // A read failing because close() released the handle is not an error.
                    if self.input_shutdown.swap(true, Ordering::AcqRel) {
                        break;
                    }
                    error!("Read error on channel {}: {e}", self.id);
                    let session = Arc::clone(&self);
                    self.post(move || session.on_read_error(ChannelError::Io(e)));
                    break;
                }
            }
        }
        debug!("Read loop finished for channel {}", self.id);
    }

    fn on_input_shutdown(&self) {
        let state = *lock(&self.state);
        if state == ChannelState::Closed {
            return;
        }
        self.handler.input_shutdown();
        if !self.allow_half_closure || state == ChannelState::OutputShutdown {
            self.close();
        }
    }

    fn on_read_error(&self, error: ChannelError) {
        self.handler.exception_caught(error);
        self.close();
    }

    fn transition(&self, from: ChannelState, to: ChannelState) {
        let mut state = lock(&self.state);
        if *state == from {
            *state = to;
        }
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), ChannelState::Closed);
        if previous == ChannelState::Closed {
            return;
        }

        // Flags first: a reader woken by the release below sees shutdown and
        // exits quietly instead of reporting an error.
        self.active.store(false, Ordering::Release);
        self.input_shutdown.store(true, Ordering::Release);
        self.output_shutdown.store(true, Ordering::Release);

        let handle = Handle::from_raw(self.handle.swap(Handle::INVALID.raw(), Ordering::AcqRel));
        if handle.is_valid() {
            debug!("Closing handle {handle} for channel {}", self.id);
            self.transport.close(handle);
        }

        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            if reader.thread().id() != thread::current().id() && reader.join().is_err() {
                error!("Reader thread for channel {} panicked", self.id);
            }
        }

        if matches!(
            previous,
            ChannelState::Active | ChannelState::InputShutdown | ChannelState::OutputShutdown
        ) {
            let handler = Arc::clone(&self.handler);
            self.post(move || handler.channel_inactive());
        }
        debug!("Channel {} closed", self.id);
    }
}
