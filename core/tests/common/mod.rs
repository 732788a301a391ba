#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use wgtunnel_core::config::{Config, ConfigStore};
use wgtunnel_core::platform::{AppPaths, Notifier};
use wgtunnel_core::{
    ChannelError, ChannelHandler, EngineState, Handle, Transport, TransportError, TunnelContext,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub struct TempPaths(PathBuf);

impl AppPaths for TempPaths {
    fn config_path(&self) -> PathBuf {
        self.0.join("config.toml")
    }

    fn credentials_path(&self) -> PathBuf {
        self.0.join("credentials.json")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(Level, String, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(Level, String, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn bodies_for(&self, title: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(_, t, _)| t == title)
            .map(|(_, _, body)| body)
            .collect()
    }

    fn push(&self, level: Level, title: &str, body: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((level, title.to_string(), body.to_string()));
    }
}

impl Notifier for RecordingNotifier {
    fn info(&self, title: &str, body: &str) {
        self.push(Level::Info, title, body);
    }

    fn warn(&self, title: &str, body: &str) {
        self.push(Level::Warn, title, body);
    }

    fn error(&self, title: &str, body: &str) {
        self.push(Level::Error, title, body);
    }
}

/// What the next `read` on a handle returns.
#[derive(Debug, Clone)]
pub enum ReadStep {
    Data(Vec<u8>),
    Eof,
    Error(String),
    /// Reports `n` bytes read without touching the buffer.
    Claim(usize),
}

#[derive(Default)]
struct Pipe {
    steps: Mutex<(VecDeque<ReadStep>, bool)>,
    ready: Condvar,
}

/// Transport whose every answer is scripted by the test.
pub struct ScriptedTransport {
    probe_error: Mutex<Option<String>>,
    start_script: Mutex<VecDeque<Result<EngineState, String>>>,
    start_fallback: Mutex<Result<EngineState, String>>,
    start_delay: Mutex<Duration>,
    on_start: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    start_calls: AtomicUsize,
    starts_in_flight: AtomicUsize,
    max_starts_in_flight: AtomicUsize,
    shutdown_calls: AtomicUsize,
    state: Mutex<EngineState>,
    connect_script: Mutex<VecDeque<Result<i64, String>>>,
    connect_calls: AtomicUsize,
    next_handle: AtomicI64,
    pipes: Mutex<HashMap<i64, Arc<Pipe>>>,
    writes: Mutex<Vec<(Handle, Vec<u8>)>>,
    fail_writes: AtomicBool,
    closed: Mutex<Vec<Handle>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            probe_error: Mutex::new(None),
            start_script: Mutex::new(VecDeque::new()),
            start_fallback: Mutex::new(Ok(EngineState::Ready)),
            start_delay: Mutex::new(Duration::ZERO),
            on_start: Mutex::new(None),
            start_calls: AtomicUsize::new(0),
            starts_in_flight: AtomicUsize::new(0),
            max_starts_in_flight: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
            state: Mutex::new(EngineState::Stopped),
            connect_script: Mutex::new(VecDeque::new()),
            connect_calls: AtomicUsize::new(0),
            next_handle: AtomicI64::new(100),
            pipes: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            closed: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_probe(&self, reason: &str) {
        *self.probe_error.lock().unwrap() = Some(reason.to_string());
    }

    pub fn script_starts(&self, results: impl IntoIterator<Item = Result<EngineState, String>>) {
        self.start_script.lock().unwrap().extend(results);
    }

    pub fn always_fail_start(&self, reason: &str) {
        *self.start_fallback.lock().unwrap() = Err(reason.to_string());
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    /// Runs `hook` at the top of every `start_tunnel` call.
    pub fn on_start(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_start.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn max_starts_in_flight(&self) -> usize {
        self.max_starts_in_flight.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn script_connect(&self, result: Result<i64, String>) {
        self.connect_script.lock().unwrap().push_back(result);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn feed(&self, handle: Handle, step: ReadStep) {
        let pipe = self.pipe(handle.raw());
        pipe.steps.lock().unwrap().0.push_back(step);
        pipe.ready.notify_all();
    }

    pub fn writes(&self) -> Vec<(Handle, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn closed(&self) -> Vec<Handle> {
        self.closed.lock().unwrap().clone()
    }

    pub fn last_handle(&self) -> Handle {
        Handle::from_raw(self.next_handle.load(Ordering::SeqCst) - 1)
    }

    fn pipe(&self, raw: i64) -> Arc<Pipe> {
        Arc::clone(self.pipes.lock().unwrap().entry(raw).or_default())
    }
}

impl Transport for ScriptedTransport {
    fn probe(&self) -> Result<String, TransportError> {
        match self.probe_error.lock().unwrap().clone() {
            Some(reason) => Err(TransportError::Unavailable(reason)),
            None => Ok("scripted/1.0".to_string()),
        }
    }

    fn start_tunnel(
        &self,
        _credentials: &Path,
        _timeout: Duration,
    ) -> Result<EngineState, TransportError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_start.lock().unwrap().as_ref() {
            hook();
        }
        let in_flight = self.starts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_starts_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.start_delay.lock().unwrap();
        thread::sleep(delay);

        let next = self
            .start_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.start_fallback.lock().unwrap().clone());
        self.starts_in_flight.fetch_sub(1, Ordering::SeqCst);

        match next {
            Ok(state) => {
                self.set_state(state);
                Ok(state)
            }
            Err(reason) => {
                self.set_state(EngineState::Failed);
                Err(TransportError::ConnectFailed(reason))
            }
        }
    }

    fn shutdown_tunnel(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.set_state(EngineState::Stopped);
    }

    fn tunnel_state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    fn connect(
        &self,
        _host: &str,
        _port: u16,
        _timeout: Duration,
    ) -> Result<Handle, TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        match self.connect_script.lock().unwrap().pop_front() {
            Some(Err(reason)) => Err(TransportError::ConnectFailed(reason)),
            Some(Ok(raw)) => Ok(Handle::from_raw(raw)),
            None => {
                let raw = self.next_handle.fetch_add(1, Ordering::SeqCst);
                self.pipe(raw);
                Ok(Handle::from_raw(raw))
            }
        }
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, TransportError> {
        let pipe = self.pipe(handle.raw());
        let mut steps = pipe.steps.lock().unwrap();
        loop {
            if steps.1 {
                return Err(TransportError::InvalidHandle(handle));
            }
            if let Some(step) = steps.0.pop_front() {
                return match step {
                    ReadStep::Data(data) => {
                        let n = data.len().min(buf.len());
                        buf[..n].copy_from_slice(&data[..n]);
                        Ok(n)
                    }
                    ReadStep::Eof => Ok(0),
                    ReadStep::Claim(n) => Ok(n),
                    ReadStep::Error(reason) => {
                        Err(TransportError::Io(std::io::Error::other(reason)))
                    }
                };
            }
            steps = pipe.ready.wait(steps).unwrap();
        }
    }

    fn write(&self, handle: Handle, data: &[u8]) -> Result<usize, TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::other("broken pipe")));
        }
        self.writes.lock().unwrap().push((handle, data.to_vec()));
        Ok(data.len())
    }

    fn close(&self, handle: Handle) {
        self.closed.lock().unwrap().push(handle);
        let pipe = self.pipe(handle.raw());
        pipe.steps.lock().unwrap().1 = true;
        pipe.ready.notify_all();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Active,
    Read(Vec<u8>),
    ReadComplete,
    InputShutdown,
    Error(String),
    Inactive,
}

#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn wait_for(&self, pred: impl Fn(&Event) -> bool) -> bool {
        wait_until(WAIT, || self.count(&pred) > 0)
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl ChannelHandler for RecordingHandler {
    fn channel_active(&self) {
        self.push(Event::Active);
    }

    fn channel_read(&self, data: Vec<u8>) {
        self.push(Event::Read(data));
    }

    fn channel_read_complete(&self) {
        self.push(Event::ReadComplete);
    }

    fn input_shutdown(&self) {
        self.push(Event::InputShutdown);
    }

    fn exception_caught(&self, error: ChannelError) {
        self.push(Event::Error(error.to_string()));
    }

    fn channel_inactive(&self) {
        self.push(Event::Inactive);
    }
}

pub struct Fixture {
    pub ctx: Arc<TunnelContext>,
    pub notifier: Arc<RecordingNotifier>,
    pub dir: TempDir,
}

pub fn fixture(transport: Arc<dyn Transport>, config: Config) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let paths: Arc<dyn AppPaths> = Arc::new(TempPaths(dir.path().to_path_buf()));
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = TunnelContext::new(
        transport,
        ConfigStore::with_config(config, paths),
        Arc::clone(&notifier) as Arc<dyn Notifier>,
    );
    Fixture { ctx, notifier, dir }
}

/// Config with millisecond-scale backoff so retry tests run quickly.
pub fn fast_config(initial_ms: u64, max_ms: u64) -> Config {
    let mut config = Config::default();
    config.retry.initial_delay_ms = initial_ms;
    config.retry.max_delay_ms = max_ms;
    config
}

/// Local TCP server that echoes one connection back to itself.
pub fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
    addr
}
