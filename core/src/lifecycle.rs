//! Tunnel lifecycle management.
//! Drives start-up, retry with backoff, and shutdown of the tunnel, and keeps
//! the single authoritative answer to "is the tunnel usable right now".

use std::fmt;
use std::iter;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::context::TunnelContext;
use crate::error::TunnelError;
use crate::lock;
use crate::transport::EngineState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Stopped,
    Starting,
    Ready,
    /// Terminal failure of the one-shot boot path, with the reason.
    Failed(String),
}

impl TunnelState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2)
    }
}

impl RetrySchedule {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Delay following `current`. Never shrinks and never exceeds `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(self.max_delay)
    }

    /// Delays of one uninterrupted retry run, starting from `initial_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let schedule = *self;
        let first = schedule.initial_delay.min(schedule.max_delay);
        iter::successors(Some(first), move |d| Some(schedule.next_delay(*d)))
    }
}

/// Cooperative cancellation shared between the controller and its worker.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (cancelled, wakeup) = &*self.inner;
        *lock(cancelled) = true;
        wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleeps for `duration` unless cancelled first.
    /// Returns `true` if the whole duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (cancelled, wakeup) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut guard = lock(cancelled);
        loop {
            if *guard {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (next, _) = wakeup
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }
    }
}

/// Result of a [`LifecycleController::start`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyConnected,
    InProgress,
    Started,
}

/// The live retry worker. At most one exists at a time.
struct RunController {
    id: u64,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

enum RunPhase {
    Idle,
    /// The one-shot boot attempt is running on the caller's thread.
    Booting,
    Running(RunController),
    /// `halt` is joining the old worker and tearing the tunnel down.
    Stopping,
}

/// Slot for the single retry worker. `Booting` and `Stopping` keep the slot
/// occupied while a blocking transition runs outside the lock.
struct RunSlot {
    phase: Mutex<RunPhase>,
    settled: Condvar,
}

impl RunSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            phase: Mutex::new(RunPhase::Idle),
            settled: Condvar::new(),
        })
    }

    /// Lock the phase, waiting while `busy` holds for it.
    fn lock_when(&self, busy: impl Fn(&RunPhase) -> bool) -> MutexGuard<'_, RunPhase> {
        let mut phase = lock(&self.phase);
        while busy(&*phase) {
            phase = self
                .settled
                .wait(phase)
                .unwrap_or_else(PoisonError::into_inner);
        }
        phase
    }

    fn settle(&self) {
        *lock(&self.phase) = RunPhase::Idle;
        self.settled.notify_all();
    }
}

/// Owns the tunnel's on/off state and the single retry worker.
pub struct LifecycleController {
    ctx: Arc<TunnelContext>,
    run: Arc<RunSlot>,
    next_run_id: AtomicU64,
}

impl LifecycleController {
    pub fn new(ctx: Arc<TunnelContext>) -> Self {
        Self {
            ctx,
            run: RunSlot::new(),
            next_run_id: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> &Arc<TunnelContext> {
        &self.ctx
    }

    pub fn state(&self) -> TunnelState {
        self.ctx.state()
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.ctx.failure_reason()
    }

    pub fn is_ready(&self) -> bool {
        self.ctx.is_tunnel_ready()
    }

    /// Whether a retry run is currently alive.
    pub fn is_connecting(&self) -> bool {
        matches!(
            *lock(&self.run.phase),
            RunPhase::Running(_) | RunPhase::Stopping
        )
    }

    /// One-shot startup used when the process boots. Does not retry: a failure
    /// leaves the tunnel `Failed` until the user calls [`start`](Self::start).
    /// Refused while a retry run is active.
    pub fn boot(&self) -> Result<TunnelState, TunnelError> {
        {
            let mut phase = self
                .run
                .lock_when(|p| matches!(p, RunPhase::Booting | RunPhase::Stopping));
            if let RunPhase::Running(_) = *phase {
                warn!("Boot requested while a connect run is active, ignoring");
                return Err(TunnelError::ProtocolMisuse(
                    "boot while a connect run is active".to_string(),
                ));
            }
            *phase = RunPhase::Booting;
        }

        let result = self.boot_once();
        self.run.settle();
        result
    }

    fn boot_once(&self) -> Result<TunnelState, TunnelError> {
        info!("Tunnel client initializing...");

        let version = match self.ctx.transport().probe() {
            Ok(version) => version,
            Err(e) => {
                let reason = format!("Failed to load tunnel engine: {e}");
                error!("{reason}");
                self.fail(reason.clone());
                return Err(TunnelError::TransportUnavailable(reason));
            }
        };
        info!("Tunnel engine loaded, version {version}");

        if !self.ctx.config().is_enabled() {
            info!("Tunnel is disabled in config, skipping tunnel initialization");
            return Ok(self.ctx.state());
        }

        let credentials = self.ctx.credentials_path();
        let timeout = self.ctx.config().snapshot().connection.start_timeout();
        info!("Starting tunnel with credentials from {:?}", credentials);
        self.ctx.clear_failure();
        self.ctx.set_state(TunnelState::Starting);

        match self.ctx.transport().start_tunnel(&credentials, timeout) {
            Ok(EngineState::Ready) => {
                self.ctx.set_state(TunnelState::Ready);
                info!("Tunnel started successfully");
                Ok(TunnelState::Ready)
            }
            Ok(state) => {
                let reason = format!("Tunnel failed to start, state: {state}");
                error!("{reason}");
                self.fail(reason.clone());
                Err(TunnelError::ConnectFailed(reason))
            }
            Err(e) => {
                error!("Failed to start tunnel: {e}");
                self.fail(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Start the tunnel in the background, retrying until it comes up, the
    /// tunnel is disabled, or [`stop`](Self::stop) is called. Returns at once.
    pub fn start(&self) -> Result<StartOutcome, TunnelError> {
        // A stop in flight finishes before a new run may begin.
        let mut phase = self.run.lock_when(|p| matches!(p, RunPhase::Stopping));

        if self.ctx.state().is_ready() {
            info!("Tunnel already running");
            self.ctx
                .notifier()
                .info("Tunnel Already Connected", "Tunnel is already running");
            return Ok(StartOutcome::AlreadyConnected);
        }

        if matches!(*phase, RunPhase::Running(_) | RunPhase::Booting) {
            info!("Tunnel connection already in progress");
            self.ctx
                .notifier()
                .info("Tunnel Connecting", "Connection attempt in progress...");
            return Ok(StartOutcome::InProgress);
        }

        self.ctx.clear_failure();
        self.ctx
            .notifier()
            .info("Tunnel Connecting", "Starting tunnel...");

        let config = self.ctx.config().snapshot();
        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelToken::new();
        let worker = RetryWorker {
            id,
            ctx: Arc::clone(&self.ctx),
            run: Arc::clone(&self.run),
            cancel: cancel.clone(),
            schedule: config.retry.schedule(),
            start_timeout: config.connection.start_timeout(),
            credentials: self.ctx.credentials_path(),
        };

        let thread = thread::Builder::new()
            .name("tunnel-connect".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                let reason = format!("Failed to spawn connect worker: {e}");
                error!("{reason}");
                self.ctx
                    .notifier()
                    .error("Tunnel Connection Failed", &reason);
                TunnelError::Io(reason)
            })?;

        debug!("Spawned tunnel connect worker {id}");
        *phase = RunPhase::Running(RunController {
            id,
            cancel,
            thread: Some(thread),
        });
        Ok(StartOutcome::Started)
    }

    /// Stop the tunnel with user feedback.
    pub fn stop(&self) {
        self.halt();
        self.ctx
            .notifier()
            .info("Tunnel Disconnected", "Tunnel has been stopped");
    }

    /// Flip the persisted enabled flag and start or stop to match.
    /// Returns the new enabled value.
    pub fn toggle(&self) -> bool {
        let enabled = self.ctx.config().toggle();
        info!("Tunnel toggled {}", if enabled { "on" } else { "off" });
        if enabled {
            if let Err(e) = self.start() {
                error!("Failed to start tunnel after toggle: {e}");
            }
        } else {
            self.stop();
        }
        enabled
    }

    /// Stop without user feedback, for process exit.
    pub fn shutdown(&self) {
        self.halt();
    }

    /// Cancel and join the worker, then shut the engine down. The slot stays
    /// `Stopping` throughout, so a concurrent `start` waits instead of
    /// spawning a second worker.
    fn halt(&self) {
        let controller = {
            let mut phase = self
                .run
                .lock_when(|p| matches!(p, RunPhase::Booting | RunPhase::Stopping));
            match mem::replace(&mut *phase, RunPhase::Stopping) {
                RunPhase::Running(controller) => Some(controller),
                _ => None,
            }
        };
        if let Some(mut controller) = controller {
            info!("Cancelling tunnel connect worker {}", controller.id);
            controller.cancel.cancel();
            if let Some(thread) = controller.thread.take() {
                if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                    error!("Tunnel connect worker panicked");
                }
            }
        }

        let was_ready = self.ctx.state().is_ready();
        if was_ready || self.ctx.transport().tunnel_state() != EngineState::Stopped {
            info!("Shutting down tunnel...");
            self.ctx.transport().shutdown_tunnel();
            info!("Tunnel shut down");
        }
        self.ctx.reset();
        self.run.settle();
    }

    fn fail(&self, reason: String) {
        self.ctx.set_state(TunnelState::Failed(reason.clone()));
        self.ctx
            .notifier()
            .error("Tunnel Connection Failed", &reason);
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if let RunPhase::Running(controller) = &*lock(&self.run.phase) {
            controller.cancel.cancel();
        }
    }
}

struct RetryWorker {
    id: u64,
    ctx: Arc<TunnelContext>,
    run: Arc<RunSlot>,
    cancel: CancelToken,
    schedule: RetrySchedule,
    start_timeout: Duration,
    credentials: PathBuf,
}

impl RetryWorker {
    fn run(self) {
        if !self.attempt_until_ready() {
            self.ctx.settle_aborted();
        }

        let mut phase = lock(&self.run.phase);
        if matches!(&*phase, RunPhase::Running(c) if c.id == self.id) {
            *phase = RunPhase::Idle;
            self.run.settled.notify_all();
        }
        debug!("Tunnel connect worker {} exited", self.id);
    }

    /// Returns `true` once the tunnel is up, `false` when the run was abandoned.
    fn attempt_until_ready(&self) -> bool {
        let mut delays = self.schedule.delays();
        let mut attempt: u32 = 0;

        loop {
            if self.should_abort() {
                return false;
            }

            attempt = attempt.saturating_add(1);
            self.ctx.set_state(TunnelState::Starting);
            info!("Starting tunnel (attempt {attempt})");

            let reason = match self
                .ctx
                .transport()
                .start_tunnel(&self.credentials, self.start_timeout)
            {
                Ok(EngineState::Ready) => {
                    if self.ctx.mark_ready_unless(|| self.cancel.is_cancelled()) {
                        info!("Tunnel started successfully");
                        self.ctx
                            .notifier()
                            .info("Tunnel Connected", "Tunnel is now active");
                        return true;
                    }
                    info!("Tunnel came up after cancellation, leaving it to shutdown");
                    return false;
                }
                Ok(state) => {
                    let reason = format!("Tunnel state: {state}");
                    warn!("Tunnel not ready: {reason} (attempt {attempt})");
                    reason
                }
                Err(e) => {
                    warn!("Failed to start tunnel (attempt {attempt}): {e}");
                    e.to_string()
                }
            };
            self.ctx.record_failure(reason);

            if self.should_abort() {
                return false;
            }

            let delay = delays.next().unwrap_or(self.schedule.max_delay);
            self.ctx.notifier().info(
                "Tunnel Retrying",
                &format!("Next attempt in {}...", format_delay(delay)),
            );

            if !self.cancel.sleep(delay) {
                info!("Retry sleep interrupted");
                return false;
            }
        }
    }

    fn should_abort(&self) -> bool {
        if !self.ctx.config().is_enabled() {
            info!("Tunnel disabled during connection, aborting");
            return true;
        }
        if self.cancel.is_cancelled() {
            info!("Tunnel connection cancelled");
            return true;
        }
        false
    }
}

/// Whole seconds print as `4s`, anything finer as `250ms`.
pub fn format_delay(delay: Duration) -> String {
    let millis = delay.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}
