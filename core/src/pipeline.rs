//! Single-threaded delivery pipeline.
//!
//! Every observable effect on a channel runs on its event loop thread. Worker
//! threads (connect, reader) never call a [`ChannelHandler`] directly; they
//! post tasks through an [`EventLoopHandle`].

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use log::{debug, error};

use crate::error::ChannelError;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Stop,
}

/// Owns the delivery thread. Dropping it stops the loop after the tasks
/// already queued have run.
pub struct EventLoop {
    handle: EventLoopHandle,
    thread: Option<JoinHandle<()>>,
}

/// Cheap, cloneable way to post work onto an [`EventLoop`].
#[derive(Clone)]
pub struct EventLoopHandle {
    tx: Sender<Message>,
    thread_id: ThreadId,
}

impl EventLoop {
    pub fn spawn(name: &str) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Message>();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(rx))?;
        let handle = EventLoopHandle {
            tx,
            thread_id: thread.thread().id(),
        };
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    /// Stop the loop once the queued tasks have run, and wait for it.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.handle.tx.send(Message::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                error!("Event loop thread panicked");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run_loop(rx: Receiver<Message>) {
    debug!("Event loop started");
    for message in rx {
        match message {
            Message::Run(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!("Event loop task panicked");
                }
            }
            Message::Stop => break,
        }
    }
    debug!("Event loop stopped");
}

impl EventLoopHandle {
    /// Queue `task` to run on the loop thread. Returns `false` if the loop is gone.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Message::Run(Box::new(task))).is_ok()
    }

    pub fn in_event_loop(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `f` on the loop thread and wait for its result.
    /// Runs inline when already on the loop thread.
    pub fn call<R: Send + 'static>(&self, f: impl FnOnce() -> R + Send + 'static) -> Option<R> {
        if self.in_event_loop() {
            return Some(f());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        if !self.execute(move || {
            let _ = tx.send(f());
        }) {
            return None;
        }
        rx.recv().ok()
    }
}

/// Callbacks a channel fires into the embedding pipeline.
///
/// Always invoked on the channel's event loop thread, one at a time.
pub trait ChannelHandler: Send + Sync {
    fn channel_active(&self) {}

    /// One delivered buffer, in arrival order.
    fn channel_read(&self, data: Vec<u8>);

    fn channel_read_complete(&self) {}

    /// The remote side finished sending.
    fn input_shutdown(&self) {}

    fn exception_caught(&self, error: ChannelError);

    fn channel_inactive(&self) {}
}

/// One unit queued for writing.
///
/// Payloads are resolved into this type before they reach the bridge; a
/// `Foreign` unit marks a message kind the bridge cannot carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Bytes(Vec<u8>),
    Foreign(&'static str),
}

impl From<Vec<u8>> for Outbound {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for Outbound {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Self::Bytes(text.as_bytes().to_vec())
    }
}

/// Ordered queue of pending outbound units for one channel.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    queue: VecDeque<Outbound>,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unit: impl Into<Outbound>) {
        self.queue.push_back(unit.into());
    }

    pub fn current(&self) -> Option<&Outbound> {
        self.queue.front()
    }

    pub(crate) fn pop(&mut self) -> Option<Outbound> {
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Into<Outbound>> FromIterator<T> for OutboundBuffer {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            queue: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Completing side of a connect attempt. Consumed on completion, so a
/// result is delivered at most once.
pub struct ConnectPromise {
    tx: SyncSender<Result<(), ChannelError>>,
}

/// Waiting side of a connect attempt.
pub struct ConnectFuture {
    rx: Receiver<Result<(), ChannelError>>,
}

pub fn connect_promise() -> (ConnectPromise, ConnectFuture) {
    let (tx, rx) = mpsc::sync_channel(1);
    (ConnectPromise { tx }, ConnectFuture { rx })
}

impl ConnectPromise {
    pub fn complete(self, result: Result<(), ChannelError>) {
        let _ = self.tx.send(result);
    }
}

impl ConnectFuture {
    /// Block until the attempt completes.
    pub fn wait(self) -> Result<(), ChannelError> {
        self.rx.recv().unwrap_or(Err(ChannelError::Abandoned))
    }

    /// Block for at most `timeout`. `None` means the attempt is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), ChannelError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(ChannelError::Abandoned)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn tasks_run_in_order_on_one_thread() {
        let event_loop = EventLoop::spawn("test-loop").unwrap();
        let handle = event_loop.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            let probe = handle.clone();
            assert!(handle.execute(move || {
                seen.lock().unwrap().push((i, probe.in_event_loop()));
            }));
        }
        assert_eq!(handle.call(|| ()), Some(()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.iter().enumerate().all(|(i, (n, on_loop))| i == *n && *on_loop));
        assert!(!handle.in_event_loop());
    }

    #[test]
    fn panicking_task_does_not_stop_the_loop() {
        let event_loop = EventLoop::spawn("test-loop").unwrap();
        let handle = event_loop.handle();
        handle.execute(|| panic!("boom"));
        assert_eq!(handle.call(|| 7), Some(7));
    }

    #[test]
    fn execute_fails_after_shutdown() {
        let event_loop = EventLoop::spawn("test-loop").unwrap();
        let handle = event_loop.handle();
        event_loop.shutdown();
        assert!(!handle.execute(|| ()));
        assert_eq!(handle.call(|| 1), None);
    }

    #[test]
    fn promise_completes_once() {
        let (promise, future) = connect_promise();
        assert!(future.wait_timeout(Duration::from_millis(10)).is_none());
        promise.complete(Err(ChannelError::Closed));
        assert!(matches!(future.wait(), Err(ChannelError::Closed)));
    }

    #[test]
    fn dropped_promise_reports_abandoned() {
        let (promise, future) = connect_promise();
        drop(promise);
        assert!(matches!(future.wait(), Err(ChannelError::Abandoned)));
    }

    #[test]
    fn outbound_buffer_keeps_order() {
        let mut buffer: OutboundBuffer = vec!["a", "", "b"].into_iter().collect();
        buffer.push(Outbound::Foreign("FileRegion"));
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.current(), Some(&Outbound::Bytes(b"a".to_vec())));
        assert_eq!(buffer.pop(), Some(Outbound::Bytes(b"a".to_vec())));
        assert_eq!(buffer.pop(), Some(Outbound::Bytes(Vec::new())));
    }
}
