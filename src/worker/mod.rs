//! Isolated workers shared by the recorder and the localization stage.
//!
//! A worker loop is written once against [`MessageSource`] and
//! [`MessageSink`] and then run either on a dedicated thread or in a child
//! process of the `fiberscope` binary. Process isolation keeps heavy I/O or
//! numerics from stalling the acquisition threads.

mod process;
mod report;

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broadcast::{ChannelError, Message, MessageSink, MessageSource};

pub use process::{serve_stdio, WorkerCommand, WorkerProcess};
pub use report::{WorkerPhase, WorkerReport};

/// Where a worker loop runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    #[default]
    Thread,
    Process,
}

/// Errors raised while starting or supervising a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to locate worker executable: {0}")]
    Executable(#[source] std::io::Error),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker {0} pipe unavailable")]
    Pipe(&'static str),
    #[error("worker {0} panicked")]
    Panicked(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Adapts a closure into a [`MessageSink`].
pub struct FnSink<F>(pub F);

impl<F> MessageSink for FnSink<F>
where
    F: FnMut(&Message) + Send,
{
    fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
        (self.0)(message);
        Ok(())
    }
}

/// Handle on a worker running on a thread or in a child process.
#[derive(Debug)]
pub enum WorkerHandle {
    Thread { name: String, handle: Option<JoinHandle<()>> },
    Process(WorkerProcess),
}

impl WorkerHandle {
    /// Runs `body` on a named thread.
    pub fn spawn_thread<F>(name: impl Into<String>, body: F) -> Result<Self, WorkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(WorkerError::Spawn)?;
        Ok(WorkerHandle::Thread {
            name,
            handle: Some(handle),
        })
    }

    pub fn isolation(&self) -> Isolation {
        match self {
            WorkerHandle::Thread { .. } => Isolation::Thread,
            WorkerHandle::Process(_) => Isolation::Process,
        }
    }

    /// True once the worker has exited.
    pub fn is_finished(&self) -> bool {
        match self {
            WorkerHandle::Thread { handle, .. } => handle.as_ref().map_or(true, JoinHandle::is_finished),
            WorkerHandle::Process(process) => !process.is_alive() && process.output_closed(),
        }
    }

    /// Waits up to `timeout` for the worker to exit. Returns false on timeout.
    pub fn wait(&mut self, timeout: Duration) -> Result<bool, WorkerError> {
        match self {
            WorkerHandle::Thread { name, handle } => {
                let deadline = Instant::now() + timeout;
                while handle.as_ref().is_some_and(|h| !h.is_finished()) {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                match handle.take() {
                    Some(h) => h.join().map_err(|_| WorkerError::Panicked(name.clone())),
                    None => Ok(()),
                }?;
                Ok(true)
            }
            WorkerHandle::Process(process) => Ok(process.wait(timeout)?.is_some()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fn_sink_forwards() {
        let count = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&count);
        let mut sink = FnSink(move |_: &Message| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        sink.send(&Message::Exit).unwrap();
        sink.send(&Message::Exit).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_thread_handle_wait() {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let mut handle = WorkerHandle::spawn_thread("test-worker", move || {
            let _ = rx.recv();
        })
        .unwrap();
        assert_eq!(handle.isolation(), Isolation::Thread);
        assert!(!handle.wait(Duration::from_millis(20)).unwrap());
        drop(tx);
        assert!(handle.wait(Duration::from_secs(2)).unwrap());
        assert!(handle.is_finished());
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let hub = crate::broadcast::BroadcastHub::new();
        let sub = hub.subscribe("t", crate::broadcast::DeliveryPolicy::default());
        let command = WorkerCommand::new("/nonexistent/fiberscope-worker");
        let result = WorkerProcess::spawn("missing", &command, sub, |_| {});
        assert!(matches!(result, Err(WorkerError::Spawn(_))));
    }
}
