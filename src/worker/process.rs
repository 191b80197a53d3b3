//! Child-process workers connected through framed stdin/stdout pipes.
//!
//! The parent forwards a hub subscription into the child's stdin and
//! decodes the child's stdout back into [`Message`]s. The child logs to
//! stderr, which is inherited. A child is never killed: it exits on its own
//! after the exit sentinel or when its stdin reaches end of stream.

use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::WorkerError;
use crate::broadcast::{
    ChannelError, FrameReader, FramedSource, FramedWriter, Message, MessageSink, MessageSource,
    DEFAULT_MAX_PAYLOAD,
};

/// How long the forwarder waits for input before re-checking the child.
const FORWARD_POLL: Duration = Duration::from_millis(50);

/// Program and arguments used to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The running executable, which carries the worker subcommands.
    pub fn current_exe() -> Result<Self, WorkerError> {
        std::env::current_exe()
            .map(Self::new)
            .map_err(WorkerError::Executable)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }
}

/// A running worker process and the two threads pumping its pipes.
pub struct WorkerProcess {
    name: String,
    pid: u32,
    child: Arc<Mutex<Child>>,
    output_done: Arc<AtomicBool>,
    forwarder: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    /// Starts `command`, feeds it from `source` and hands every message the
    /// child writes to `on_message`.
    pub fn spawn<S, F>(
        name: impl Into<String>,
        command: &WorkerCommand,
        source: S,
        on_message: F,
    ) -> Result<Self, WorkerError>
    where
        S: MessageSource + 'static,
        F: FnMut(Message) + Send + 'static,
    {
        let name = name.into();
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(WorkerError::Spawn)?;
        let stdin = child.stdin.take().ok_or(WorkerError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(WorkerError::Pipe("stdout"))?;
        let pid = child.id();
        tracing::info!(worker = %name, pid, program = %command.program.display(), "Spawned worker process");

        let output_done = Arc::new(AtomicBool::new(false));

        let reader = {
            let done = Arc::clone(&output_done);
            let worker = name.clone();
            thread::Builder::new()
                .name(format!("{name}-out"))
                .spawn(move || read_output(stdout, on_message, &done, &worker))
                .map_err(WorkerError::Spawn)?
        };
        let forwarder = {
            let done = Arc::clone(&output_done);
            let worker = name.clone();
            thread::Builder::new()
                .name(format!("{name}-in"))
                .spawn(move || forward_input(source, FramedWriter::new(stdin), &done, &worker))
                .map_err(WorkerError::Spawn)?
        };

        Ok(Self {
            name,
            pid,
            child: Arc::new(Mutex::new(child)),
            output_done,
            forwarder: Some(forwarder),
            reader: Some(reader),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True until the child has exited.
    pub fn is_alive(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    /// True once the child closed its stdout.
    pub fn output_closed(&self) -> bool {
        self.output_done.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for the child to exit and both pipe threads to
    /// finish. Returns `None` if the child is still running.
    pub fn wait(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, WorkerError> {
        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = self.child.lock().try_wait().map_err(WorkerError::Spawn)? {
                break status;
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(10));
        };

        for handle in [self.reader.take(), self.forwarder.take()].into_iter().flatten() {
            if handle.join().is_err() {
                return Err(WorkerError::Panicked(self.name.clone()));
            }
        }
        tracing::info!(worker = %self.name, pid = self.pid, %status, "Worker process exited");
        Ok(Some(status))
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            tracing::warn!(worker = %self.name, pid = self.pid, "Worker process handle dropped while child is running");
        }
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("output_closed", &self.output_closed())
            .finish()
    }
}

fn forward_input<S: MessageSource>(
    mut source: S,
    mut writer: FramedWriter<ChildStdin>,
    output_done: &AtomicBool,
    worker: &str,
) {
    while !output_done.load(Ordering::Acquire) {
        match source.receive(FORWARD_POLL) {
            Ok(Some(message)) => {
                let exit = message.is_exit();
                if let Err(err) = writer.send(&message) {
                    tracing::warn!(worker, error = %err, "Worker input closed");
                    break;
                }
                if exit {
                    break;
                }
            }
            Ok(None) => {}
            Err(ChannelError::Closed) => break,
            Err(err) => {
                tracing::warn!(worker, error = %err, "Worker input source failed");
                break;
            }
        }
    }
    // Closing stdin is the child's cue to drain and exit.
    if let Err(err) = writer.close() {
        tracing::debug!(worker, error = %err, "Failed to close worker input");
    }
}

fn read_output<F: FnMut(Message)>(
    stdout: ChildStdout,
    mut on_message: F,
    output_done: &AtomicBool,
    worker: &str,
) {
    let mut reader = FrameReader::new(stdout, DEFAULT_MAX_PAYLOAD);
    loop {
        match reader.read_message() {
            Ok(Some(message)) => on_message(message),
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(worker, error = %err, "Failed to decode worker output");
                break;
            }
        }
    }
    output_done.store(true, Ordering::Release);
}

/// Runs a worker loop on the current process's stdin and stdout.
///
/// Used by the worker subcommands of the binary.
pub fn serve_stdio<F>(run: F) -> Result<(), WorkerError>
where
    F: FnOnce(&mut dyn MessageSource, &mut dyn MessageSink),
{
    let mut source =
        FramedSource::spawn(std::io::stdin(), 4, DEFAULT_MAX_PAYLOAD).map_err(WorkerError::Spawn)?;
    let mut sink = FramedWriter::new(std::io::stdout());
    run(&mut source, &mut sink);
    sink.close()?;
    Ok(())
}
