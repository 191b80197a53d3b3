//! Stream recorder: subscribes to a frame topic and appends to a container.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::buffer::FrameBuffer;
use super::container::ContainerWriter;
use super::RecordingError;
use crate::broadcast::{BroadcastHub, ChannelError, DeliveryPolicy, Message, MessageSink, MessageSource};
use crate::worker::{
    FnSink, Isolation, WorkerCommand, WorkerHandle, WorkerPhase, WorkerProcess, WorkerReport,
};

/// Receive poll interval of the recorder loop.
pub const RECORDER_POLL: Duration = Duration::from_millis(100);

/// Default in-memory ceiling before a flush: 250 MB.
pub const DEFAULT_MAX_MEMORY: usize = 250 * 1000 * 1000;

/// Lifecycle of one recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Recording,
    Draining,
    Closed,
}

impl From<WorkerPhase> for RecorderState {
    fn from(phase: WorkerPhase) -> Self {
        match phase {
            WorkerPhase::Idle => RecorderState::Idle,
            WorkerPhase::Running => RecorderState::Recording,
            WorkerPhase::Draining => RecorderState::Draining,
            WorkerPhase::Closed => RecorderState::Closed,
        }
    }
}

/// Parameters of a new recording.
#[derive(Debug, Clone)]
pub struct RecordingRequest {
    pub path: PathBuf,
    pub topic: String,
    pub max_memory_bytes: usize,
    /// Stored in the container header.
    pub metadata: serde_json::Value,
    pub isolation: Isolation,
}

impl RecordingRequest {
    pub fn new(path: impl Into<PathBuf>, topic: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            topic: topic.into(),
            max_memory_bytes: DEFAULT_MAX_MEMORY,
            metadata: serde_json::Value::Null,
            isolation: Isolation::Thread,
        }
    }
}

/// Recorder loop: buffer frames, flush before the memory ceiling, drain on
/// the exit sentinel.
///
/// A report is sent after every flush and at each phase change. An I/O
/// error ends the loop at once with the buffered frames discarded.
pub fn run_recorder(
    source: &mut dyn MessageSource,
    sink: &mut dyn MessageSink,
    mut writer: ContainerWriter,
    max_memory: usize,
) -> WorkerReport {
    let mut buffer = FrameBuffer::new(max_memory);
    let mut report = WorkerReport {
        phase: WorkerPhase::Running,
        bytes_written: writer.bytes_written(),
        ..WorkerReport::default()
    };
    send_report(sink, &report);

    loop {
        let message = match source.receive(RECORDER_POLL) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(ChannelError::Closed) => break,
            Err(err) => {
                tracing::warn!(path = %writer.path().display(), error = %err, "Recorder input failed, draining");
                break;
            }
        };
        let frame = match message {
            Message::Frame(frame) => frame,
            Message::Exit => break,
            _ => {
                report.skipped += 1;
                continue;
            }
        };

        if buffer.needs_flush_before(&frame) {
            if let Err(err) = flush(&mut writer, &mut buffer, &mut report) {
                return fail(sink, report, &writer, err);
            }
            send_report(sink, &report);
        }
        buffer.push(frame);
        report.buffered_bytes = buffer.buffered_bytes() as u64;
        report.peak_buffered_bytes = buffer.peak_bytes() as u64;
    }

    report.phase = WorkerPhase::Draining;
    send_report(sink, &report);
    if let Err(err) = flush(&mut writer, &mut buffer, &mut report) {
        return fail(sink, report, &writer, err);
    }
    let path = writer.path().to_path_buf();
    if let Err(err) = writer.finish() {
        tracing::error!(path = %path.display(), error = %err, "Failed to close recording");
        report.error = Some(err.to_string());
    }
    report.phase = WorkerPhase::Closed;
    send_report(sink, &report);
    report
}

fn send_report(sink: &mut dyn MessageSink, report: &WorkerReport) {
    if let Err(err) = sink.send(&Message::Report(report.clone())) {
        tracing::debug!(error = %err, "Recorder report not delivered");
    }
}

fn flush(
    writer: &mut ContainerWriter,
    buffer: &mut FrameBuffer,
    report: &mut WorkerReport,
) -> Result<(), RecordingError> {
    writer.append_batch(buffer.frames())?;
    report.processed += buffer.len() as u64;
    report.bytes_written = writer.bytes_written();
    report.buffered_bytes = 0;
    buffer.clear();
    Ok(())
}

fn fail(
    sink: &mut dyn MessageSink,
    mut report: WorkerReport,
    writer: &ContainerWriter,
    err: RecordingError,
) -> WorkerReport {
    tracing::error!(path = %writer.path().display(), error = %err, "Recording aborted");
    report.phase = WorkerPhase::Closed;
    report.buffered_bytes = 0;
    report.error = Some(err.to_string());
    send_report(sink, &report);
    report
}

#[derive(Debug)]
struct Session {
    topic: String,
    subscriber: u64,
    report: Arc<Mutex<WorkerReport>>,
    handle: WorkerHandle,
}

impl Session {
    fn state(&self) -> RecorderState {
        let phase = self.report.lock().phase;
        if phase != WorkerPhase::Closed && self.handle.is_finished() {
            // Worker gone without a final report.
            return RecorderState::Closed;
        }
        phase.into()
    }
}

/// Manages recordings, at most one per output path.
#[derive(Debug)]
pub struct StreamRecorder {
    hub: BroadcastHub,
    policy: DeliveryPolicy,
    worker_command: Option<WorkerCommand>,
    sessions: HashMap<PathBuf, Session>,
}

impl StreamRecorder {
    pub fn new(hub: BroadcastHub) -> Self {
        Self {
            hub,
            policy: DeliveryPolicy::default(),
            worker_command: None,
            sessions: HashMap::new(),
        }
    }

    /// Delivery policy of the recorder subscriptions.
    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Executable used for process isolation; defaults to the running one.
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    /// Starts recording `request.topic` into `request.path`.
    ///
    /// The container is created before this returns, so a bad path fails
    /// here rather than in the worker.
    pub fn start(&mut self, request: RecordingRequest) -> Result<(), RecordingError> {
        if let Some(session) = self.sessions.get(&request.path) {
            if session.state() != RecorderState::Closed {
                return Err(RecordingError::AlreadyRecording(request.path));
            }
        }

        let writer = ContainerWriter::create(&request.path, request.metadata.clone())?;
        let mut subscription = self.hub.subscribe(request.topic.clone(), self.policy);
        let subscriber = subscription.id();
        let report = Arc::new(Mutex::new(WorkerReport {
            phase: WorkerPhase::Running,
            bytes_written: writer.bytes_written(),
            ..WorkerReport::default()
        }));
        let name = format!("record-{}", request.topic);
        let shared = Arc::clone(&report);

        let handle = match request.isolation {
            Isolation::Thread => {
                let max_memory = request.max_memory_bytes;
                WorkerHandle::spawn_thread(name, move || {
                    let mut sink = FnSink(|message: &Message| {
                        if let Message::Report(latest) = message {
                            *shared.lock() = latest.clone();
                        }
                    });
                    run_recorder(&mut subscription, &mut sink, writer, max_memory);
                })?
            }
            Isolation::Process => {
                drop(writer);
                let command = match &self.worker_command {
                    Some(command) => command.clone(),
                    None => WorkerCommand::current_exe()?,
                }
                .arg("record-worker")
                .arg("--path")
                .arg(request.path.display().to_string())
                .arg("--max-memory")
                .arg(request.max_memory_bytes.to_string());
                let process = WorkerProcess::spawn(name, &command, subscription, move |message| {
                    if let Message::Report(latest) = message {
                        *shared.lock() = latest;
                    }
                })?;
                WorkerHandle::Process(process)
            }
        };

        tracing::info!(
            path = %request.path.display(),
            topic = %request.topic,
            isolation = ?request.isolation,
            max_memory = request.max_memory_bytes,
            "Recording started"
        );
        self.sessions.insert(
            request.path,
            Session {
                topic: request.topic,
                subscriber,
                report,
                handle,
            },
        );
        Ok(())
    }

    /// Sends the exit sentinel to the recording of `path` and returns.
    ///
    /// Stopping an unknown or finished recording is a no-op.
    pub fn stop(&self, path: &Path) {
        if let Some(session) = self.sessions.get(path) {
            if self.hub.exit_subscriber(&session.topic, session.subscriber) {
                tracing::info!(path = %path.display(), "Stopping recording");
            }
        }
    }

    /// Stops every recording.
    pub fn stop_all(&self) {
        for path in self.sessions.keys() {
            self.stop(path);
        }
    }

    /// Waits up to `timeout` for the recording of `path` to close.
    pub fn wait_closed(&mut self, path: &Path, timeout: Duration) -> Result<bool, RecordingError> {
        let Some(session) = self.sessions.get_mut(path) else {
            return Ok(true);
        };
        let finished = session.handle.wait(timeout)?;
        if finished {
            let mut report = session.report.lock();
            if report.phase != WorkerPhase::Closed {
                report.phase = WorkerPhase::Closed;
                report.error.get_or_insert_with(|| "worker exited without closing".into());
            }
        }
        Ok(finished)
    }

    /// State of the recording of `path`; `Idle` if there is none.
    pub fn state(&self, path: &Path) -> RecorderState {
        self.sessions.get(path).map_or(RecorderState::Idle, Session::state)
    }

    pub fn report(&self, path: &Path) -> Option<WorkerReport> {
        self.sessions.get(path).map(|s| s.report.lock().clone())
    }

    /// True if any recording has not closed yet.
    pub fn is_recording(&self) -> bool {
        self.sessions.values().any(|s| s.state() != RecorderState::Closed)
    }

    /// Output paths of recordings that have not closed yet.
    pub fn active(&self) -> Vec<PathBuf> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.state() != RecorderState::Closed)
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Forgets closed recordings.
    pub fn prune(&mut self) {
        self.sessions.retain(|_, s| s.state() != RecorderState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, PixelFormat};
    use crate::recording::{record_size, ContainerReader};
    use std::time::Instant;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![(seq % 251) as u8; 1000], 100, 10, PixelFormat::Mono8, seq)
    }

    fn lossless() -> DeliveryPolicy {
        DeliveryPolicy::Block {
            capacity: 16,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_records_all_frames_within_memory_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.fsrec");
        let hub = BroadcastHub::new();
        let mut recorder = StreamRecorder::new(hub.clone()).with_policy(lossless());
        let ceiling = record_size(&frame(0)) * 4;

        let mut request = RecordingRequest::new(&path, "cam_free_run");
        request.max_memory_bytes = ceiling;
        request.metadata = serde_json::json!({"camera": "cam"});
        recorder.start(request).unwrap();
        assert_eq!(recorder.state(&path), RecorderState::Recording);

        for seq in 0..50 {
            hub.publish("cam_free_run", Message::Frame(frame(seq)));
        }
        recorder.stop(&path);
        assert!(recorder.wait_closed(&path, Duration::from_secs(5)).unwrap());
        assert_eq!(recorder.state(&path), RecorderState::Closed);

        let report = recorder.report(&path).unwrap();
        assert_eq!(report.processed, 50);
        assert!(report.error.is_none());
        assert!(report.peak_buffered_bytes as usize <= ceiling);
        assert_eq!(report.bytes_written, std::fs::metadata(&path).unwrap().len());

        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.header().metadata["camera"], "cam");
        let sequences: Vec<u64> = reader.map(|f| f.unwrap().sequence()).collect();
        assert_eq!(sequences, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_path_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.fsrec");
        let hub = BroadcastHub::new();
        let mut recorder = StreamRecorder::new(hub);

        recorder.start(RecordingRequest::new(&path, "t")).unwrap();
        assert!(matches!(
            recorder.start(RecordingRequest::new(&path, "t")),
            Err(RecordingError::AlreadyRecording(_))
        ));
        recorder.stop(&path);
        recorder.stop(&path);
        assert!(recorder.wait_closed(&path, Duration::from_secs(2)).unwrap());
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_stop_unknown_path_is_noop() {
        let recorder = StreamRecorder::new(BroadcastHub::new());
        recorder.stop(Path::new("/nowhere.fsrec"));
        assert_eq!(recorder.state(Path::new("/nowhere.fsrec")), RecorderState::Idle);
    }

    #[test]
    fn test_two_recordings_on_one_topic_stop_independently() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.fsrec");
        let b = dir.path().join("b.fsrec");
        let hub = BroadcastHub::new();
        let mut recorder = StreamRecorder::new(hub.clone()).with_policy(lossless());
        recorder.start(RecordingRequest::new(&a, "t")).unwrap();
        recorder.start(RecordingRequest::new(&b, "t")).unwrap();

        hub.publish("t", Message::Frame(frame(0)));
        recorder.stop(&a);
        assert!(recorder.wait_closed(&a, Duration::from_secs(2)).unwrap());
        hub.publish("t", Message::Frame(frame(1)));
        assert_eq!(recorder.state(&b), RecorderState::Recording);
        assert_eq!(recorder.active(), vec![b.clone()]);

        recorder.stop_all();
        assert!(recorder.wait_closed(&b, Duration::from_secs(2)).unwrap());
        assert_eq!(recorder.report(&a).unwrap().processed, 1);
        assert_eq!(recorder.report(&b).unwrap().processed, 2);
        recorder.prune();
        assert_eq!(recorder.state(&a), RecorderState::Idle);
    }

    #[test]
    fn test_loop_drains_on_closed_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eof.fsrec");
        let writer = ContainerWriter::create(&path, serde_json::Value::Null).unwrap();
        let hub = BroadcastHub::new();
        let mut source = hub.subscribe("t", lossless());
        hub.publish("t", Message::Frame(frame(0)));
        hub.publish_exit("t");

        let mut reports = Vec::new();
        let started = Instant::now();
        let last = run_recorder(
            &mut source,
            &mut FnSink(|m: &Message| {
                if let Message::Report(r) = m {
                    reports.push(r.phase);
                }
            }),
            writer,
            DEFAULT_MAX_MEMORY,
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(last.processed, 1);
        assert_eq!(
            reports,
            vec![WorkerPhase::Running, WorkerPhase::Draining, WorkerPhase::Closed]
        );
    }
}
