//! Background localization of the newest frame on a topic.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::locate::{CentroidLocator, LocateError, LocateParams, LocationSet, Locator};
use crate::broadcast::{
    locations_topic, BroadcastHub, ChannelError, DeliveryPolicy, HubSink, Message, MessageSink,
    MessageSource,
};
use crate::worker::{
    Isolation, WorkerCommand, WorkerError, WorkerHandle, WorkerPhase, WorkerProcess,
    WorkerReport,
};

/// Receive poll interval of the worker loop.
pub const LOCATE_POLL: Duration = Duration::from_millis(50);

/// Localization keeps at most this many frames queued; older ones are
/// evicted so results always refer to a recent frame.
pub const LOCATE_QUEUE: usize = 2;

/// Errors raised when starting or stopping a localization worker.
#[derive(Debug, thiserror::Error)]
pub enum LocalizationError {
    #[error(transparent)]
    Locate(#[from] LocateError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Localization loop: locate the newest frame, publish its locations.
///
/// Frames queued behind a newer one are skipped. Returns the final report
/// after the exit sentinel or a closed source.
pub fn run_locator(
    source: &mut dyn MessageSource,
    sink: &mut dyn MessageSink,
    locator: &dyn Locator,
    params: &LocateParams,
) -> WorkerReport {
    let mut report = WorkerReport {
        phase: WorkerPhase::Running,
        ..WorkerReport::default()
    };

    'receive: loop {
        let frame = match source.receive(LOCATE_POLL) {
            Ok(Some(Message::Frame(frame))) => frame,
            Ok(Some(Message::Exit)) => break,
            Ok(Some(_)) => {
                report.skipped += 1;
                continue;
            }
            Ok(None) => continue,
            Err(ChannelError::Closed) => break,
            Err(err) => {
                report.error = Some(err.to_string());
                break;
            }
        };

        let mut latest = frame;
        let mut exit_after = false;
        loop {
            match source.try_receive() {
                Ok(Some(Message::Frame(newer))) => {
                    report.skipped += 1;
                    latest = newer;
                }
                Ok(Some(Message::Exit)) | Err(ChannelError::Closed) => {
                    exit_after = true;
                    break;
                }
                Ok(Some(_)) => report.skipped += 1,
                Ok(None) => break,
                Err(err) => {
                    report.error = Some(err.to_string());
                    exit_after = true;
                    break;
                }
            }
        }

        match locator.locate(&latest, params) {
            Ok(locations) => {
                tracing::debug!(sequence = latest.sequence(), found = locations.len(), "Located particles");
                let set = LocationSet {
                    sequence: latest.sequence(),
                    captured_at: latest.captured_at(),
                    locations,
                };
                report.processed += 1;
                if let Err(err) = sink.send(&Message::Locations(set)) {
                    tracing::warn!(error = %err, "Localization output closed");
                    report.error = Some(err.to_string());
                    break 'receive;
                }
            }
            Err(err) => {
                report.error = Some(err.to_string());
                break 'receive;
            }
        }

        if exit_after {
            break;
        }
    }

    report.phase = WorkerPhase::Closed;
    if let Err(err) = sink.send(&Message::Report(report.clone())) {
        tracing::debug!(error = %err, "Could not deliver final localization report");
    }
    report
}

/// A running localization stage attached to one frame topic.
#[derive(Debug)]
pub struct LocalizationWorker {
    hub: BroadcastHub,
    topic: String,
    output_topic: String,
    subscriber: u64,
    report: Arc<Mutex<WorkerReport>>,
    handle: WorkerHandle,
}

impl LocalizationWorker {
    /// Starts locating frames from `topic`.
    ///
    /// Process isolation re-launches the running executable.
    pub fn start(
        hub: &BroadcastHub,
        topic: &str,
        params: LocateParams,
        isolation: Isolation,
    ) -> Result<Self, LocalizationError> {
        match isolation {
            Isolation::Thread => Self::start_thread(hub, topic, params, Box::new(CentroidLocator)),
            Isolation::Process => {
                Self::start_process(hub, topic, params, WorkerCommand::current_exe()?)
            }
        }
    }

    /// Runs `locator` on a dedicated thread.
    pub fn start_thread(
        hub: &BroadcastHub,
        topic: &str,
        params: LocateParams,
        locator: Box<dyn Locator>,
    ) -> Result<Self, LocalizationError> {
        params.validate()?;
        let mut subscription = hub.subscribe(topic, DeliveryPolicy::DropOldest { capacity: LOCATE_QUEUE });
        let subscriber = subscription.id();
        let output_topic = locations_topic(topic);
        let report = Arc::new(Mutex::new(WorkerReport {
            phase: WorkerPhase::Running,
            ..WorkerReport::default()
        }));

        let mut sink = HubSink::new(hub.clone(), output_topic.clone());
        let shared = Arc::clone(&report);
        let handle = WorkerHandle::spawn_thread(format!("locate-{topic}"), move || {
            let last = run_locator(&mut subscription, &mut sink, locator.as_ref(), &params);
            *shared.lock() = last;
        })?;

        tracing::info!(topic, output = %output_topic, "Started localization worker");
        Ok(Self {
            hub: hub.clone(),
            topic: topic.to_string(),
            output_topic,
            subscriber,
            report,
            handle,
        })
    }

    /// Runs the `locate-worker` subcommand of `command` as a child process.
    pub fn start_process(
        hub: &BroadcastHub,
        topic: &str,
        params: LocateParams,
        command: WorkerCommand,
    ) -> Result<Self, LocalizationError> {
        params.validate()?;
        let mut command = command
            .arg("locate-worker")
            .arg("--diameter")
            .arg(params.diameter.to_string())
            .arg("--min-mass")
            .arg(params.min_mass.to_string())
            .arg("--threshold")
            .arg(params.threshold.to_string());
        if let Some(max) = params.max_features {
            command = command.arg("--max-features").arg(max.to_string());
        }

        let subscription = hub.subscribe(topic, DeliveryPolicy::DropOldest { capacity: LOCATE_QUEUE });
        let subscriber = subscription.id();
        let output_topic = locations_topic(topic);
        let report = Arc::new(Mutex::new(WorkerReport {
            phase: WorkerPhase::Running,
            ..WorkerReport::default()
        }));

        let shared = Arc::clone(&report);
        let results = hub.clone();
        let publish_to = output_topic.clone();
        let process = WorkerProcess::spawn(format!("locate-{topic}"), &command, subscription, move |message| match message {
            Message::Report(last) => *shared.lock() = last,
            other => {
                results.publish(&publish_to, other);
            }
        })?;

        tracing::info!(topic, output = %output_topic, pid = process.pid(), "Started localization process");
        Ok(Self {
            hub: hub.clone(),
            topic: topic.to_string(),
            output_topic,
            subscriber,
            report,
            handle: WorkerHandle::Process(process),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Topic the [`Message::Locations`] results are published on.
    pub fn output_topic(&self) -> &str {
        &self.output_topic
    }

    pub fn isolation(&self) -> Isolation {
        self.handle.isolation()
    }

    pub fn report(&self) -> WorkerReport {
        self.report.lock().clone()
    }

    /// True until the worker loop has exited.
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Sends the exit sentinel to this worker. Returns immediately.
    pub fn stop(&self) {
        if self.hub.exit_subscriber(&self.topic, self.subscriber) {
            tracing::info!(topic = %self.topic, "Stopping localization worker");
        }
    }

    /// Waits up to `timeout` for the worker to exit after [`stop`](Self::stop).
    pub fn wait_stopped(&mut self, timeout: Duration) -> Result<bool, LocalizationError> {
        let stopped = self.handle.wait(timeout)?;
        if stopped {
            let mut report = self.report.lock();
            report.phase = WorkerPhase::Closed;
            tracing::info!(
                topic = %self.topic,
                processed = report.processed,
                skipped = report.skipped,
                "Localization worker stopped"
            );
        }
        Ok(stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, PixelFormat};
    use crate::worker::FnSink;
    use std::time::Instant;

    fn spot_frame(seq: u64) -> Frame {
        let (w, h) = (21u32, 21u32);
        let mut data = vec![0u8; (w * h) as usize];
        data[(10 * w + 10) as usize] = 255;
        for (dx, dy) in [(-1i32, 0i32), (1, 0), (0, -1), (0, 1)] {
            data[((10 + dy) as u32 * w + (10 + dx) as u32) as usize] = 100;
        }
        Frame::new(data, w, h, PixelFormat::Mono8, seq)
    }

    #[test]
    fn test_worker_publishes_locations_for_latest_frames() {
        let hub = BroadcastHub::new();
        let mut worker = LocalizationWorker::start(&hub, "cam_free_run", LocateParams::new(3), Isolation::Thread).unwrap();
        let results = hub.subscribe(worker.output_topic(), DeliveryPolicy::default());

        for seq in 0..5 {
            hub.publish("cam_free_run", Message::Frame(spot_frame(seq)));
            std::thread::sleep(Duration::from_millis(5));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut last_sequence = None;
        while Instant::now() < deadline && last_sequence != Some(4) {
            if let Some(Message::Locations(set)) = results.recv_timeout(Duration::from_millis(50)).unwrap() {
                assert_eq!(set.len(), 1);
                assert!((set.locations[0].x - 10.0).abs() < 1e-9);
                last_sequence = Some(set.sequence);
            }
        }
        assert_eq!(last_sequence, Some(4));

        worker.stop();
        assert!(worker.wait_stopped(Duration::from_secs(1)).unwrap());
        assert!(!worker.is_alive());
        let report = worker.report();
        assert!(report.is_closed());
        assert!(report.processed >= 1);
        assert!(report.processed + report.skipped <= 5);
    }

    #[test]
    fn test_loop_skips_stale_frames() {
        let hub = BroadcastHub::new();
        let mut source = hub.subscribe("t", DeliveryPolicy::Block {
            capacity: 16,
            timeout: Duration::from_millis(10),
        });
        for seq in 0..4 {
            hub.publish("t", Message::Frame(spot_frame(seq)));
        }
        hub.publish_exit("t");

        let mut outputs = Vec::new();
        let report = run_locator(
            &mut source,
            &mut FnSink(|m: &Message| outputs.push(m.clone())),
            &CentroidLocator,
            &LocateParams::new(3),
        );
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 3);
        assert!(matches!(&outputs[0], Message::Locations(set) if set.sequence == 3));
        assert!(matches!(&outputs[1], Message::Report(r) if r.is_closed()));
    }

    #[test]
    fn test_stopping_one_worker_leaves_other_subscribers() {
        let hub = BroadcastHub::new();
        let other = hub.subscribe("t", DeliveryPolicy::default());
        let mut worker = LocalizationWorker::start(&hub, "t", LocateParams::new(3), Isolation::Thread).unwrap();
        worker.stop();
        assert!(worker.wait_stopped(Duration::from_secs(1)).unwrap());
        assert!(other.is_alive());
        assert_eq!(hub.subscriber_count("t"), 1);
    }

    #[test]
    fn test_invalid_diameter_rejected_before_start() {
        let hub = BroadcastHub::new();
        let result = LocalizationWorker::start(&hub, "t", LocateParams::new(4), Isolation::Thread);
        assert!(matches!(result, Err(LocalizationError::Locate(LocateError::InvalidDiameter(4)))));
        assert_eq!(hub.subscriber_count("t"), 0);
    }
}
