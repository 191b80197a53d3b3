//! Messages carried by the broadcast hub and its cross-process channels.

use serde::{Deserialize, Serialize};

use crate::capture::Frame;
use crate::localization::LocationSet;
use crate::worker::WorkerReport;

/// Suffix of the topic a camera publishes its free-run frames on.
pub const FREE_RUN_SUFFIX: &str = "_free_run";

/// Suffix appended to a frame topic for localization results.
pub const LOCATIONS_SUFFIX: &str = "_locations";

/// Topic carrying the free-run frames of `camera_id`.
pub fn free_run_topic(camera_id: &str) -> String {
    format!("{camera_id}{FREE_RUN_SUFFIX}")
}

/// Topic carrying localization results derived from `topic`.
pub fn locations_topic(topic: &str) -> String {
    format!("{topic}{LOCATIONS_SUFFIX}")
}

/// A broadcast payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A captured frame.
    Frame(Frame),
    /// Particle positions computed for one frame.
    Locations(LocationSet),
    /// Progress of an isolated worker, sent back to its owner.
    Report(WorkerReport),
    /// Sentinel: receivers stop their loop and release the subscription.
    Exit,
}

impl Message {
    /// Returns true for the exit sentinel.
    #[inline]
    pub fn is_exit(&self) -> bool {
        matches!(self, Message::Exit)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Frame(_) => "frame",
            Message::Locations(_) => "locations",
            Message::Report(_) => "report",
            Message::Exit => "exit",
        }
    }

    /// Returns the frame, if this message carries one.
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Message::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        let topic = free_run_topic("microscope");
        assert_eq!(topic, "microscope_free_run");
        assert_eq!(locations_topic(&topic), "microscope_free_run_locations");
    }
}
