//! Recording of a frame stream to disk.
//!
//! A recording is an append-only container: a JSON header with the camera
//! metadata followed by one fixed-header record per frame. Frames are
//! batched in memory up to a configurable ceiling and written in one
//! synced append per batch, so a crash loses at most the pending batch.

mod buffer;
mod container;
mod naming;
mod recorder;

use std::path::PathBuf;

use thiserror::Error;

use crate::worker::WorkerError;

pub use buffer::FrameBuffer;
pub use container::{
    record_size, ContainerHeader, ContainerReader, ContainerWriter, CONTAINER_MAGIC, CONTAINER_VERSION,
    RECORD_HEADER_SIZE, RECORD_MAGIC,
};
pub use naming::{dated_folder, next_free_path};
pub use recorder::{
    run_recorder, RecorderState, RecordingRequest, StreamRecorder, DEFAULT_MAX_MEMORY, RECORDER_POLL,
};

/// Errors raised while recording or reading recordings.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("already recording to {0}")]
    AlreadyRecording(PathBuf),
    #[error("invalid container: {0}")]
    InvalidContainer(String),
    #[error("invalid filename template: {0}")]
    InvalidTemplate(String),
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
}
