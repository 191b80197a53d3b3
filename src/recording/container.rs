//! Append-only frame container (`.fsrec`).
//!
//! Layout, all integers little-endian:
//! ```text
//! header:  "FSREC\0" | version u16 | metadata length u32 | metadata JSON
//! record:  "FRM1" | sequence u64 | timestamp µs i64 | width u32 | height u32
//!          | pixel format u8 | payload length u32 | payload
//! ```
//! Records are only ever appended and every batch is synced before the
//! writer reports it, so a crash leaves at most one incomplete record at the
//! tail, which the reader skips.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::RecordingError;
use crate::capture::{Frame, PixelFormat};

pub const CONTAINER_MAGIC: &[u8; 6] = b"FSREC\0";
pub const CONTAINER_VERSION: u16 = 1;
pub const RECORD_MAGIC: &[u8; 4] = b"FRM1";

/// Bytes preceding each record payload.
pub const RECORD_HEADER_SIZE: usize = 4 + 8 + 8 + 4 + 4 + 1 + 4;

/// Largest record payload accepted when reading (a 16-bit 8192x8192 frame).
pub const MAX_RECORD_PAYLOAD: usize = 8192 * 8192 * 2;

/// Largest header metadata accepted when reading.
pub const MAX_METADATA_LEN: usize = 16 * 1024 * 1024;

const FILE_HEADER_SIZE: u64 = (CONTAINER_MAGIC.len() + 2 + 4) as u64;

/// Header metadata stored as JSON at the start of the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub version: u16,
    pub created_at: DateTime<Utc>,
    /// Free-form acquisition metadata (configuration snapshot).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// On-disk size of `frame` as a record.
#[inline]
pub fn record_size(frame: &Frame) -> usize {
    RECORD_HEADER_SIZE + frame.byte_len()
}

fn encode_record(frame: &Frame, dst: &mut BytesMut) {
    dst.reserve(record_size(frame));
    dst.put_slice(RECORD_MAGIC);
    dst.put_u64_le(frame.sequence());
    dst.put_i64_le(frame.captured_at().timestamp_micros());
    dst.put_u32_le(frame.width());
    dst.put_u32_le(frame.height());
    dst.put_u8(frame.pixel_format().code());
    dst.put_u32_le(frame.byte_len() as u32);
    dst.put_slice(frame.data());
}

/// Appends frames to a container file.
#[derive(Debug)]
pub struct ContainerWriter {
    path: PathBuf,
    file: File,
    scratch: BytesMut,
    bytes_written: u64,
    frames_written: u64,
}

impl ContainerWriter {
    /// Creates a new container; fails if `path` already exists.
    pub fn create(path: impl AsRef<Path>, metadata: serde_json::Value) -> Result<Self, RecordingError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;

        let header = ContainerHeader {
            version: CONTAINER_VERSION,
            created_at: Utc::now(),
            metadata,
        };
        let json = serde_json::to_vec(&header)?;
        let mut buf = BytesMut::with_capacity(CONTAINER_MAGIC.len() + 6 + json.len());
        buf.put_slice(CONTAINER_MAGIC);
        buf.put_u16_le(CONTAINER_VERSION);
        buf.put_u32_le(json.len() as u32);
        buf.put_slice(&json);
        file.write_all(&buf)?;
        file.sync_data()?;

        tracing::info!(path = %path.display(), "Created recording container");
        Ok(Self {
            path,
            file,
            scratch: BytesMut::new(),
            bytes_written: buf.len() as u64,
            frames_written: 0,
        })
    }

    /// Reopens an existing container to append more records.
    ///
    /// An incomplete trailing record is cut off first, so that appended
    /// records stay readable.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        let path = path.as_ref().to_path_buf();
        let mut reader = ContainerReader::open(&path)?;
        for frame in reader.by_ref() {
            frame?;
        }
        let header = reader.header().clone();
        let file = OpenOptions::new().append(true).open(&path)?;
        if reader.truncated() {
            tracing::warn!(
                path = %path.display(),
                keep = reader.valid_len(),
                size = file.metadata()?.len(),
                "Dropping incomplete trailing record"
            );
            file.set_len(reader.valid_len())?;
        }
        let bytes_written = file.metadata()?.len();
        tracing::debug!(path = %path.display(), version = header.version, "Reopened recording container");
        Ok(Self {
            path,
            file,
            scratch: BytesMut::new(),
            bytes_written,
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes on disk, header included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Writes `frames` in one append and syncs them to disk.
    pub fn append_batch(&mut self, frames: &[Frame]) -> Result<u64, RecordingError> {
        if frames.is_empty() {
            return Ok(0);
        }
        self.scratch.clear();
        for frame in frames {
            encode_record(frame, &mut self.scratch);
        }
        self.file.write_all(&self.scratch)?;
        self.file.flush()?;
        self.file.sync_data()?;

        let written = self.scratch.len() as u64;
        self.bytes_written += written;
        self.frames_written += frames.len() as u64;
        tracing::debug!(path = %self.path.display(), frames = frames.len(), bytes = written, "Flushed batch");
        Ok(written)
    }

    /// Syncs and closes the file.
    pub fn finish(self) -> Result<u64, RecordingError> {
        self.file.sync_all()?;
        tracing::info!(
            path = %self.path.display(),
            frames = self.frames_written,
            bytes = self.bytes_written,
            "Closed recording container"
        );
        Ok(self.frames_written)
    }
}

/// Sequential reader over a container's records.
///
/// Iteration ends at end of file or at an incomplete trailing record; the
/// latter sets [`truncated`](Self::truncated).
pub struct ContainerReader<R = BufReader<File>> {
    reader: R,
    header: ContainerHeader,
    // End offset of the last complete record (or of the header).
    valid_len: u64,
    truncated: bool,
    failed: bool,
}

impl ContainerReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> ContainerReader<R> {
    pub fn new(mut reader: R) -> Result<Self, RecordingError> {
        let mut magic = [0u8; 6];
        reader.read_exact(&mut magic)?;
        if &magic != CONTAINER_MAGIC {
            return Err(RecordingError::InvalidContainer("not a recording container".into()));
        }
        let mut word = [0u8; 2];
        reader.read_exact(&mut word)?;
        let version = u16::from_le_bytes(word);
        if version != CONTAINER_VERSION {
            return Err(RecordingError::InvalidContainer(format!("unsupported version {version}")));
        }
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_METADATA_LEN {
            return Err(RecordingError::InvalidContainer(format!("metadata length {len} too large")));
        }
        let mut json = vec![0u8; len];
        reader.read_exact(&mut json)?;
        let header = serde_json::from_slice(&json)?;
        Ok(Self {
            reader,
            header,
            valid_len: FILE_HEADER_SIZE + len as u64,
            truncated: false,
            failed: false,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// True if the file ended inside a record.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Bytes covered by the header and the records read so far.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    fn read_record(&mut self) -> Result<Option<Frame>, RecordingError> {
        let mut head = [0u8; RECORD_HEADER_SIZE];
        let filled = read_fully(&mut self.reader, &mut head)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < head.len() {
            self.truncated = true;
            return Ok(None);
        }
        if &head[0..4] != RECORD_MAGIC {
            return Err(RecordingError::InvalidContainer("bad record magic".into()));
        }
        let u32_at = |at: usize| u32::from_le_bytes([head[at], head[at + 1], head[at + 2], head[at + 3]]);
        let mut word = [0u8; 8];
        word.copy_from_slice(&head[4..12]);
        let sequence = u64::from_le_bytes(word);
        word.copy_from_slice(&head[12..20]);
        let micros = i64::from_le_bytes(word);
        let width = u32_at(20);
        let height = u32_at(24);
        let pixel_format = PixelFormat::from_code(head[28])
            .ok_or_else(|| RecordingError::InvalidContainer(format!("unknown pixel format {}", head[28])))?;
        let len = u32_at(29) as usize;
        let expected = u64::from(width) * u64::from(height) * pixel_format.bytes_per_pixel() as u64;
        if len as u64 != expected || len > MAX_RECORD_PAYLOAD {
            return Err(RecordingError::InvalidContainer(format!(
                "record {sequence}: payload of {len} bytes for a {width}x{height} {pixel_format:?} frame"
            )));
        }

        let mut payload = vec![0u8; len];
        if read_fully(&mut self.reader, &mut payload)? < len {
            self.truncated = true;
            return Ok(None);
        }
        let captured_at = Utc
            .timestamp_micros(micros)
            .single()
            .ok_or_else(|| RecordingError::InvalidContainer(format!("bad timestamp {micros}")))?;
        self.valid_len += (RECORD_HEADER_SIZE + len) as u64;
        Ok(Some(Frame::with_timestamp(payload, width, height, pixel_format, sequence, captured_at)))
    }
}

impl<R: Read> Iterator for ContainerReader<R> {
    type Item = Result<Frame, RecordingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.truncated {
            return None;
        }
        match self.read_record() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

// Like read_exact, but reports how much was read before end of file.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(seq: u64, value: u8) -> Frame {
        Frame::new(vec![value; 12], 4, 3, PixelFormat::Mono8, seq)
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.fsrec");
        let mut writer = ContainerWriter::create(&path, json!({"exposure_ms": 10})).unwrap();
        writer.append_batch(&[frame(0, 1), frame(1, 2)]).unwrap();
        writer.append_batch(&[frame(2, 3)]).unwrap();
        let size = writer.bytes_written();
        assert_eq!(writer.finish().unwrap(), 3);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);

        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.header().metadata["exposure_ms"], 10);
        let frames: Vec<Frame> = reader.map(Result::unwrap).collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].sequence(), 2);
        assert_eq!(frames[1].data(), &[2u8; 12][..]);
    }

    #[test]
    fn test_truncated_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.fsrec");
        let mut writer = ContainerWriter::create(&path, serde_json::Value::Null).unwrap();
        writer.append_batch(&[frame(0, 1), frame(1, 2)]).unwrap();
        let full = writer.bytes_written();
        drop(writer);

        // Simulate a crash in the middle of the second record.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 5).unwrap();

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.next().unwrap().unwrap().sequence(), 0);
        assert!(reader.next().is_none());
        assert!(reader.truncated());
    }

    #[test]
    fn test_open_append_continues_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two-part.fsrec");
        let mut writer = ContainerWriter::create(&path, serde_json::Value::Null).unwrap();
        writer.append_batch(&[frame(0, 1)]).unwrap();
        writer.finish().unwrap();

        let mut writer = ContainerWriter::open_append(&path).unwrap();
        writer.append_batch(&[frame(1, 2)]).unwrap();
        writer.finish().unwrap();

        let sequences: Vec<u64> = ContainerReader::open(&path)
            .unwrap()
            .map(|f| f.unwrap().sequence())
            .collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[test]
    fn test_existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.fsrec");
        std::fs::write(&path, b"keep").unwrap();
        assert!(matches!(
            ContainerWriter::create(&path, serde_json::Value::Null),
            Err(RecordingError::Io(_))
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep");
    }

    #[test]
    fn test_rejects_foreign_file() {
        let result = ContainerReader::new(&b"NOTREC\x01\x00"[..]);
        assert!(matches!(result, Err(RecordingError::InvalidContainer(_))));
    }

    #[test]
    fn test_open_append_drops_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resumed.fsrec");
        let mut writer = ContainerWriter::create(&path, serde_json::Value::Null).unwrap();
        writer.append_batch(&[frame(0, 1), frame(1, 2)]).unwrap();
        let full = writer.bytes_written();
        drop(writer);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 5).unwrap();
        drop(file);

        let mut writer = ContainerWriter::open_append(&path).unwrap();
        assert_eq!(writer.bytes_written(), full - record_size(&frame(1, 2)) as u64);
        writer.append_batch(&[frame(2, 3)]).unwrap();
        writer.finish().unwrap();

        let mut reader = ContainerReader::open(&path).unwrap();
        let sequences: Vec<u64> = reader.by_ref().map(|f| f.unwrap().sequence()).collect();
        assert_eq!(sequences, vec![0, 2]);
        assert!(!reader.truncated());
    }

    #[test]
    fn test_corrupt_record_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.fsrec");
        let mut writer = ContainerWriter::create(&path, serde_json::Value::Null).unwrap();
        writer.append_batch(&[frame(0, 1)]).unwrap();
        drop(writer);

        // Overwrite the payload length of the only record with u32::MAX.
        let mut bytes = std::fs::read(&path).unwrap();
        let at = bytes.len() - 12 - 4;
        bytes[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = ContainerReader::open(&path).unwrap();
        assert!(matches!(reader.next(), Some(Err(RecordingError::InvalidContainer(_)))));
        assert!(reader.next().is_none());
    }
}
