//! Wire-level frame trace
//!
//! Records every frame sent to and received from the bus, with a timestamp
//! and the device it was addressed to. Entries are kept in a bounded
//! in-memory buffer and optionally appended to a file as hex text or JSON
//! lines.

use super::protocol::frame;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared handle used by the link session
pub type FrameLog = Arc<Mutex<FrameTrace>>;

/// Trace file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    /// One hex line per frame
    #[default]
    Text,
    /// One JSON object per frame
    JsonLines,
}

impl TraceFormat {
    /// Pick the format from a file extension (`.jsonl` / `.json` → JSON lines)
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("jsonl" | "json") => TraceFormat::JsonLines,
            _ => TraceFormat::Text,
        }
    }
}

/// Data direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Controller to bus
    Sent,
    /// Bus to controller
    Received,
    /// Annotation (resync, reconnect)
    Info,
}

/// A single trace entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// When the frame crossed the link
    pub timestamp: DateTime<Local>,
    /// Which way
    pub direction: Direction,
    /// Device addressed, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<u8>,
    /// Frame bytes, hex encoded in JSON
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    /// Free-form annotation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

impl TraceEntry {
    /// Create new entry
    pub fn new(direction: Direction, device: Option<u8>, data: Vec<u8>) -> Self {
        Self {
            timestamp: Local::now(),
            direction,
            device,
            data,
            note: None,
        }
    }

    /// Format as a text line
    pub fn to_text(&self) -> String {
        let dir = match self.direction {
            Direction::Received => "RX",
            Direction::Sent => "TX",
            Direction::Info => "##",
        };
        let body = match (self.direction, &self.note) {
            (Direction::Info, Some(note)) => note.clone(),
            (Direction::Sent, _) => frame::describe(&self.data),
            _ => self
                .data
                .iter()
                .map(|b| format!("{b:02X}"))
                .collect::<Vec<_>>()
                .join(" "),
        };
        format!(
            "[{}] {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            dir,
            body
        )
    }

    /// Format as JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frame trace recorder
pub struct FrameTrace {
    file: Option<BufWriter<File>>,
    format: TraceFormat,
    path: Option<PathBuf>,
    buffer: VecDeque<TraceEntry>,
    max_buffer: usize,
    frames_logged: usize,
}

impl Default for FrameTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTrace {
    /// Create a recorder that only keeps the in-memory buffer
    pub fn new() -> Self {
        Self {
            file: None,
            format: TraceFormat::Text,
            path: None,
            buffer: VecDeque::new(),
            max_buffer: 1000,
            frames_logged: 0,
        }
    }

    /// Wrap in the shared handle the session expects
    pub fn shared(self) -> FrameLog {
        Arc::new(Mutex::new(self))
    }

    /// Start appending to `path`
    pub fn start(&mut self, path: PathBuf, format: TraceFormat) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        self.file = Some(BufWriter::new(file));
        self.format = format;
        self.path = Some(path);
        self.frames_logged = 0;
        Ok(())
    }

    /// Stop writing to file
    pub fn stop(&mut self) {
        if let Some(ref mut file) = self.file {
            let _ = file.flush();
        }
        self.file = None;
    }

    /// Trace file, if any
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    fn record(&mut self, entry: TraceEntry) {
        if let Some(ref mut file) = self.file {
            let line = match self.format {
                TraceFormat::Text => entry.to_text(),
                TraceFormat::JsonLines => entry.to_json(),
            };
            if let Err(e) = writeln!(file, "{line}").and_then(|()| file.flush()) {
                tracing::warn!("frame trace write failed: {e}");
            }
            self.frames_logged += 1;
        }

        self.buffer.push_back(entry);
        while self.buffer.len() > self.max_buffer {
            self.buffer.pop_front();
        }
    }

    /// Record a frame sent to `device`
    pub fn log_tx(&mut self, device: u8, data: &[u8]) {
        self.record(TraceEntry::new(Direction::Sent, Some(device), data.to_vec()));
    }

    /// Record bytes received from `device`
    pub fn log_rx(&mut self, device: u8, data: &[u8]) {
        self.record(TraceEntry::new(Direction::Received, Some(device), data.to_vec()));
    }

    /// Record an annotation
    pub fn log_info(&mut self, device: Option<u8>, message: &str) {
        let mut entry = TraceEntry::new(Direction::Info, device, Vec::new());
        entry.note = Some(message.to_string());
        self.record(entry);
    }

    /// Buffered entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.buffer.iter()
    }

    /// Frames written to file since `start`
    pub fn frames_logged(&self) -> usize {
        self.frames_logged
    }

    /// Set max buffer size
    pub fn set_max_buffer(&mut self, size: usize) {
        self.max_buffer = size;
    }
}

impl Drop for FrameTrace {
    fn drop(&mut self) {
        self.stop();
    }
}
