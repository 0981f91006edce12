use crate::error::MalformedRecord;
use crate::source::RawEventRow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How log files are named inside the output directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileLayout {
    /// `<room_name>_<YYYYMMDD>.log`
    #[default]
    PerRoom,
    /// `<YYYY-MM-DD>.log`, for deployments exporting a single room.
    DateOnly,
}

/// One exported line. Field order is the on-disk order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Reception timestamp (ms); drives ordering and the watermark.
    pub ts: i64,
    /// Sender-side timestamp, informational only.
    pub origin_ts: i64,
    pub origin: String,
    pub sender: String,
    pub event_id: String,
    pub room_id: String,
    pub message: String,
    pub url: Option<String>,
}

impl MessageRecord {
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Deserialize)]
struct EventEnvelope {
    origin_server_ts: i64,
    origin: String,
    sender: String,
    event_id: String,
    room_id: String,
    content: EventContent,
}

#[derive(Deserialize)]
struct EventContent {
    body: String,
    #[serde(default)]
    url: Option<String>,
}

/// Where a record goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub room_name: String,
    pub path: PathBuf,
}

/// Turns raw rows into records and records into file paths.
/// Single-room deployments are a one-entry room map with `FileLayout::DateOnly`.
#[derive(Debug, Clone)]
pub struct RecordMapper {
    rooms: BTreeMap<String, String>,
    output_directory: PathBuf,
    layout: FileLayout,
}

impl RecordMapper {
    pub fn new(
        rooms: BTreeMap<String, String>,
        output_directory: impl Into<PathBuf>,
        layout: FileLayout,
    ) -> Self {
        Self {
            rooms,
            output_directory: output_directory.into(),
            layout,
        }
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }

    pub fn map(&self, row: &RawEventRow) -> Result<MessageRecord, MalformedRecord> {
        let envelope: EventEnvelope = serde_json::from_str(&row.json)
            .map_err(|e| MalformedRecord::new(row.received_ts, e.to_string()))?;
        Ok(MessageRecord {
            ts: row.received_ts,
            origin_ts: envelope.origin_server_ts,
            origin: envelope.origin,
            sender: envelope.sender,
            event_id: envelope.event_id,
            room_id: envelope.room_id,
            message: envelope.content.body,
            url: envelope.content.url,
        })
    }

    pub fn route(&self, record: &MessageRecord) -> Result<Destination, MalformedRecord> {
        let room_name = self.rooms.get(&record.room_id).ok_or_else(|| {
            MalformedRecord::new(
                record.ts,
                format!("room {} is not configured", record.room_id),
            )
        })?;
        // Synapse timestamps are milliseconds.
        let day: DateTime<Utc> = DateTime::from_timestamp_millis(record.ts).ok_or_else(|| {
            MalformedRecord::new(record.ts, "timestamp out of range")
        })?;
        let file_name = match self.layout {
            FileLayout::PerRoom => format!("{}_{}.log", room_name, day.format("%Y%m%d")),
            FileLayout::DateOnly => format!("{}.log", day.format("%Y-%m-%d")),
        };
        Ok(Destination {
            room_name: room_name.clone(),
            path: self.output_directory.join(file_name),
        })
    }
}
