//! Core domain model for Scribe: sources, cursors and canonical messages.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "scribe-core";

/// Which upstream a message came from; selects fetch and normalization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Discord,
    TelegramExport,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Discord, Source::TelegramExport];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Discord => "discord",
            Source::TelegramExport => "telegram_export",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseTagError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Source {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discord" => Ok(Source::Discord),
            "telegram_export" | "telegram-export" | "telegram" => Ok(Source::TelegramExport),
            other => Err(ParseTagError {
                kind: "source",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Historical ingestion from the earliest message forward; terminates.
    Backfill,
    /// Incremental polling from the last cursor; never terminates on its own.
    Tail,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Backfill => "backfill",
            SyncMode::Tail => "tail",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backfill" => Ok(SyncMode::Backfill),
            "tail" => Ok(SyncMode::Tail),
            other => Err(ParseTagError {
                kind: "sync mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Unit of independent sync progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub source: Source,
    pub channel_id: String,
}

impl ChannelKey {
    pub fn new(source: Source, channel_id: impl Into<String>) -> Self {
        Self {
            source,
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.channel_id)
    }
}

/// Compare two message ids, numerically when both are integers.
///
/// Discord snowflakes and Telegram ids are integers whose order follows
/// creation time; anything else falls back to byte order.
pub fn compare_message_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Resume position within a channel: the last message handled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessagePosition {
    pub message_id: String,
    pub sent_at: DateTime<Utc>,
}

impl MessagePosition {
    pub fn new(message_id: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            sent_at,
        }
    }
}

impl Ord for MessagePosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sent_at
            .cmp(&other.sent_at)
            .then_with(|| compare_message_ids(&self.message_id, &other.message_id))
    }
}

impl PartialOrd for MessagePosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id:{}@{}", self.message_id, self.sent_at.to_rfc3339())
    }
}

/// Source-native record, tagged by the upstream it was fetched from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "record", rename_all = "snake_case")]
pub enum RawPayload {
    Discord(JsonValue),
    TelegramExport(JsonValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessageEnvelope {
    pub channel_id: String,
    pub payload: RawPayload,
}

impl RawMessageEnvelope {
    pub fn discord(channel_id: impl Into<String>, record: JsonValue) -> Self {
        Self {
            channel_id: channel_id.into(),
            payload: RawPayload::Discord(record),
        }
    }

    pub fn telegram_export(channel_id: impl Into<String>, record: JsonValue) -> Self {
        Self {
            channel_id: channel_id.into(),
            payload: RawPayload::TelegramExport(record),
        }
    }

    pub fn source(&self) -> Source {
        match self.payload {
            RawPayload::Discord(_) => Source::Discord,
            RawPayload::TelegramExport(_) => Source::TelegramExport,
        }
    }

    pub fn record(&self) -> &JsonValue {
        match &self.payload {
            RawPayload::Discord(v) | RawPayload::TelegramExport(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub media_type: Option<String>,
    pub filename: Option<String>,
    pub size_bytes: Option<u64>,
}

/// `(source, channel_id, message_id)`: unique across re-ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub source: Source,
    pub channel_id: String,
    pub message_id: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.channel_id, self.message_id)
    }
}

/// Normalized, source-agnostic message as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub source: Source,
    pub channel_id: String,
    pub message_id: String,
    pub guild_id: Option<String>,
    pub channel_name: Option<String>,
    pub author_id: String,
    pub author_display_name: String,
    pub sent_at: DateTime<Utc>,
    pub body_text: String,
    pub reply_to_message_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_pinned: bool,
}

impl CanonicalMessage {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            source: self.source,
            channel_id: self.channel_id.clone(),
            message_id: self.message_id.clone(),
        }
    }

    pub fn position(&self) -> MessagePosition {
        MessagePosition::new(self.message_id.clone(), self.sent_at)
    }
}

/// Channel-level metadata that message records do not carry themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub guild_id: Option<String>,
    pub name: Option<String>,
}

impl ChannelInfo {
    /// Fill gaps only; values the record already had win.
    pub fn stamp(&self, message: &mut CanonicalMessage) {
        if message.guild_id.is_none() {
            message.guild_id.clone_from(&self.guild_id);
        }
        if message.channel_name.is_none() {
            message.channel_name.clone_from(&self.name);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub source: Source,
    pub channel_id: String,
    pub mode: SyncMode,
    pub last_message_id: String,
    pub last_sent_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    pub fn position(&self) -> MessagePosition {
        MessagePosition::new(self.last_message_id.clone(), self.last_sent_at)
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.source, self.channel_id.clone())
    }
}

/// Outcome counts of one batch commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub written: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl CommitResult {
    pub fn total(&self) -> u64 {
        self.written + self.updated + self.skipped
    }
}

impl std::ops::AddAssign for CommitResult {
    fn add_assign(&mut self, rhs: Self) {
        self.written += rhs.written;
        self.updated += rhs.updated;
        self.skipped += rhs.skipped;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Fetching,
    Normalizing,
    Committing,
    CursorAdvanced,
    Backoff,
    Paused,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Fetching => "fetching",
            SyncState::Normalizing => "normalizing",
            SyncState::Committing => "committing",
            SyncState::CursorAdvanced => "cursor_advanced",
            SyncState::Backoff => "backoff",
            SyncState::Paused => "paused",
            SyncState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Failed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-visible progress of one `(source, channel, mode)` loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub source: Source,
    pub channel_id: String,
    pub mode: SyncMode,
    pub label: Option<String>,
    pub state: SyncState,
    pub last_cursor: Option<MessagePosition>,
    pub last_error: Option<String>,
    pub pages_committed: u64,
    pub messages_written: u64,
    pub messages_updated: u64,
    pub records_skipped: u64,
    pub updated_at: DateTime<Utc>,
}

impl ChannelStatus {
    pub fn new(key: &ChannelKey, mode: SyncMode, label: Option<String>) -> Self {
        Self {
            source: key.source,
            channel_id: key.channel_id.clone(),
            mode,
            label,
            state: SyncState::Idle,
            last_cursor: None,
            last_error: None,
            pages_committed: 0,
            messages_written: 0,
            messages_updated: 0,
            records_skipped: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.source, self.channel_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCount {
    pub source: Source,
    pub channel_id: String,
    pub messages: i64,
}

/// Aggregate view of the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub total_messages: i64,
    pub earliest_sent_at: Option<DateTime<Utc>>,
    pub latest_sent_at: Option<DateTime<Utc>>,
    pub attachment_count: i64,
    pub channels: Vec<ChannelCount>,
}
