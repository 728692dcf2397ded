//! Message source contracts, source implementations, normalization and the
//! rate-limited, retrying page fetcher.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use scribe_core::{
    Attachment, CanonicalMessage, ChannelInfo, ChannelKey, MessagePosition, RawMessageEnvelope,
    RawPayload, Source, SyncMode,
};
use scribe_storage::{
    BackoffPolicy, HttpClient, HttpError, RateLimitTimeout, RateLimiter, RetryDisposition,
    MAX_RETRY_AFTER,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "scribe-adapters";

/// Failure of a single upstream call, classified for the retry loop.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("upstream rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("{0}")]
    Unavailable(String),
}

impl From<HttpError> for SourceError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::RateLimited { retry_after, .. } => SourceError::RateLimited { retry_after },
            other => match other.disposition() {
                RetryDisposition::Retryable => SourceError::Transient(other.to_string()),
                RetryDisposition::NonRetryable => SourceError::Unavailable(other.to_string()),
            },
        }
    }
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    fn source(&self) -> Source;

    /// Largest page the upstream will return in one call.
    fn max_page_size(&self) -> usize {
        usize::MAX
    }

    /// Fetch up to `limit` records strictly after `after`.
    ///
    /// With no `after`, backfill starts at the earliest history and tail
    /// starts at the newest page. Records may come back in any order.
    async fn fetch_page(
        &self,
        channel_id: &str,
        mode: SyncMode,
        after: Option<&MessagePosition>,
        limit: usize,
    ) -> Result<Vec<RawMessageEnvelope>, SourceError>;

    /// Channel metadata that message records omit. `None` when the upstream
    /// has nothing to add.
    async fn channel_info(&self, _channel_id: &str) -> Result<Option<ChannelInfo>, SourceError> {
        Ok(None)
    }
}

/// Sources available to the orchestrator, keyed by tag.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<Source, Arc<dyn MessageSource>>,
}

impl SourceRegistry {
    pub fn with(mut self, source: Arc<dyn MessageSource>) -> Self {
        self.sources.insert(source.source(), source);
        self
    }

    pub fn get(&self, source: Source) -> Option<Arc<dyn MessageSource>> {
        self.sources.get(&source).cloned()
    }

    pub fn contains(&self, source: Source) -> bool {
        self.sources.contains_key(&source)
    }
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub api_base: String,
    pub token: String,
}

/// Channel history over the Discord REST API.
#[derive(Debug)]
pub struct DiscordHistorySource {
    http: Arc<HttpClient>,
    config: DiscordConfig,
}

pub const DISCORD_MAX_PAGE: usize = 100;

impl DiscordHistorySource {
    pub fn new(http: Arc<HttpClient>, config: DiscordConfig) -> Self {
        Self { http, config }
    }

    pub fn page_url(
        &self,
        channel_id: &str,
        mode: SyncMode,
        after: Option<&MessagePosition>,
        limit: usize,
    ) -> String {
        let mut url = format!(
            "{}/channels/{}/messages?limit={}",
            self.config.api_base.trim_end_matches('/'),
            channel_id,
            limit.clamp(1, DISCORD_MAX_PAGE)
        );
        match (after, mode) {
            (Some(pos), _) => url.push_str(&format!("&after={}", pos.message_id)),
            (None, SyncMode::Backfill) => url.push_str("&after=0"),
            (None, SyncMode::Tail) => {}
        }
        url
    }

    pub fn channel_url(&self, channel_id: &str) -> String {
        format!(
            "{}/channels/{}",
            self.config.api_base.trim_end_matches('/'),
            channel_id
        )
    }

    fn auth_headers(&self) -> [(&'static str, String); 1] {
        [("authorization", format!("Bot {}", self.config.token))]
    }
}

#[async_trait]
impl MessageSource for DiscordHistorySource {
    fn source(&self) -> Source {
        Source::Discord
    }

    fn max_page_size(&self) -> usize {
        DISCORD_MAX_PAGE
    }

    async fn fetch_page(
        &self,
        channel_id: &str,
        mode: SyncMode,
        after: Option<&MessagePosition>,
        limit: usize,
    ) -> Result<Vec<RawMessageEnvelope>, SourceError> {
        let url = self.page_url(channel_id, mode, after, limit);
        let body = self.http.get_json(&url, &self.auth_headers()).await?;
        let JsonValue::Array(records) = body else {
            return Err(SourceError::Transient(format!(
                "expected message array from {url}"
            )));
        };
        Ok(records
            .into_iter()
            .map(|record| RawMessageEnvelope::discord(channel_id, record))
            .collect())
    }

    /// History records carry no `guild_id`; the channel object does.
    async fn channel_info(&self, channel_id: &str) -> Result<Option<ChannelInfo>, SourceError> {
        let url = self.channel_url(channel_id);
        let body = self.http.get_json(&url, &self.auth_headers()).await?;
        Ok(Some(discord_channel_info(&body)))
    }
}

pub fn discord_channel_info(channel: &JsonValue) -> ChannelInfo {
    ChannelInfo {
        guild_id: json_id(channel, &["guild_id"]),
        name: json_str(channel, &["name"]).map(str::to_string),
    }
}

/// Telegram Desktop "Export chat history" JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramExport {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub chat_type: Option<String>,
    #[serde(default)]
    pub messages: Vec<JsonValue>,
}

pub const TELEGRAM_EXPORT_FILE: &str = "result.json";

/// Parsed export with numeric-id records sorted ascending.
#[derive(Debug)]
struct LoadedExport {
    name: Option<String>,
    records: Vec<(i64, JsonValue)>,
}

impl LoadedExport {
    fn new(channel_id: &str, export: TelegramExport) -> Self {
        let mut records: Vec<(i64, JsonValue)> = export
            .messages
            .into_iter()
            .filter_map(|record| match record.get("id").and_then(JsonValue::as_i64) {
                Some(id) => Some((id, record)),
                None => {
                    warn!(channel_id, "telegram export record without numeric id dropped");
                    None
                }
            })
            .collect();
        records.sort_by_key(|(id, _)| *id);
        Self {
            name: export.name,
            records,
        }
    }

    fn page(&self, mode: SyncMode, after_id: Option<i64>, limit: usize) -> &[(i64, JsonValue)] {
        let records = &self.records;
        match (after_id, mode) {
            (Some(after_id), _) => {
                let start = records.partition_point(|(id, _)| *id <= after_id);
                &records[start..records.len().min(start.saturating_add(limit))]
            }
            (None, SyncMode::Backfill) => &records[..records.len().min(limit)],
            (None, SyncMode::Tail) => &records[records.len().saturating_sub(limit)..],
        }
    }
}

/// Size and mtime of an export file; a change in either forces a re-parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

type ExportCache = HashMap<String, (FileStamp, Arc<LoadedExport>)>;

/// Static exports laid out as `{root}/{channel_id}/result.json`.
///
/// Each export is parsed once and served from memory until the file changes.
#[derive(Debug, Clone)]
pub struct TelegramExportSource {
    root: PathBuf,
    cache: Arc<StdMutex<ExportCache>>,
    parses: Arc<AtomicUsize>,
}

impl TelegramExportSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Arc::default(),
            parses: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// How many times an export file has been read and parsed.
    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::Relaxed)
    }

    fn export_path(&self, channel_id: &str) -> Result<PathBuf, SourceError> {
        let valid = !channel_id.is_empty()
            && channel_id != "."
            && channel_id != ".."
            && !channel_id.contains(['/', '\\']);
        if !valid {
            return Err(SourceError::Unavailable(format!(
                "invalid export channel id {channel_id:?}"
            )));
        }
        Ok(self.root.join(channel_id).join(TELEGRAM_EXPORT_FILE))
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, ExportCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn load(&self, channel_id: &str) -> Result<Arc<LoadedExport>, SourceError> {
        let path = self.export_path(channel_id)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| read_error(&path, err))?;
        let stamp = FileStamp {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        };

        let cached = self
            .cache()
            .get(channel_id)
            .filter(|(seen, _)| *seen == stamp)
            .map(|(_, export)| export.clone());
        if let Some(export) = cached {
            return Ok(export);
        }

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| read_error(&path, err))?;
        let export: TelegramExport = serde_json::from_str(&text).map_err(|err| {
            SourceError::Unavailable(format!("parsing {}: {err}", path.display()))
        })?;
        self.parses.fetch_add(1, Ordering::Relaxed);

        let loaded = Arc::new(LoadedExport::new(channel_id, export));
        debug!(channel_id, records = loaded.records.len(), "telegram export parsed");
        self.cache()
            .insert(channel_id.to_string(), (stamp, loaded.clone()));
        Ok(loaded)
    }
}

fn read_error(path: &Path, err: std::io::Error) -> SourceError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SourceError::Unavailable(format!("export file {} not found", path.display()))
    } else {
        SourceError::Transient(format!("reading {}: {err}", path.display()))
    }
}

#[async_trait]
impl MessageSource for TelegramExportSource {
    fn source(&self) -> Source {
        Source::TelegramExport
    }

    async fn fetch_page(
        &self,
        channel_id: &str,
        mode: SyncMode,
        after: Option<&MessagePosition>,
        limit: usize,
    ) -> Result<Vec<RawMessageEnvelope>, SourceError> {
        let export = self.load(channel_id).await?;
        let after_id = match after {
            Some(pos) => Some(pos.message_id.parse::<i64>().map_err(|_| {
                SourceError::Unavailable(format!(
                    "cursor id {:?} is not a telegram message id",
                    pos.message_id
                ))
            })?),
            None => None,
        };

        Ok(export
            .page(mode, after_id, limit)
            .iter()
            .map(|(_, record)| RawMessageEnvelope::telegram_export(channel_id, record.clone()))
            .collect())
    }

    async fn channel_info(&self, channel_id: &str) -> Result<Option<ChannelInfo>, SourceError> {
        let export = self.load(channel_id).await?;
        Ok(Some(ChannelInfo {
            guild_id: None,
            name: export.name.clone(),
        }))
    }
}

/// Channel ids present in a Telegram export root (directories holding a
/// `result.json`), sorted.
pub fn list_export_channels(root: impl AsRef<Path>) -> Result<Vec<String>> {
    let root = root.as_ref();
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut channels = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("reading {}", root.display()))? {
        let entry = entry.with_context(|| format!("listing {}", root.display()))?;
        if entry.path().join(TELEGRAM_EXPORT_FILE).is_file() {
            channels.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    channels.sort();
    Ok(channels)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {upstream} record {}: {reason}", message_id.as_deref().unwrap_or("<no id>"))]
pub struct MalformedRecord {
    pub upstream: Source,
    pub message_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Malformed(MalformedRecord),
    /// A record that is not a chat message (joins, pins, calls).
    NotAMessage {
        message_id: Option<String>,
        kind: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Message(CanonicalMessage),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub messages: Vec<CanonicalMessage>,
    pub skipped: Vec<SkipReason>,
}

/// Map one source-native record onto the canonical message shape.
pub fn normalize(envelope: &RawMessageEnvelope) -> Normalized {
    let result = match &envelope.payload {
        RawPayload::Discord(record) => normalize_discord(&envelope.channel_id, record),
        RawPayload::TelegramExport(record) => normalize_telegram(&envelope.channel_id, record),
    };
    match result {
        Ok(message) => Normalized::Message(message),
        Err(reason) => Normalized::Skipped(reason),
    }
}

pub fn normalize_page(envelopes: &[RawMessageEnvelope]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for envelope in envelopes {
        match normalize(envelope) {
            Normalized::Message(message) => batch.messages.push(message),
            Normalized::Skipped(reason) => {
                match &reason {
                    SkipReason::Malformed(err) => {
                        warn!(channel_id = %envelope.channel_id, error = %err, "skipping record")
                    }
                    SkipReason::NotAMessage { kind, .. } => {
                        debug!(channel_id = %envelope.channel_id, kind = %kind, "skipping non-message record")
                    }
                }
                batch.skipped.push(reason);
            }
        }
    }
    batch
}

/// Read the resume position of a raw record without fully normalizing it.
pub fn envelope_position(envelope: &RawMessageEnvelope) -> Option<MessagePosition> {
    match &envelope.payload {
        RawPayload::Discord(record) => {
            let id = json_id(record, &["id"])?;
            let sent_at = json_str(record, &["timestamp"]).and_then(parse_rfc3339)?;
            Some(MessagePosition::new(id, sent_at))
        }
        RawPayload::TelegramExport(record) => {
            let id = json_id(record, &["id"])?;
            Some(MessagePosition::new(id, telegram_sent_at(record)?))
        }
    }
}

fn json_value<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    (!cur.is_null()).then_some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_value(value, path)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    json_value(value, path)?.as_u64()
}

fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_value(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_unix(value: &JsonValue) -> Option<DateTime<Utc>> {
    let secs = match value {
        JsonValue::String(s) => s.trim().parse::<i64>().ok()?,
        JsonValue::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

fn parse_naive_utc(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn malformed(upstream: Source, message_id: &Option<String>, reason: &str) -> SkipReason {
    SkipReason::Malformed(MalformedRecord {
        upstream,
        message_id: message_id.clone(),
        reason: reason.to_string(),
    })
}

fn normalize_discord(channel_id: &str, record: &JsonValue) -> Result<CanonicalMessage, SkipReason> {
    let message_id = json_id(record, &["id"]);
    let bad = |reason: &str| malformed(Source::Discord, &message_id, reason);

    let id = message_id.clone().ok_or_else(|| bad("missing id"))?;
    let sent_at = json_str(record, &["timestamp"]).ok_or_else(|| bad("missing timestamp"))?;
    let sent_at = parse_rfc3339(sent_at).ok_or_else(|| bad("unparseable timestamp"))?;
    let edited_at = match json_value(record, &["edited_timestamp"]) {
        None => None,
        Some(value) => Some(
            value
                .as_str()
                .and_then(parse_rfc3339)
                .ok_or_else(|| bad("unparseable edited_timestamp"))?,
        ),
    };
    let author_id = json_id(record, &["author", "id"]).ok_or_else(|| bad("missing author id"))?;
    let author_display_name = json_str(record, &["author", "global_name"])
        .or_else(|| json_str(record, &["author", "username"]))
        .map(str::to_string)
        .unwrap_or_else(|| author_id.clone());

    let attachments = json_value(record, &["attachments"])
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(Attachment {
                        url: json_str(item, &["url"])?.to_string(),
                        media_type: json_str(item, &["content_type"]).map(str::to_string),
                        filename: json_str(item, &["filename"]).map(str::to_string),
                        size_bytes: json_u64(item, &["size"]),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CanonicalMessage {
        source: Source::Discord,
        channel_id: channel_id.to_string(),
        message_id: id,
        guild_id: json_id(record, &["guild_id"]),
        channel_name: None,
        author_id,
        author_display_name,
        sent_at,
        body_text: json_value(record, &["content"])
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
        reply_to_message_id: json_id(record, &["message_reference", "message_id"])
            .or_else(|| json_id(record, &["referenced_message", "id"])),
        attachments,
        edited_at,
        is_pinned: json_value(record, &["pinned"])
            .and_then(JsonValue::as_bool)
            .unwrap_or(false),
    })
}

fn telegram_sent_at(record: &JsonValue) -> Option<DateTime<Utc>> {
    json_value(record, &["date_unixtime"])
        .and_then(parse_unix)
        .or_else(|| json_str(record, &["date"]).and_then(parse_naive_utc))
}

/// Flatten Telegram's text field: a plain string, or an array mixing strings
/// and `{type, text}` entity objects.
pub fn flatten_telegram_text(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Array(parts)) => parts
            .iter()
            .map(|part| match part {
                JsonValue::String(s) => s.as_str(),
                JsonValue::Object(_) => part.get("text").and_then(JsonValue::as_str).unwrap_or(""),
                _ => "",
            })
            .collect(),
        _ => String::new(),
    }
}

fn exported_file(value: &str) -> bool {
    !value.starts_with("(File not included")
}

fn file_name_of(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
}

fn telegram_attachments(record: &JsonValue) -> Vec<Attachment> {
    let mut out = Vec::new();
    if let Some(photo) = json_str(record, &["photo"]).filter(|p| exported_file(p)) {
        out.push(Attachment {
            url: photo.to_string(),
            media_type: Some("image/jpeg".to_string()),
            filename: file_name_of(photo),
            size_bytes: json_u64(record, &["photo_file_size"]),
        });
    }
    if let Some(file) = json_str(record, &["file"]).filter(|f| exported_file(f)) {
        out.push(Attachment {
            url: file.to_string(),
            media_type: json_str(record, &["mime_type"]).map(str::to_string),
            filename: json_str(record, &["file_name"])
                .map(str::to_string)
                .or_else(|| file_name_of(file)),
            size_bytes: json_u64(record, &["file_size"]),
        });
    }
    out
}

fn normalize_telegram(
    channel_id: &str,
    record: &JsonValue,
) -> Result<CanonicalMessage, SkipReason> {
    let message_id = json_id(record, &["id"]);
    let bad = |reason: &str| malformed(Source::TelegramExport, &message_id, reason);

    let kind = json_str(record, &["type"]).unwrap_or("message");
    if kind != "message" {
        return Err(SkipReason::NotAMessage {
            message_id: message_id.clone(),
            kind: kind.to_string(),
        });
    }

    let id = message_id.clone().ok_or_else(|| bad("missing id"))?;
    let sent_at = telegram_sent_at(record).ok_or_else(|| bad("missing or unparseable date"))?;
    let author_id = json_id(record, &["from_id"])
        .or_else(|| json_id(record, &["actor_id"]))
        .ok_or_else(|| bad("missing from_id"))?;
    let author_display_name = json_str(record, &["from"])
        .map(str::to_string)
        .unwrap_or_else(|| author_id.clone());
    let edited_at = json_value(record, &["edited_unixtime"])
        .and_then(parse_unix)
        .or_else(|| json_str(record, &["edited"]).and_then(parse_naive_utc));

    Ok(CanonicalMessage {
        source: Source::TelegramExport,
        channel_id: channel_id.to_string(),
        message_id: id,
        guild_id: None,
        channel_name: None,
        author_id,
        author_display_name,
        sent_at,
        body_text: flatten_telegram_text(record.get("text")),
        reply_to_message_id: json_id(record, &["reply_to_message_id"]),
        attachments: telegram_attachments(record),
        edited_at,
        is_pinned: false,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub backoff: BackoffPolicy,
    /// Longest wait for a rate-limit permit before giving up on the attempt.
    pub acquire_timeout: Option<Duration>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            acquire_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// One page, chronological, with the position to resume from after it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub envelopes: Vec<RawMessageEnvelope>,
    pub next_cursor: Option<MessagePosition>,
    pub has_more: bool,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch for {channel} exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        channel: ChannelKey,
        attempts: usize,
        /// Position the failed fetch started from; resume here later.
        cursor: Option<MessagePosition>,
        last_error: String,
    },
    #[error("channel {channel} unavailable: {reason}")]
    ChannelUnavailable { channel: ChannelKey, reason: String },
    #[error(transparent)]
    RateLimitTimeout(#[from] RateLimitTimeout),
}

impl FetchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::ChannelUnavailable { .. })
    }
}

/// Hooks into the fetch retry loop so callers can surface backoff.
#[async_trait]
pub trait RetryObserver: Send + Sync {
    /// Attempt `attempt` failed and the next one waits roughly `delay`.
    async fn backing_off(&self, attempt: usize, delay: Duration, error: &str);
    /// Attempt `attempt` is starting after a backoff.
    async fn retrying(&self, attempt: usize);
}

/// Observer that ignores retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quiet;

#[async_trait]
impl RetryObserver for Quiet {
    async fn backing_off(&self, _attempt: usize, _delay: Duration, _error: &str) {}
    async fn retrying(&self, _attempt: usize) {}
}

/// Pulls pages through the shared rate limiter, retrying transient failures.
#[derive(Debug, Clone)]
pub struct Fetcher {
    limiter: Arc<RateLimiter>,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(limiter: Arc<RateLimiter>, settings: FetchSettings) -> Self {
        Self { limiter, settings }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn fetch_page(
        &self,
        source: &dyn MessageSource,
        channel_id: &str,
        mode: SyncMode,
        cursor: Option<&MessagePosition>,
        page_size: usize,
    ) -> Result<RawPage, FetchError> {
        self.fetch_page_observed(source, channel_id, mode, cursor, page_size, &Quiet)
            .await
    }

    pub async fn fetch_page_observed(
        &self,
        source: &dyn MessageSource,
        channel_id: &str,
        mode: SyncMode,
        cursor: Option<&MessagePosition>,
        page_size: usize,
        observer: &dyn RetryObserver,
    ) -> Result<RawPage, FetchError> {
        let limit = page_size.clamp(1, source.max_page_size());
        let channel = ChannelKey::new(source.source(), channel_id);
        let (envelopes, attempts) = self
            .with_retries(channel, cursor, observer, move || {
                source.fetch_page(channel_id, mode, cursor, limit)
            })
            .await?;
        Ok(assemble_page(envelopes, limit, attempts))
    }

    /// Channel metadata, under the same permits and retry rules as pages.
    pub async fn channel_info(
        &self,
        source: &dyn MessageSource,
        channel_id: &str,
        observer: &dyn RetryObserver,
    ) -> Result<Option<ChannelInfo>, FetchError> {
        let channel = ChannelKey::new(source.source(), channel_id);
        let (info, _) = self
            .with_retries(channel, None, observer, move || source.channel_info(channel_id))
            .await?;
        Ok(info)
    }

    async fn with_retries<T, F, Fut>(
        &self,
        channel: ChannelKey,
        cursor: Option<&MessagePosition>,
        observer: &dyn RetryObserver,
        mut call: F,
    ) -> Result<(T, usize), FetchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SourceError>>,
    {
        let attempts = self.settings.backoff.attempts();
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                observer.retrying(attempt + 1).await;
            }
            let deadline = self.settings.acquire_timeout.map(|t| Instant::now() + t);
            self.limiter.acquire(channel.source, deadline).await?;

            let mut server_delay = None;
            match call().await {
                Ok(value) => return Ok((value, attempt + 1)),
                Err(SourceError::Unavailable(reason)) => {
                    return Err(FetchError::ChannelUnavailable { channel, reason })
                }
                Err(SourceError::RateLimited { retry_after }) => {
                    if let Some(delay) = retry_after {
                        self.limiter.penalize(channel.source, delay);
                        server_delay = Some(delay.min(MAX_RETRY_AFTER));
                    }
                    last_error = SourceError::RateLimited { retry_after }.to_string();
                }
                Err(SourceError::Transient(message)) => last_error = message,
            }

            if attempt + 1 >= attempts {
                break;
            }
            match server_delay {
                // The limiter holds the next permit until the block clears.
                Some(delay) => observer.backing_off(attempt + 1, delay, &last_error).await,
                None => {
                    let delay = self.settings.backoff.delay_for_attempt(attempt);
                    debug!(%channel, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %last_error, "retrying upstream call");
                    observer.backing_off(attempt + 1, delay, &last_error).await;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        warn!(%channel, attempts, error = %last_error, "upstream call exhausted");
        Err(FetchError::Exhausted {
            channel,
            attempts,
            cursor: cursor.cloned(),
            last_error,
        })
    }
}

fn assemble_page(mut envelopes: Vec<RawMessageEnvelope>, limit: usize, attempts: usize) -> RawPage {
    let has_more = envelopes.len() >= limit;
    envelopes.sort_by_cached_key(envelope_position);
    let next_cursor = envelopes.iter().filter_map(envelope_position).max();
    RawPage {
        envelopes,
        next_cursor,
        has_more,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_storage::RateLimitConfig;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn discord_record(id: &str, ts: &str) -> JsonValue {
        json!({
            "id": id,
            "channel_id": "42",
            "author": {"id": "7", "username": "ada", "global_name": "Ada L."},
            "content": format!("message {id}"),
            "timestamp": ts,
            "edited_timestamp": null,
            "attachments": [],
            "pinned": false
        })
    }

    struct ScriptedSource {
        source: Source,
        replies: Mutex<VecDeque<Result<Vec<RawMessageEnvelope>, SourceError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Result<Vec<RawMessageEnvelope>, SourceError>>) -> Self {
            Self {
                source: Source::Discord,
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        fn source(&self) -> Source {
            self.source
        }

        async fn fetch_page(
            &self,
            _channel_id: &str,
            _mode: SyncMode,
            _after: Option<&MessagePosition>,
            _limit: usize,
        ) -> Result<Vec<RawMessageEnvelope>, SourceError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SourceError::Transient("connection reset".into())))
        }
    }

    fn fetcher(max_attempts: usize) -> Fetcher {
        Fetcher::new(
            Arc::new(RateLimiter::new([(
                Source::Discord,
                RateLimitConfig::new(50, Duration::from_secs(1)),
            )])),
            FetchSettings {
                backoff: BackoffPolicy {
                    max_attempts,
                    base_delay: Duration::from_millis(100),
                    max_delay: Duration::from_secs(2),
                },
                acquire_timeout: None,
            },
        )
    }

    #[test]
    fn discord_record_normalizes_all_fields() {
        let record = json!({
            "id": "1100",
            "author": {"id": "7", "username": "ada"},
            "content": "see attached",
            "timestamp": "2024-03-01T10:00:00.000000+00:00",
            "edited_timestamp": "2024-03-01T10:05:00+00:00",
            "message_reference": {"message_id": "1099"},
            "attachments": [
                {"url": "https://cdn.example/a.png", "content_type": "image/png", "filename": "a.png", "size": 2048},
                {"filename": "no-url.txt"}
            ],
            "pinned": true
        });
        let Normalized::Message(msg) = normalize(&RawMessageEnvelope::discord("42", record)) else {
            panic!("expected message");
        };
        assert_eq!(msg.message_id, "1100");
        assert_eq!(msg.channel_id, "42");
        assert_eq!(msg.guild_id, None);
        assert_eq!(msg.author_display_name, "ada");
        assert_eq!(msg.reply_to_message_id.as_deref(), Some("1099"));
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].size_bytes, Some(2048));
        assert!(msg.edited_at.unwrap() > msg.sent_at);
        assert!(msg.is_pinned);
    }

    #[test]
    fn discord_record_without_timestamp_is_malformed() {
        let record = json!({"id": "5", "author": {"id": "7"}, "content": "hi"});
        match normalize(&RawMessageEnvelope::discord("42", record)) {
            Normalized::Skipped(SkipReason::Malformed(err)) => {
                assert_eq!(err.message_id.as_deref(), Some("5"));
                assert_eq!(err.reason, "missing timestamp");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn telegram_text_entities_are_flattened() {
        let record = json!({
            "id": 12,
            "type": "message",
            "date": "2023-06-01T08:30:00",
            "date_unixtime": "1685608200",
            "from": "Grace",
            "from_id": "user99",
            "text": ["see ", {"type": "link", "text": "https://example.org"}, " now"],
            "reply_to_message_id": 11,
            "photo": "photos/photo_1.jpg",
            "file": "(File not included. Change data exporting settings to download.)"
        });
        let Normalized::Message(msg) = normalize(&RawMessageEnvelope::telegram_export("general", record))
        else {
            panic!("expected message");
        };
        assert_eq!(msg.body_text, "see https://example.org now");
        assert_eq!(msg.message_id, "12");
        assert_eq!(msg.reply_to_message_id.as_deref(), Some("11"));
        assert_eq!(msg.sent_at.timestamp(), 1_685_608_200);
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].filename.as_deref(), Some("photo_1.jpg"));
    }

    #[test]
    fn telegram_service_records_are_not_messages() {
        let record = json!({"id": 3, "type": "service", "action": "join_group_by_link", "date_unixtime": "1685608200"});
        assert!(matches!(
            normalize(&RawMessageEnvelope::telegram_export("general", record)),
            Normalized::Skipped(SkipReason::NotAMessage { .. })
        ));
    }

    #[test]
    fn discord_page_url_anchors_by_mode() {
        let http = Arc::new(HttpClient::new(Default::default()).unwrap());
        let source = DiscordHistorySource::new(
            http,
            DiscordConfig {
                api_base: "https://discord.com/api/v10/".into(),
                token: "t".into(),
            },
        );
        assert_eq!(
            source.page_url("42", SyncMode::Backfill, None, 500),
            "https://discord.com/api/v10/channels/42/messages?limit=100&after=0"
        );
        assert_eq!(
            source.page_url("42", SyncMode::Tail, None, 50),
            "https://discord.com/api/v10/channels/42/messages?limit=50"
        );
        let pos = MessagePosition::new("77", Utc::now());
        assert!(source
            .page_url("42", SyncMode::Tail, Some(&pos), 50)
            .ends_with("&after=77"));
    }

    #[tokio::test]
    async fn telegram_export_pages_after_cursor() {
        let dir = tempdir().unwrap();
        let chat = dir.path().join("general");
        std::fs::create_dir_all(&chat).unwrap();
        let messages: Vec<JsonValue> = (1..=5)
            .rev()
            .map(|id| json!({"id": id, "type": "message", "date_unixtime": format!("{}", 1_700_000_000 + id), "from": "a", "from_id": "user1", "text": "x"}))
            .collect();
        std::fs::write(
            chat.join(TELEGRAM_EXPORT_FILE),
            serde_json::to_vec(&json!({"name": "General", "type": "private_group", "messages": messages})).unwrap(),
        )
        .unwrap();

        let source = TelegramExportSource::new(dir.path());
        let first = source.fetch_page("general", SyncMode::Backfill, None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|e| e.record()["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2]);

        let cursor = envelope_position(&first[1]).unwrap();
        let next = source
            .fetch_page("general", SyncMode::Backfill, Some(&cursor), 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 3);

        let newest = source.fetch_page("general", SyncMode::Tail, None, 1).await.unwrap();
        assert_eq!(newest[0].record()["id"], 5);

        assert_eq!(list_export_channels(dir.path()).unwrap(), vec!["general".to_string()]);
    }

    fn write_export(dir: &Path, channel: &str, name: &str, ids: std::ops::RangeInclusive<i64>) {
        let chat = dir.join(channel);
        std::fs::create_dir_all(&chat).unwrap();
        let messages: Vec<JsonValue> = ids
            .map(|id| json!({"id": id, "type": "message", "date_unixtime": format!("{}", 1_700_000_000 + id), "from": "a", "from_id": "user1", "text": "x"}))
            .collect();
        std::fs::write(
            chat.join(TELEGRAM_EXPORT_FILE),
            serde_json::to_vec(&json!({"name": name, "type": "private_group", "messages": messages})).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn telegram_export_is_parsed_once_per_file_version() {
        let dir = tempdir().unwrap();
        write_export(dir.path(), "general", "General", 1..=25);
        let source = TelegramExportSource::new(dir.path());

        let mut cursor = None;
        let mut seen = 0;
        loop {
            let page = source
                .fetch_page("general", SyncMode::Backfill, cursor.as_ref(), 10)
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }
            seen += page.len();
            cursor = page.iter().filter_map(envelope_position).max();
        }
        assert_eq!(seen, 25);
        let info = source.channel_info("general").await.unwrap().unwrap();
        assert_eq!(info.name.as_deref(), Some("General"));
        assert_eq!(source.parse_count(), 1);

        write_export(dir.path(), "general", "General", 1..=40);
        let next = source
            .fetch_page("general", SyncMode::Backfill, cursor.as_ref(), 100)
            .await
            .unwrap();
        assert_eq!(next.len(), 15);
        assert_eq!(source.parse_count(), 2);
    }

    #[test]
    fn discord_channel_object_supplies_guild_and_name() {
        let info = discord_channel_info(&json!({"id": "42", "type": 0, "guild_id": "700", "name": "general"}));
        assert_eq!(info.guild_id.as_deref(), Some("700"));
        assert_eq!(info.name.as_deref(), Some("general"));

        let dm = discord_channel_info(&json!({"id": "43", "type": 1, "recipients": []}));
        assert_eq!(dm, ChannelInfo::default());
    }

    #[tokio::test]
    async fn telegram_export_missing_or_escaping_paths_are_unavailable() {
        let dir = tempdir().unwrap();
        let source = TelegramExportSource::new(dir.path());
        for channel in ["absent", "..", "a/b"] {
            let err = source
                .fetch_page(channel, SyncMode::Backfill, None, 10)
                .await
                .unwrap_err();
            assert!(matches!(err, SourceError::Unavailable(_)), "{channel}: {err}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_after_max_attempts() {
        let source = ScriptedSource::new(vec![]);
        let cursor = MessagePosition::new("10", Utc::now());
        let err = fetcher(4)
            .fetch_page(&source, "42", SyncMode::Backfill, Some(&cursor), 50)
            .await
            .unwrap_err();

        match err {
            FetchError::Exhausted {
                attempts, cursor: resume, ..
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(resume, Some(cursor));
            }
            other => panic!("unexpected {other:?}"),
        }

        let calls = source.call_times();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[0] <= g[1]), "{gaps:?}");
        assert!(gaps[0] >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let source = ScriptedSource::new(vec![Err(SourceError::Unavailable("403 Missing Access".into()))]);
        let err = fetcher(5)
            .fetch_page(&source, "42", SyncMode::Backfill, None, 50)
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(source.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_signal_is_honoured_and_page_reordered() {
        let newest_first = vec![
            RawMessageEnvelope::discord("42", discord_record("3", "2024-01-01T00:00:03+00:00")),
            RawMessageEnvelope::discord("42", discord_record("2", "2024-01-01T00:00:02+00:00")),
        ];
        let source = ScriptedSource::new(vec![
            Err(SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(3)),
            }),
            Ok(newest_first),
        ]);
        let page = fetcher(3)
            .fetch_page(&source, "42", SyncMode::Tail, None, 2)
            .await
            .unwrap();

        let calls = source.call_times();
        assert!(calls[1] - calls[0] >= Duration::from_secs(3));
        assert_eq!(page.attempts, 2);
        assert!(page.has_more);
        let ids: Vec<_> = page.envelopes.iter().map(|e| e.record()["id"].clone()).collect();
        assert_eq!(ids, vec![json!("2"), json!("3")]);
        assert_eq!(page.next_cursor.unwrap().message_id, "3");
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RetryObserver for RecordingObserver {
        async fn backing_off(&self, attempt: usize, delay: Duration, _error: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("backoff {attempt} {}ms", delay.as_millis()));
        }

        async fn retrying(&self, attempt: usize) {
            self.events.lock().unwrap().push(format!("retry {attempt}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_each_backoff_and_retry() {
        let source = ScriptedSource::new(vec![
            Err(SourceError::Transient("connection reset".into())),
            Err(SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            }),
            Ok(vec![RawMessageEnvelope::discord(
                "42",
                discord_record("1", "2024-01-01T00:00:01+00:00"),
            )]),
        ]);
        let observer = RecordingObserver::default();
        let page = fetcher(5)
            .fetch_page_observed(&source, "42", SyncMode::Backfill, None, 50, &observer)
            .await
            .unwrap();

        assert_eq!(page.attempts, 3);
        assert_eq!(
            *observer.events.lock().unwrap(),
            vec!["backoff 1 100ms", "retry 2", "backoff 2 2000ms", "retry 3"]
        );
    }

    #[test]
    fn http_errors_map_to_source_errors() {
        let forbidden = HttpError::Status {
            status: 403,
            url: "u".into(),
            body: "Missing Access".into(),
        };
        assert!(matches!(SourceError::from(forbidden), SourceError::Unavailable(_)));
        let bad_gateway = HttpError::Status {
            status: 502,
            url: "u".into(),
            body: String::new(),
        };
        assert!(matches!(SourceError::from(bad_gateway), SourceError::Transient(_)));
        let limited = HttpError::RateLimited {
            url: "u".into(),
            retry_after: Some(Duration::from_secs(1)),
        };
        assert!(matches!(
            SourceError::from(limited),
            SourceError::RateLimited { retry_after: Some(_) }
        ));
    }
}
