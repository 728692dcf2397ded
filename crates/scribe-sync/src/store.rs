//! Storage seams for the sync loop: the deduplicating message writer and the
//! monotonic cursor store, plus the in-memory implementation used by tests
//! and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scribe_core::{
    ArchiveStats, CanonicalMessage, ChannelCount, ChannelKey, CommitResult, MessagePosition,
    NaturalKey, SyncCursor, SyncMode,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CommitFailure {
    #[error("database error during batch commit: {0}")]
    Database(#[from] sqlx::Error),
    #[error("batch commit failed: {0}")]
    Storage(String),
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Upsert a batch atomically: either every record is applied or none is.
    async fn commit_batch(&self, batch: &[CanonicalMessage]) -> Result<CommitResult, CommitFailure>;

    async fn stats(&self) -> Result<ArchiveStats>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced,
    Unchanged,
    /// The proposed position is older than what is stored; nothing changed.
    RejectedStale { stored: MessagePosition },
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, key: &ChannelKey, mode: SyncMode) -> Result<Option<SyncCursor>>;

    async fn advance(
        &self,
        key: &ChannelKey,
        mode: SyncMode,
        position: &MessagePosition,
    ) -> Result<AdvanceOutcome>;

    /// Administrative removal; returns whether a cursor existed.
    async fn reset(&self, key: &ChannelKey, mode: SyncMode) -> Result<bool>;
}

/// Fields of a stored row the write decision needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredVersion {
    pub content_hash: String,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    Insert,
    Overwrite,
    Skip,
}

/// An absent `edited_at` is the original and orders before any edit.
pub fn decide(stored: Option<&StoredVersion>, incoming: &CanonicalMessage, incoming_hash: &str) -> WriteDecision {
    match stored {
        None => WriteDecision::Insert,
        Some(stored) if stored.content_hash == incoming_hash => WriteDecision::Skip,
        Some(stored) if incoming.edited_at > stored.edited_at => WriteDecision::Overwrite,
        Some(_) => WriteDecision::Skip,
    }
}

/// SHA-256 over every mutable field of the message, hex encoded.
pub fn content_hash(message: &CanonicalMessage) -> String {
    let fields = serde_json::json!([
        message.guild_id,
        message.channel_name,
        message.author_id,
        message.author_display_name,
        message.sent_at,
        message.body_text,
        message.reply_to_message_id,
        message.attachments,
        message.edited_at,
        message.is_pinned,
    ]);
    let mut hasher = Sha256::new();
    hasher.update(fields.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare a proposed cursor against the stored one.
pub fn advance_outcome(
    key: &ChannelKey,
    mode: SyncMode,
    stored: Option<&MessagePosition>,
    proposed: &MessagePosition,
) -> AdvanceOutcome {
    match stored {
        None => AdvanceOutcome::Advanced,
        Some(stored) if proposed > stored => AdvanceOutcome::Advanced,
        Some(stored) if proposed == stored => AdvanceOutcome::Unchanged,
        Some(stored) => {
            warn!(channel = %key, %mode, %stored, %proposed, "rejecting out-of-order cursor advance");
            AdvanceOutcome::RejectedStale {
                stored: stored.clone(),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: CanonicalMessage,
    content_hash: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    messages: BTreeMap<NaturalKey, StoredMessage>,
    cursors: BTreeMap<(ChannelKey, SyncMode), SyncCursor>,
}

/// Process-local store with the same semantics as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failing_commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail without touching stored state.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn message(&self, key: &NaturalKey) -> Option<CanonicalMessage> {
        self.lock().messages.get(key).map(|stored| stored.message.clone())
    }

    pub fn messages(&self) -> Vec<CanonicalMessage> {
        self.lock()
            .messages
            .values()
            .map(|stored| stored.message.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn commit_batch(&self, batch: &[CanonicalMessage]) -> Result<CommitResult, CommitFailure> {
        if self.take_injected_failure() {
            return Err(CommitFailure::Storage("injected failure".to_string()));
        }

        let mut state = self.lock();
        let mut staged: BTreeMap<NaturalKey, StoredMessage> = BTreeMap::new();
        let mut result = CommitResult::default();

        for message in batch {
            let key = message.natural_key();
            let hash = content_hash(message);
            let stored = staged
                .get(&key)
                .or_else(|| state.messages.get(&key))
                .map(|s| StoredVersion {
                    content_hash: s.content_hash.clone(),
                    edited_at: s.message.edited_at,
                });
            match decide(stored.as_ref(), message, &hash) {
                WriteDecision::Insert => result.written += 1,
                WriteDecision::Overwrite => result.updated += 1,
                WriteDecision::Skip => {
                    result.skipped += 1;
                    continue;
                }
            }
            staged.insert(
                key,
                StoredMessage {
                    message: message.clone(),
                    content_hash: hash,
                },
            );
        }

        state.messages.extend(staged);
        Ok(result)
    }

    async fn stats(&self) -> Result<ArchiveStats> {
        let state = self.lock();
        let mut per_channel: BTreeMap<ChannelKey, i64> = BTreeMap::new();
        let mut stats = ArchiveStats::default();
        for stored in state.messages.values() {
            let message = &stored.message;
            stats.total_messages += 1;
            stats.attachment_count += message.attachments.len() as i64;
            stats.earliest_sent_at = Some(
                stats
                    .earliest_sent_at
                    .map_or(message.sent_at, |t| t.min(message.sent_at)),
            );
            stats.latest_sent_at = Some(
                stats
                    .latest_sent_at
                    .map_or(message.sent_at, |t| t.max(message.sent_at)),
            );
            *per_channel
                .entry(ChannelKey::new(message.source, message.channel_id.clone()))
                .or_default() += 1;
        }
        stats.channels = per_channel
            .into_iter()
            .map(|(key, messages)| ChannelCount {
                source: key.source,
                channel_id: key.channel_id,
                messages,
            })
            .collect();
        stats
            .channels
            .sort_by(|a, b| b.messages.cmp(&a.messages));
        Ok(stats)
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get(&self, key: &ChannelKey, mode: SyncMode) -> Result<Option<SyncCursor>> {
        Ok(self.lock().cursors.get(&(key.clone(), mode)).cloned())
    }

    async fn advance(
        &self,
        key: &ChannelKey,
        mode: SyncMode,
        position: &MessagePosition,
    ) -> Result<AdvanceOutcome> {
        let mut state = self.lock();
        let slot = (key.clone(), mode);
        let stored = state.cursors.get(&slot).map(SyncCursor::position);
        let outcome = advance_outcome(key, mode, stored.as_ref(), position);
        if outcome == AdvanceOutcome::Advanced {
            state.cursors.insert(
                slot,
                SyncCursor {
                    source: key.source,
                    channel_id: key.channel_id.clone(),
                    mode,
                    last_message_id: position.message_id.clone(),
                    last_sent_at: position.sent_at,
                    updated_at: Utc::now(),
                },
            );
        }
        Ok(outcome)
    }

    async fn reset(&self, key: &ChannelKey, mode: SyncMode) -> Result<bool> {
        Ok(self.lock().cursors.remove(&(key.clone(), mode)).is_some())
    }
}
