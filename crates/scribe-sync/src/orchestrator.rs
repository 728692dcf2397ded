//! Per-channel sync loop: fetch, normalize, commit, then advance the cursor.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use async_trait::async_trait;
use scribe_adapters::{normalize_page, FetchError, Fetcher, MessageSource, RetryObserver};
use scribe_core::{
    ChannelInfo, ChannelKey, ChannelStatus, CommitResult, MessagePosition, SyncMode, SyncState,
};
use scribe_storage::BackoffPolicy;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::store::{AdvanceOutcome, CommitFailure, CursorStore, MessageStore};

/// Shared, in-process view of every channel loop's progress.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<BTreeMap<(ChannelKey, SyncMode), ChannelStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, status: ChannelStatus) {
        let slot = (status.key(), status.mode);
        self.inner.write().await.insert(slot, status);
    }

    pub async fn update(&self, key: &ChannelKey, mode: SyncMode, f: impl FnOnce(&mut ChannelStatus)) {
        let mut guard = self.inner.write().await;
        let status = guard
            .entry((key.clone(), mode))
            .or_insert_with(|| ChannelStatus::new(key, mode, None));
        f(status);
        status.updated_at = Utc::now();
    }

    pub async fn snapshot(&self) -> Vec<ChannelStatus> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn channel(&self, key: &ChannelKey) -> Vec<ChannelStatus> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|(_, status)| status.clone())
            .collect()
    }

    pub async fn get(&self, key: &ChannelKey, mode: SyncMode) -> Option<ChannelStatus> {
        self.inner.read().await.get(&(key.clone(), mode)).cloned()
    }
}

/// Mirrors fetch retries onto the status board: `Backoff` while waiting,
/// `Fetching` again once the next attempt starts.
struct BoardRetries<'a> {
    board: &'a StatusBoard,
    key: &'a ChannelKey,
    mode: SyncMode,
}

#[async_trait]
impl<'a> RetryObserver for BoardRetries<'a> {
    async fn backing_off(&self, attempt: usize, delay: Duration, error: &str) {
        let message = format!("attempt {attempt} failed: {error}");
        debug!(channel = %self.key, mode = %self.mode, attempt, delay_ms = delay.as_millis() as u64, "fetch backing off");
        self.board
            .update(self.key, self.mode, |status| {
                status.state = SyncState::Backoff;
                status.last_error = Some(message);
            })
            .await;
    }

    async fn retrying(&self, _attempt: usize) {
        self.board
            .update(self.key, self.mode, |status| status.state = SyncState::Fetching)
            .await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Stop,
}

/// Run/pause/stop switches for every registered channel loop.
#[derive(Debug, Clone, Default)]
pub struct ControlPanel {
    senders: Arc<StdMutex<BTreeMap<(ChannelKey, SyncMode), watch::Sender<Control>>>>,
}

impl ControlPanel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a loop to the switch for `(key, mode)`, creating it on first use.
    pub fn register(&self, key: &ChannelKey, mode: SyncMode) -> watch::Receiver<Control> {
        let mut senders = self.lock();
        senders
            .entry((key.clone(), mode))
            .or_insert_with(|| watch::channel(Control::Run).0)
            .subscribe()
    }

    pub fn pause(&self, key: &ChannelKey) -> bool {
        self.set(key, Control::Pause)
    }

    pub fn resume(&self, key: &ChannelKey) -> bool {
        self.set(key, Control::Run)
    }

    pub fn stop(&self, key: &ChannelKey) -> bool {
        self.set(key, Control::Stop)
    }

    pub fn stop_all(&self) {
        for sender in self.lock().values() {
            sender.send_replace(Control::Stop);
        }
    }

    /// Applies to every mode of the channel; false when none is registered.
    fn set(&self, key: &ChannelKey, control: Control) -> bool {
        let senders = self.lock();
        let mut found = false;
        for ((k, _), sender) in senders.iter() {
            if k == key {
                sender.send_replace(control);
                found = true;
            }
        }
        found
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(ChannelKey, SyncMode), watch::Sender<Control>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub page_size: usize,
    pub poll_interval: Duration,
    /// Tries per batch before the cycle falls back to loop backoff.
    pub commit_attempts: usize,
    pub commit_backoff: BackoffPolicy,
    /// Delay schedule between failed cycles.
    pub loop_backoff: BackoffPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            poll_interval: Duration::from_secs(30),
            commit_attempts: 3,
            commit_backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
            },
            loop_backoff: BackoffPolicy {
                max_attempts: usize::MAX,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(300),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("commit failed after {attempts} attempts: {source}")]
    Commit {
        attempts: usize,
        #[source]
        source: CommitFailure,
    },
    #[error("cursor store error: {0:#}")]
    Cursor(anyhow::Error),
    #[error("interrupted by control signal")]
    Interrupted,
}

/// What one fetch→normalize→commit→advance iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub commit: CommitResult,
    /// Records the normalizer dropped.
    pub skipped_records: usize,
    pub cursor: Option<MessagePosition>,
    pub advance: Option<AdvanceOutcome>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Backfill reached the end of history.
    Completed,
    Stopped,
    Failed(String),
}

/// Drives one `(source, channel, mode)` through the sync state machine.
pub struct ChannelSync {
    key: ChannelKey,
    mode: SyncMode,
    source: Arc<dyn MessageSource>,
    fetcher: Fetcher,
    messages: Arc<dyn MessageStore>,
    cursors: Arc<dyn CursorStore>,
    board: StatusBoard,
    settings: SyncSettings,
    control: watch::Receiver<Control>,
    /// Looked up on the first cycle, then reused.
    channel_info: Option<ChannelInfo>,
}

impl ChannelSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: ChannelKey,
        mode: SyncMode,
        source: Arc<dyn MessageSource>,
        fetcher: Fetcher,
        messages: Arc<dyn MessageStore>,
        cursors: Arc<dyn CursorStore>,
        board: StatusBoard,
        settings: SyncSettings,
        control: watch::Receiver<Control>,
    ) -> Self {
        Self {
            key,
            mode,
            source,
            fetcher,
            messages,
            cursors,
            board,
            settings,
            control,
            channel_info: None,
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Where the next page starts. Tail falls back to the backfill cursor
    /// so it picks up where history ingestion stopped.
    pub async fn resume_position(&self) -> anyhow::Result<Option<MessagePosition>> {
        if let Some(cursor) = self.cursors.get(&self.key, self.mode).await? {
            return Ok(Some(cursor.position()));
        }
        if self.mode == SyncMode::Tail {
            if let Some(cursor) = self.cursors.get(&self.key, SyncMode::Backfill).await? {
                return Ok(Some(cursor.position()));
            }
        }
        Ok(None)
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let start = self.resume_position().await.map_err(CycleError::Cursor)?;

        self.set_state(SyncState::Fetching).await;
        let source = self.source.clone();
        let retries = BoardRetries {
            board: &self.board,
            key: &self.key,
            mode: self.mode,
        };
        let info = if let Some(info) = self.channel_info.clone() {
            info
        } else {
            let lookup = self
                .fetcher
                .channel_info(source.as_ref(), &self.key.channel_id, &retries);
            let info = tokio::select! {
                info = lookup => info?.unwrap_or_default(),
                _ = halted(&mut self.control) => return Err(CycleError::Interrupted),
            };
            self.channel_info = Some(info.clone());
            info
        };

        let fetch = self.fetcher.fetch_page_observed(
            source.as_ref(),
            &self.key.channel_id,
            self.mode,
            start.as_ref(),
            self.settings.page_size,
            &retries,
        );
        let page = tokio::select! {
            page = fetch => page?,
            _ = halted(&mut self.control) => return Err(CycleError::Interrupted),
        };

        self.set_state(SyncState::Normalizing).await;
        let mut batch = normalize_page(&page.envelopes);
        for message in &mut batch.messages {
            info.stamp(message);
        }

        self.set_state(SyncState::Committing).await;
        let commit = self.commit_with_retry(&batch.messages).await?;

        let advance = match &page.next_cursor {
            Some(position) => Some(
                self.cursors
                    .advance(&self.key, self.mode, position)
                    .await
                    .map_err(CycleError::Cursor)?,
            ),
            None => None,
        };

        let report = CycleReport {
            fetched: page.envelopes.len(),
            commit,
            skipped_records: batch.skipped.len(),
            cursor: page.next_cursor.clone(),
            advance,
            has_more: page.has_more && page.next_cursor.is_some(),
        };
        if page.has_more && page.next_cursor.is_none() {
            warn!(channel = %self.key, mode = %self.mode, "full page without a readable position; stopping pagination");
        }

        let cursor = match &report.advance {
            Some(AdvanceOutcome::Advanced) => report.cursor.clone(),
            _ => None,
        };
        self.board
            .update(&self.key, self.mode, |status| {
                status.state = SyncState::CursorAdvanced;
                if cursor.is_some() {
                    status.last_cursor = cursor;
                }
                status.last_error = None;
                status.pages_committed += 1;
                status.messages_written += commit.written;
                status.messages_updated += commit.updated;
                status.records_skipped += report.skipped_records as u64;
            })
            .await;

        debug!(
            channel = %self.key,
            mode = %self.mode,
            fetched = report.fetched,
            written = commit.written,
            updated = commit.updated,
            skipped = commit.skipped,
            malformed = report.skipped_records,
            "cycle committed"
        );
        Ok(report)
    }

    /// The commit itself is never raced against the stop signal.
    async fn commit_with_retry(
        &self,
        batch: &[scribe_core::CanonicalMessage],
    ) -> Result<CommitResult, CycleError> {
        let attempts = self.settings.commit_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.messages.commit_batch(batch).await {
                Ok(result) => return Ok(result),
                Err(err) if attempt + 1 < attempts => {
                    let delay = self.settings.commit_backoff.delay_for_attempt(attempt);
                    warn!(channel = %self.key, attempt = attempt + 1, error = %err, "batch commit failed; retrying same batch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => return Err(CycleError::Commit { attempts, source }),
            }
        }
    }

    /// Run cycles until backfill completes, the channel fails permanently,
    /// or a stop signal arrives.
    pub async fn run(&mut self) -> RunOutcome {
        let span = info_span!("channel_sync", channel = %self.key, mode = %self.mode);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(&mut self) -> RunOutcome {
        if let Ok(Some(position)) = self.resume_position().await {
            self.board
                .update(&self.key, self.mode, |status| status.last_cursor = Some(position))
                .await;
        }
        info!("channel sync started");

        let mut failures = 0usize;
        loop {
            if !self.wait_until_runnable().await {
                self.set_state(SyncState::Paused).await;
                info!("channel sync stopped");
                return RunOutcome::Stopped;
            }

            match self.run_cycle().await {
                Ok(report) => {
                    failures = 0;
                    if report.has_more {
                        continue;
                    }
                    self.set_state(SyncState::Idle).await;
                    match self.mode {
                        SyncMode::Backfill => {
                            info!("backfill complete");
                            return RunOutcome::Completed;
                        }
                        SyncMode::Tail => self.interruptible_sleep(self.settings.poll_interval).await,
                    }
                }
                Err(CycleError::Interrupted) => continue,
                Err(CycleError::Fetch(err)) if err.is_permanent() => {
                    let reason = err.to_string();
                    warn!(error = %reason, "channel unavailable; giving up");
                    self.board
                        .update(&self.key, self.mode, |status| {
                            status.state = SyncState::Failed;
                            status.last_error = Some(reason.clone());
                        })
                        .await;
                    return RunOutcome::Failed(reason);
                }
                Err(err) => {
                    let delay = self.settings.loop_backoff.delay_for_attempt(failures);
                    failures += 1;
                    let message = err.to_string();
                    warn!(error = %message, delay_ms = delay.as_millis() as u64, "cycle failed; backing off");
                    self.board
                        .update(&self.key, self.mode, |status| {
                            status.state = SyncState::Backoff;
                            status.last_error = Some(message);
                        })
                        .await;
                    self.interruptible_sleep(delay).await;
                }
            }
        }
    }

    /// Block while paused. Returns false once the loop should stop.
    async fn wait_until_runnable(&mut self) -> bool {
        loop {
            let current = *self.control.borrow_and_update();
            match current {
                // A closed switch means the panel is gone; treat it as stop.
                Control::Run => return self.control.has_changed().is_ok(),
                Control::Stop => return false,
                Control::Pause => {
                    self.set_state(SyncState::Paused).await;
                    debug!("paused");
                    if self.control.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn interruptible_sleep(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = halted(&mut self.control) => {}
        }
    }

    async fn set_state(&self, state: SyncState) {
        self.board
            .update(&self.key, self.mode, |status| status.state = state)
            .await;
    }
}

/// Resolves once the control leaves `Run` or its sender is gone.
async fn halted(control: &mut watch::Receiver<Control>) {
    let _ = control.wait_for(|c| *c != Control::Run).await;
}
