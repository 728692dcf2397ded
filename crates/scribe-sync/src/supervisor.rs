use std::sync::Arc;

use anyhow::{Context, Result};
use scribe_adapters::{Fetcher, SourceRegistry};
use scribe_core::{ChannelKey, ChannelStatus, Source, SyncMode};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::orchestrator::{ChannelSync, ControlPanel, RunOutcome, StatusBoard, SyncSettings};
use crate::store::{CursorStore, MessageStore};
use crate::{ChannelConfig, ChannelRegistry};

/// Everything a channel loop shares with its siblings.
#[derive(Clone)]
pub struct SyncContext {
    pub fetcher: Fetcher,
    pub sources: SourceRegistry,
    pub messages: Arc<dyn MessageStore>,
    pub cursors: Arc<dyn CursorStore>,
    pub board: StatusBoard,
    pub controls: ControlPanel,
    pub settings: SyncSettings,
}

impl SyncContext {
    pub fn channel_sync(&self, key: &ChannelKey, mode: SyncMode) -> Result<ChannelSync> {
        let source = self
            .sources
            .get(key.source)
            .with_context(|| format!("no message source configured for {}", key.source))?;
        Ok(ChannelSync::new(
            key.clone(),
            mode,
            source,
            self.fetcher.clone(),
            self.messages.clone(),
            self.cursors.clone(),
            self.board.clone(),
            self.settings,
            self.controls.register(key, mode),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRunReport {
    pub key: ChannelKey,
    pub mode: SyncMode,
    pub outcome: RunOutcome,
}

/// One task per `(channel, mode)`, all sharing one limiter and one store.
pub struct SyncSupervisor {
    ctx: SyncContext,
    tasks: JoinSet<ChannelRunReport>,
}

impl SyncSupervisor {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            tasks: JoinSet::new(),
        }
    }

    pub fn board(&self) -> &StatusBoard {
        &self.ctx.board
    }

    pub fn controls(&self) -> &ControlPanel {
        &self.ctx.controls
    }

    pub async fn spawn(&mut self, channel: &ChannelConfig, mode: SyncMode) -> Result<()> {
        let key = channel.key();
        let mut sync = self.ctx.channel_sync(&key, mode)?;
        self.ctx
            .board
            .register(ChannelStatus::new(&key, mode, channel.label.clone()))
            .await;
        self.tasks.spawn(async move {
            let outcome = sync.run().await;
            ChannelRunReport { key, mode, outcome }
        });
        Ok(())
    }

    /// Spawn every enabled channel in each of its modes that `modes` allows.
    /// Channels whose source is not configured are skipped with a warning.
    pub async fn spawn_registry(&mut self, registry: &ChannelRegistry, modes: &[SyncMode]) -> Result<usize> {
        let mut spawned = 0;
        for channel in registry.enabled() {
            if !self.ctx.sources.contains(channel.source) {
                warn!(channel = %channel.key(), "source not configured; channel skipped");
                continue;
            }
            for mode in channel.modes.iter().filter(|m| modes.contains(m)) {
                self.spawn(channel, *mode).await?;
                spawned += 1;
            }
        }
        info!(spawned, "channel loops started");
        Ok(spawned)
    }

    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every loop to finish. A panicking loop is logged and does
    /// not take the others down.
    pub async fn join_all(&mut self) -> Vec<ChannelRunReport> {
        let mut reports = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(report) => {
                    info!(channel = %report.key, mode = %report.mode, outcome = ?report.outcome, "channel loop finished");
                    reports.push(report);
                }
                Err(err) => error!(error = %err, "channel task aborted"),
            }
        }
        reports
    }

    pub async fn shutdown(mut self) -> Vec<ChannelRunReport> {
        self.ctx.controls.stop_all();
        self.join_all().await
    }
}

/// Periodic re-import of Telegram export channels, which cannot be tailed.
pub async fn maybe_build_scheduler(
    enabled: bool,
    cron: &str,
    ctx: SyncContext,
    registry: &ChannelRegistry,
) -> Result<Option<JobScheduler>> {
    if !enabled {
        return Ok(None);
    }

    let channels: Vec<ChannelKey> = registry
        .enabled()
        .filter(|c| c.source == Source::TelegramExport)
        .map(ChannelConfig::key)
        .collect();
    if channels.is_empty() {
        info!("no export channels registered; scheduler not started");
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let ctx = ctx.clone();
        let channels = channels.clone();
        Box::pin(async move {
            info!(channels = channels.len(), "scheduled export re-import triggered");
            for key in channels {
                match ctx.channel_sync(&key, SyncMode::Backfill) {
                    Ok(mut sync) => {
                        let outcome = sync.run().await;
                        info!(channel = %key, outcome = ?outcome, "export re-import finished");
                    }
                    Err(err) => warn!(channel = %key, error = %err, "export re-import skipped"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
