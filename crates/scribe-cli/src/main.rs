use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scribe_core::{ChannelKey, Source, SyncMode};
use scribe_sync::{
    connect_with_retry, maybe_build_scheduler, run_migrations, ChannelConfig, ChannelRegistry,
    ChannelRunReport, CursorStore, MemoryStore, MessageStore, PgStore, RunOutcome, SyncConfig,
    SyncSupervisor,
};
use scribe_web::AppState;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "scribe-cli")]
#[command(about = "Resumable Discord and Telegram export archiver")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Backfill history once and exit.
    Backfill {
        /// Only this channel, as `source/channel_id`.
        #[arg(long)]
        channel: Option<String>,
        /// Use an in-memory store; nothing is persisted.
        #[arg(long)]
        dry_run: bool,
    },
    /// Backfill, then tail every channel and serve status until Ctrl-C.
    Run {
        #[arg(long)]
        no_web: bool,
    },
    /// Serve archive statistics without running any sync loop.
    Serve,
    Stats,
    /// Remove stored cursors so the next sync starts over.
    ResetCursor {
        source: Source,
        channel_id: String,
        /// Defaults to both modes.
        #[arg(long)]
        mode: Option<SyncMode>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { no_web: false }) {
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Backfill { channel, dry_run } => backfill(&config, channel, dry_run).await?,
        Commands::Run { no_web } => run(&config, no_web).await?,
        Commands::Serve => {
            let store = open_store(&config).await?;
            let ctx = config.build_context(store.clone(), store.clone())?;
            let state = AppState::new(ctx.board, ctx.controls).with_store(store);
            scribe_web::serve(state, config.web_port, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            print_stats(store.as_ref()).await?;
        }
        Commands::ResetCursor {
            source,
            channel_id,
            mode,
        } => {
            let store = open_store(&config).await?;
            let key = ChannelKey::new(source, channel_id);
            let modes = match mode {
                Some(mode) => vec![mode],
                None => vec![SyncMode::Backfill, SyncMode::Tail],
            };
            for mode in modes {
                let removed = store.reset(&key, mode).await?;
                println!(
                    "{key} {mode}: {}",
                    if removed { "cursor removed" } else { "no cursor stored" }
                );
            }
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let pool = connect_with_retry(&config.database_url, config.db_connect_backoff()).await?;
    run_migrations(&pool).await?;
    Ok(Arc::new(PgStore::new(pool)))
}

fn load_registry(config: &SyncConfig) -> Result<ChannelRegistry> {
    ChannelRegistry::load(&config.channels_file)?.with_export_channels(&config.export_dir)
}

fn parse_channel(value: &str) -> Result<ChannelKey> {
    let (source, channel_id) = value
        .split_once('/')
        .with_context(|| format!("expected source/channel_id, got {value:?}"))?;
    Ok(ChannelKey::new(source.parse()?, channel_id))
}

async fn backfill(config: &SyncConfig, channel: Option<String>, dry_run: bool) -> Result<()> {
    let (messages, cursors): (Arc<dyn MessageStore>, Arc<dyn CursorStore>) = if dry_run {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), store)
    } else {
        let store = open_store(config).await?;
        (store.clone(), store)
    };
    let registry = load_registry(config)?;
    let ctx = config.build_context(messages.clone(), cursors)?;
    let mut supervisor = SyncSupervisor::new(ctx);

    match channel {
        Some(value) => {
            let key = parse_channel(&value)?;
            let channel = registry.find(&key).cloned().unwrap_or_else(|| ChannelConfig {
                source: key.source,
                channel_id: key.channel_id.clone(),
                label: None,
                modes: vec![SyncMode::Backfill],
                enabled: true,
            });
            supervisor.spawn(&channel, SyncMode::Backfill).await?;
        }
        None => {
            supervisor
                .spawn_registry(&registry, &[SyncMode::Backfill])
                .await?;
        }
    }

    let controls = supervisor.controls().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stopping after in-flight commits");
            controls.stop_all();
        }
    });

    let statuses = supervisor.board().clone();
    let reports = supervisor.join_all().await;
    for status in statuses.snapshot().await {
        println!(
            "{} {}: {} pages, {} written, {} updated, {} skipped, cursor {}",
            status.key(),
            status.mode,
            status.pages_committed,
            status.messages_written,
            status.messages_updated,
            status.records_skipped,
            status
                .last_cursor
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
    }
    if dry_run {
        print_stats(messages.as_ref()).await?;
    }
    fail_on_failures(&reports)
}

async fn run(config: &SyncConfig, no_web: bool) -> Result<()> {
    let store = open_store(config).await?;
    let registry = load_registry(config)?;
    let ctx = config.build_context(store.clone(), store.clone())?;

    let scheduler = maybe_build_scheduler(
        config.scheduler_enabled,
        &config.import_cron,
        ctx.clone(),
        &registry,
    )
    .await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.import_cron, "export re-import scheduler started");
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let web = if no_web {
        None
    } else {
        let state = AppState::new(ctx.board.clone(), ctx.controls.clone()).with_store(store.clone());
        Some(tokio::spawn(scribe_web::serve(
            state,
            config.web_port,
            async move {
                let _ = stop_rx.wait_for(|stopped| *stopped).await;
            },
        )))
    };

    let mut supervisor = SyncSupervisor::new(ctx);
    supervisor
        .spawn_registry(&registry, &[SyncMode::Backfill, SyncMode::Tail])
        .await?;

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    info!("shutdown requested; stopping channel loops");
    let reports = supervisor.shutdown().await;

    stop_tx.send_replace(true);
    if let Some(web) = web {
        web.await.context("status server task")??;
    }
    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    fail_on_failures(&reports)
}

async fn print_stats(store: &dyn MessageStore) -> Result<()> {
    let stats = store.stats().await?;
    println!("Total messages: {}", stats.total_messages);
    match (stats.earliest_sent_at, stats.latest_sent_at) {
        (Some(first), Some(last)) => println!(
            "Date range: {} to {}",
            first.format("%Y-%m-%d %H:%M"),
            last.format("%Y-%m-%d %H:%M")
        ),
        _ => println!("Date range: n/a"),
    }
    println!("Attachments: {}", stats.attachment_count);
    if !stats.channels.is_empty() {
        println!("Top channels:");
        for channel in stats.channels.iter().take(10) {
            println!("  {}/{}: {}", channel.source, channel.channel_id, channel.messages);
        }
    }
    Ok(())
}

fn fail_on_failures(reports: &[ChannelRunReport]) -> Result<()> {
    let failed: Vec<String> = reports
        .iter()
        .filter_map(|r| match &r.outcome {
            RunOutcome::Failed(reason) => Some(format!("{} {}: {reason}", r.key, r.mode)),
            _ => None,
        })
        .collect();
    if !failed.is_empty() {
        bail!("{} channel loop(s) failed:\n{}", failed.len(), failed.join("\n"));
    }
    Ok(())
}
