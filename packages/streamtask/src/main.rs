use clap::Parser;
use std::sync::Arc;
use streamtask::{
    cli::{Cli, Commands},
    config::EngineConfig,
    storage::SqliteEventSink,
    StreamingTaskRegistry,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamtask=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env()?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    match cli.command {
        Commands::History { task_id } => {
            let sink = SqliteEventSink::open(&config.database_path)?;
            let events = sink.events_for_task(&task_id)?;

            if events.is_empty() {
                println!("No events recorded for task {}.", task_id);
                return Ok(());
            }

            println!("{:<26} {:<12} {}", "Timestamp", "Event", "Data");
            println!("{}", "-".repeat(80));
            for event in events {
                println!(
                    "{:<26} {:<12} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    event.event_type.as_str(),
                    event.data
                );
            }
        }
        Commands::Tasks { limit } => {
            let sink = SqliteEventSink::open(&config.database_path)?;
            let summaries = sink.task_summaries(limit)?;

            if summaries.is_empty() {
                println!("No tasks recorded.");
                return Ok(());
            }

            println!(
                "{:<40} {:<8} {:<12} {:<20}",
                "Task", "Events", "Last event", "Last update"
            );
            println!("{}", "-".repeat(83));
            for summary in summaries {
                println!(
                    "{:<40} {:<8} {:<12} {:<20}",
                    summary.task_id,
                    summary.event_count,
                    summary.last_event.as_str(),
                    summary.last_timestamp.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Demo(args) => {
            if let Some(max) = args.max_concurrent {
                config.max_concurrent_tasks = (max > 0).then_some(max);
            }

            info!("🚀 Starting streamtask v{}", VERSION);
            info!("📋 Configuration loaded:");
            info!("   Database: {:?}", config.database_path);
            info!("   Max concurrent tasks: {:?}", config.max_concurrent_tasks);
            info!("   Event queue capacity: {}", config.event_queue_capacity);
            match config.cleanup_interval() {
                Some(interval) => info!(
                    "   Cleanup: every {:?}, retaining {}",
                    interval, config.retain_finished
                ),
                None => info!("   Cleanup: disabled"),
            }

            let registry = Arc::new(StreamingTaskRegistry::new(config.registry_config()));
            let sink = SqliteEventSink::open(&config.database_path)?;
            registry.set_event_sink(Arc::new(sink));
            if let Some(interval) = config.cleanup_interval() {
                registry
                    .clone()
                    .start_auto_cleanup(interval, config.retain_finished);
            }

            // Live progress from the registry feed
            let mut feed = registry.subscribe();
            let monitor = tokio::spawn(async move {
                loop {
                    match feed.recv().await {
                        Ok(event) => {
                            debug!("{} {} {}", event.task_id, event.event_type, event.data)
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Progress monitor fell behind, skipped {} events", missed)
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            let outcomes = args.execute(registry.clone()).await?;
            registry.flush_events().await;
            monitor.abort();

            println!();
            println!("{:<24} {:<12} {}", "Task", "Status", "Detail");
            println!("{}", "-".repeat(80));
            for outcome in &outcomes {
                println!(
                    "{:<24} {:<12} {}",
                    outcome.task_id,
                    outcome
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "rejected".to_string()),
                    outcome.detail
                );
            }

            let stats = registry.get_stats();
            println!();
            println!(
                "Tasks: {} total, {} completed, {} failed, {} cancelled",
                stats.total_tasks, stats.completed_tasks, stats.failed_tasks, stats.cancelled_tasks
            );
            println!(
                "Events: {} persisted, {} dropped, {} failed to persist",
                stats.persisted_events, stats.dropped_events, stats.persist_failures
            );
            println!(
                "History: streamtask history {}",
                outcomes
                    .first()
                    .map(|o| o.task_id.as_str())
                    .unwrap_or("<task-id>")
            );
        }
    }

    Ok(())
}
