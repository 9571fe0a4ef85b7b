use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ChatApi, EventHandler, GlobalState, LocalEventSource, LogicRegistry,
    MissingChatApi, SequentialEventHandler, SyncManager,
};
use shared::{
    domain::{Cid, User, UserId},
    event::ChatEvent,
};
use storage::{prepare_database_url, Repository, Storage};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `database_url` from sync.toml and `APP__DATABASE_URL`.
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feeds a JSON-lines event file through the handler.
    Run {
        #[arg(long)]
        events: PathBuf,
        /// Channels to open views for, as `<type>:<id>`.
        #[arg(long = "watch")]
        watch: Vec<Cid>,
        /// Handle the whole file as one awaited batch instead of socket
        /// traffic.
        #[arg(long)]
        single_batch: bool,
        /// Time to wait for socket batches to drain.
        #[arg(long, default_value_t = 500)]
        settle_ms: u64,
    },
    /// Prints the stored sync checkpoints of the user.
    SyncState,
}

fn read_events(path: &PathBuf) -> Result<Vec<ChatEvent>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read events from {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid event", path.display(), index + 1))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open {database_url}"))?;
    let user_id = UserId::new(cli.user_id);

    match cli.command {
        Command::Run {
            events,
            watch,
            single_batch,
            settle_ms,
        } => {
            let events = read_events(&events)?;
            info!(events = events.len(), "replay: loaded events");

            let repository: Arc<dyn Repository> = Arc::new(storage);
            let api: Arc<dyn ChatApi> = Arc::new(MissingChatApi);
            let source = LocalEventSource::new();
            let global_state = Arc::new(GlobalState::new());
            let registry = Arc::new(LogicRegistry::new(Arc::clone(&global_state)));
            let handler = SequentialEventHandler::new(
                settings.handler_config(),
                Arc::new(source.clone()),
                Arc::clone(&registry),
                Arc::clone(&global_state),
                Arc::clone(&repository),
                Arc::new(SyncManager::new(Arc::clone(&repository), api)),
            );
            for cid in &watch {
                registry.channel(cid).await;
            }

            handler.start_listening(User::new(user_id.as_str())).await;
            if single_batch {
                if let Err(err) = handler.handle_events(events).await {
                    println!("batch failed: {err}");
                }
            } else {
                for event in events {
                    source.emit(event);
                }
                tokio::time::sleep(Duration::from_millis(settle_ms)).await;
            }

            println!(
                "session={:?} total_unread={} unread_channels={} dropped={}",
                global_state.session_state(),
                global_state.total_unread_count(),
                global_state.channel_unread_count(),
                handler.dropped_events()
            );
            for state in handler.state_registry().active_channel_states().await {
                let snapshot = state.snapshot();
                println!(
                    "{} messages={} members={} typing={} hidden={}",
                    snapshot.cid,
                    snapshot.messages.len(),
                    snapshot.member_count,
                    snapshot.typing.len(),
                    snapshot.hidden
                );
            }
            handler.stop_listening().await;
        }
        Command::SyncState => match storage.select_sync_state(&user_id).await? {
            Some(state) => {
                for (cid, at) in &state.last_synced_at {
                    println!("{cid} {}", at.to_rfc3339());
                }
                if let Some(at) = state.marked_all_read_at {
                    println!("marked_all_read_at {}", at.to_rfc3339());
                }
            }
            None => println!("no sync state for {user_id}"),
        },
    }

    Ok(())
}
