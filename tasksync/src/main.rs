use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tasksync::config::Config;
use tasksync::model::Provider;
use tasksync::provider::{ProviderRegistry, TOKEN_ENV, TOKEN_KEY, TodoistAdapter};
use tasksync::storage::{BackendPreference, CredentialStore, select_credential_store};
use tasksync::sync::{
    ConflictStrategy, MappingStore, SyncConflict, SyncManager, SyncResult, SyncStatus,
    SyncSummary,
};
use tasksync::task_store::MarkdownTaskStore;

const DEFAULT_PRUNE_DAYS: i64 = 30;
/// Passes listed by `tasksync status`.
const STATUS_HISTORY: usize = 10;

const USAGE: &str = "\
Usage: tasksync [command]

Commands:
  sync [provider] [--strategy S]   Sync every enabled provider, or one (default)
  conflicts [provider] [--resolved] List pending (or resolved) conflicts
  resolve <id> <strategy>          Resolve a pending conflict
  status                           Show mappings, conflicts and recent passes per provider
  prune-conflicts [days]           Delete conflicts resolved more than N days ago (default 30)
  login <provider>                 Store an API token read from TODOIST_API_TOKEN or stdin
  logout <provider>                Remove the stored API token

Strategies: local_wins, remote_wins, newest_wins, merge, manual, skip";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Sync {
        provider: Option<Provider>,
        strategy: Option<ConflictStrategy>,
    },
    Conflicts {
        provider: Option<Provider>,
        resolved: bool,
    },
    Resolve {
        id: i64,
        strategy: ConflictStrategy,
    },
    Status,
    PruneConflicts {
        days: i64,
    },
    Login(Provider),
    Logout(Provider),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Sync {
            provider: None,
            strategy: None,
        });
    };
    let rest: Vec<String> = args.collect();
    let mode = match command.as_str() {
        "sync" => {
            let mut provider = None;
            let mut strategy = None;
            let mut rest = rest.into_iter();
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "--strategy" => {
                        let value = rest.next().context("--strategy needs a value")?;
                        strategy = Some(ConflictStrategy::parse(&value)?);
                    }
                    other if provider.is_none() => provider = Some(Provider::parse(other)?),
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }
            CliMode::Sync { provider, strategy }
        }
        "conflicts" => {
            let mut provider = None;
            let mut resolved = false;
            for arg in rest {
                match arg.as_str() {
                    "--resolved" => resolved = true,
                    other if provider.is_none() => provider = Some(Provider::parse(other)?),
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }
            CliMode::Conflicts { provider, resolved }
        }
        "resolve" => {
            let [id, strategy] = rest.as_slice() else {
                anyhow::bail!("usage: tasksync resolve <id> <strategy>");
            };
            CliMode::Resolve {
                id: id
                    .parse()
                    .with_context(|| format!("invalid conflict id: {id}"))?,
                strategy: ConflictStrategy::parse(strategy)?,
            }
        }
        "status" => {
            expect_no_args(&rest)?;
            CliMode::Status
        }
        "prune-conflicts" => {
            let days = match rest.as_slice() {
                [] => DEFAULT_PRUNE_DAYS,
                [days] => days
                    .parse()
                    .ok()
                    .filter(|days: &i64| *days >= 0)
                    .with_context(|| format!("invalid number of days: {days}"))?,
                _ => anyhow::bail!("usage: tasksync prune-conflicts [days]"),
            };
            CliMode::PruneConflicts { days }
        }
        "login" | "logout" => {
            let [provider] = rest.as_slice() else {
                anyhow::bail!("usage: tasksync {command} <provider>");
            };
            let provider = Provider::parse(provider)?;
            if command == "login" {
                CliMode::Login(provider)
            } else {
                CliMode::Logout(provider)
            }
        }
        "help" | "--help" | "-h" => CliMode::Help,
        other => anyhow::bail!("unknown command: {other}"),
    };
    Ok(mode)
}

fn expect_no_args(rest: &[String]) -> anyhow::Result<()> {
    match rest.first() {
        Some(arg) => anyhow::bail!("unexpected argument: {arg}"),
        None => Ok(()),
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasksync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let credentials = select_credential_store(BackendPreference::from_env()?)
        .context("failed to open credential storage")?;
    match mode {
        CliMode::Login(provider) => return login(credentials.as_ref(), provider),
        CliMode::Logout(provider) => {
            credentials.delete(provider, token_key(provider)?)?;
            println!("removed stored {provider} token");
            return Ok(());
        }
        _ => {}
    }

    let config = Config::load().context("failed to load configuration")?;
    let manager = build_manager(&config, credentials).await?;
    match mode {
        CliMode::Sync { provider, strategy } => {
            let results = match provider {
                Some(provider) => {
                    let result = manager.sync_provider(provider, strategy).await?;
                    vec![result]
                }
                None => manager.sync_all(strategy).await.into_values().collect(),
            };
            if results.is_empty() {
                println!("no providers enabled");
            }
            for result in &results {
                print_result(result);
            }
            if results
                .iter()
                .any(|result| result.status == SyncStatus::Error)
            {
                anyhow::bail!("sync failed");
            }
        }
        CliMode::Conflicts { provider, resolved } => {
            let conflicts = manager.get_conflicts(provider, resolved).await?;
            if conflicts.is_empty() {
                println!("no conflicts");
            }
            for conflict in &conflicts {
                print_conflict(conflict);
            }
        }
        CliMode::Resolve { id, strategy } => {
            let resolution = manager.resolve_conflict(id, strategy).await?;
            println!("conflict {id}: {}", resolution.outcome.describe());
        }
        CliMode::Status => {
            let stats = manager.status().await?;
            if stats.is_empty() {
                println!("nothing synced yet");
            }
            for entry in stats {
                let last_sync = entry
                    .last_sync
                    .map_or_else(|| "never".to_string(), format_time);
                println!(
                    "{}: {} mapped, {} pending conflicts, {} resolved, last sync {last_sync}",
                    entry.provider, entry.mappings, entry.pending_conflicts, entry.resolved_conflicts
                );
            }
            let history = manager.history(None, STATUS_HISTORY).await?;
            if !history.is_empty() {
                println!("recent passes:");
            }
            for summary in &history {
                print_summary(summary);
            }
        }
        CliMode::PruneConflicts { days } => {
            let cutoff = OffsetDateTime::now_utc() - time::Duration::days(days);
            let removed = manager.prune_resolved_conflicts(cutoff).await?;
            println!("removed {removed} resolved conflicts");
        }
        CliMode::Login(_) | CliMode::Logout(_) | CliMode::Help => {}
    }
    Ok(())
}

async fn build_manager(
    config: &Config,
    credentials: Arc<dyn CredentialStore>,
) -> anyhow::Result<SyncManager> {
    let tasks = MarkdownTaskStore::new(&config.tasks_dir)
        .with_context(|| format!("failed to open {}", config.tasks_dir.display()))?;
    let mappings = match &config.database_path {
        Some(path) => MappingStore::open(path).await,
        None => MappingStore::new_default().await,
    }
    .context("failed to open the sync database")?;

    let mut registry = ProviderRegistry::new();
    for (provider, settings) in config.enabled_providers() {
        match provider {
            Provider::Todoist => {
                registry.register(Arc::new(TodoistAdapter::new(settings, credentials.clone())));
            }
            Provider::AppleReminders => {
                tracing::warn!(%provider, "no adapter available on this platform");
            }
        }
    }

    Ok(SyncManager::new(
        config.providers.clone(),
        registry,
        Arc::new(tasks),
        Arc::new(mappings),
    ))
}

fn token_key(provider: Provider) -> anyhow::Result<&'static str> {
    match provider {
        Provider::Todoist => Ok(TOKEN_KEY),
        other => anyhow::bail!("{other} does not use an API token"),
    }
}

fn login(credentials: &dyn CredentialStore, provider: Provider) -> anyhow::Result<()> {
    let key = token_key(provider)?;
    let token = match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.trim().is_empty() => token,
        _ => {
            eprintln!("paste the {provider} API token and press enter:");
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("failed to read token")?;
            line
        }
    };
    let token = token.trim();
    anyhow::ensure!(!token.is_empty(), "empty token");
    credentials.set(provider, key, token)?;
    println!(
        "stored {provider} token in {}",
        credentials.backend_name()
    );
    Ok(())
}

fn format_time(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

fn print_result(result: &SyncResult) {
    println!(
        "{}: {} (created {}, updated {}, deleted {}, conflicts {}, pending {}, skipped {}) in {} ms",
        result.provider,
        result.status,
        result.items_created(),
        result.items_updated(),
        result.items_deleted(),
        result.conflict_count(),
        result.pending_conflicts,
        result.skipped,
        result.duration.as_millis()
    );
    for conflict in &result.conflicts {
        let state = if conflict.resolved { "resolved" } else { "pending" };
        println!(
            "  conflict #{} task {} {} ({state})",
            conflict.id.unwrap_or_default(),
            conflict.local_id,
            conflict.conflict_type
        );
    }
    for error in &result.errors {
        println!("  error: {error}");
    }
}

fn print_summary(summary: &SyncSummary) {
    println!(
        "  {} {}: {} (created {}, updated {}, deleted {}, conflicts {}, errors {}) in {} ms",
        format_time(summary.started_at),
        summary.provider,
        summary.status,
        summary.items_created,
        summary.items_updated,
        summary.items_deleted,
        summary.conflicts,
        summary.errors,
        summary.duration.as_millis()
    );
}

fn print_conflict(conflict: &SyncConflict) {
    println!(
        "#{} {} task {} {} {:?} detected {}",
        conflict.id.unwrap_or_default(),
        conflict.provider,
        conflict.local_id,
        conflict.conflict_type,
        conflict.title(),
        format_time(conflict.detected_at)
    );
    if let Some(strategy) = conflict.strategy {
        println!("  resolved with {strategy}");
    }
    if let Some(error) = &conflict.last_error {
        println!("  last error: {error}");
    }
}
