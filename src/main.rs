//! vizdb - command-line front end
//!
//! Thin wrapper over the library: list providers and profiles, scan for
//! databases, run a statement and export its rows, or ask the schema index
//! for completions.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use parking_lot::Mutex;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use vizdb::config::settings::load_settings;
use vizdb::config::{ConnectionProfile, ProfileStore, Settings, config_dir};
use vizdb::credentials::{CredentialStore, Secret};
use vizdb::db::ProviderRegistry;
use vizdb::db::capability::{EndpointStyle, Pagination};
use vizdb::discovery::Discovery;
use vizdb::engine::{EngineOptions, OutputShape, QueryEngine};
use vizdb::export::{self, ExportFormat};
use vizdb::history::QueryHistory;
use vizdb::results::RowCursor;
use vizdb::schema_index::{SchemaIndexer, context_at};
use vizdb::session::{ConnectionManager, Session};
use vizdb::workers::WorkerPool;

#[derive(Parser, Debug)]
#[command(name = "vizdb", version, about = "Terminal client for SQL databases")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List backend kinds and what they support
    Providers,
    /// List saved connection profiles
    Profiles,
    /// Scan docker and cloud CLIs for databases
    Discover {
        /// Save new targets as connection profiles
        #[arg(long)]
        save: bool,
    },
    /// Run SQL against a saved profile or a connection URL
    Query {
        /// Profile name or connection URL
        target: String,
        sql: String,
        /// csv, json or jsonl
        #[arg(short, long, default_value = "csv")]
        format: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Read the password from this environment variable
        #[arg(long)]
        password_env: Option<String>,
        /// Run statements that would otherwise need confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Completion candidates for the text before the cursor
    Complete {
        /// Profile name or connection URL
        target: String,
        text: String,
        #[arg(long)]
        password_env: Option<String>,
    },
    /// Show recently executed statements
    History {
        #[arg(default_value_t = 20)]
        count: usize,
    },
}

struct App {
    settings: Settings,
    pool: WorkerPool,
    manager: ConnectionManager,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    vizdb::logging::init();
    let settings = load_settings().context("loading settings")?;

    match cli.command {
        Command::Providers => providers(),
        Command::Profiles => profiles(),
        Command::Discover { save } => discover(&settings, save).await,
        Command::History { count } => history(&settings, count),
        Command::Query {
            target,
            sql,
            format,
            output,
            password_env,
            yes,
        } => {
            let format: ExportFormat = format.parse()?;
            let ctx = build(settings)?;
            let (profile, secret) = target_profile(&target, password_env.as_deref())?;
            query(&ctx, &profile, secret, &sql, format, output, yes).await
        }
        Command::Complete {
            target,
            text,
            password_env,
        } => {
            let ctx = build(settings)?;
            let (profile, secret) = target_profile(&target, password_env.as_deref())?;
            complete(&ctx, &profile, secret, &text).await
        }
    }
}

fn build(settings: Settings) -> Result<App> {
    let credentials = CredentialStore::from_settings(&settings.credentials, &config_dir()?)
        .context("opening credential store")?;
    let pool = WorkerPool::new(settings.limits.workers);
    let manager = ConnectionManager::new(
        Arc::new(ProviderRegistry::with_defaults()),
        Arc::new(credentials),
        vizdb::tunnel::default_manager(),
    )
    .with_connect_timeout(settings.limits.connect_timeout())
    .with_pool(pool.clone());
    Ok(App {
        pool,
        settings,
        manager,
    })
}

/// A saved profile by name, or an ad-hoc one parsed from a URL
fn target_profile(
    target: &str,
    password_env: Option<&str>,
) -> Result<(ConnectionProfile, Option<Secret>)> {
    let (profile, url_secret) = if target.contains("://") {
        ConnectionProfile::from_url(target)?
    } else {
        (ProfileStore::load()?.get(target)?.clone(), None)
    };
    let env_secret = match password_env {
        Some(var) => Some(Secret::new(
            std::env::var(var).with_context(|| format!("{} is not set", var))?,
        )),
        None => None,
    };
    Ok((profile, env_secret.or(url_secret)))
}

fn providers() -> Result<()> {
    let registry = ProviderRegistry::with_defaults();
    for kind in registry.kinds() {
        let d = registry.describe(kind)?;
        let endpoint = match d.endpoint {
            EndpointStyle::Tcp { default_port } => format!("tcp:{}", default_port),
            EndpointStyle::File => "file".to_string(),
            EndpointStyle::Url => "url".to_string(),
        };
        let paging = match d.pagination {
            Pagination::LimitOffset => "limit/offset",
            Pagination::ClientSide => "client-side",
        };
        println!(
            "{:<12} {:<12} {:<10} cancel={:<5} paging={:<12} tunnel={}",
            kind.as_str(),
            d.display_name,
            endpoint,
            d.supports_cancellation,
            paging,
            d.supports_tunnel
        );
    }
    Ok(())
}

fn profiles() -> Result<()> {
    let store = ProfileStore::load()?;
    for p in store.profiles() {
        let target = match p.endpoint.host_port() {
            Some((host, port)) => format!("{}:{}", host, port),
            None => format!("{:?}", p.endpoint),
        };
        let tunnel = if p.tunnel.is_some() { " (ssh)" } else { "" };
        println!("{:<20} {:<12} {}{}", p.name, p.kind.as_str(), target, tunnel);
    }
    Ok(())
}

async fn discover(settings: &Settings, save: bool) -> Result<()> {
    let discovery = Discovery::new(WorkerPool::new(settings.limits.workers));
    let mut store = if save { Some(ProfileStore::load()?) } else { None };
    let mut targets = discovery.scan();
    while let Some(target) = targets.next().await {
        let port = target
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<24} {:<12} {}:{} {}",
            target.source,
            target.name,
            target.kind.as_str(),
            target.host,
            port,
            target
                .password_env
                .as_deref()
                .map(|v| format!("password in ${}", v))
                .unwrap_or_default()
        );
        if let Some(store) = store.as_mut()
            && target.connectable()
            && store.get(&target.name).is_err()
        {
            store.add(target.to_profile())?;
        }
    }
    if let Some(store) = store {
        store.save()?;
    }
    Ok(())
}

fn history(settings: &Settings, count: usize) -> Result<()> {
    let history = QueryHistory::load(settings.history.size);
    for entry in history.recent(count) {
        let rows = entry.rows.map(|r| format!("{} rows", r)).unwrap_or_default();
        println!(
            "{} {:<10} {:?} {}ms {} | {}",
            entry.executed_at.format("%Y-%m-%d %H:%M:%S"),
            entry.profile,
            entry.outcome,
            entry.duration_ms,
            rows,
            entry.sql.replace('\n', " ")
        );
    }
    Ok(())
}

async fn query(
    ctx: &App,
    profile: &ConnectionProfile,
    secret: Option<Secret>,
    sql: &str,
    format: ExportFormat,
    output: Option<PathBuf>,
    yes: bool,
) -> Result<()> {
    let mut engine = QueryEngine::new(ctx.pool.clone(), EngineOptions::from(&ctx.settings));
    if engine.needs_confirmation(sql) && !yes {
        bail!(
            "statement classified as {:?}; rerun with --yes to execute",
            engine.alert(sql)
        );
    }
    if ctx.settings.history.enabled {
        let history = QueryHistory::load(ctx.settings.history.size);
        engine = engine.with_history(Arc::new(Mutex::new(history)));
    }

    let session = ctx.manager.resolve_with_secret(profile, secret).await?;
    let result = run_export(&engine, &session, sql, format, output).await;
    ctx.manager.close(&session).await;
    let rows = result?;
    eprintln!("{} rows", rows);
    Ok(())
}

async fn run_export(
    engine: &QueryEngine,
    session: &Arc<Session>,
    sql: &str,
    format: ExportFormat,
    output: Option<PathBuf>,
) -> Result<u64> {
    let mut statement = engine.submit(session, sql, OutputShape::Export)?;
    let cursor = RowCursor::open(&mut statement)?;
    let out: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            std::fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };

    let drain = export::export(cursor, format, out);
    tokio::pin!(drain);
    let (_, rows) = tokio::select! {
        done = &mut drain => done?,
        _ = tokio::signal::ctrl_c() => {
            engine.cancel(&statement).await;
            drain.await?
        }
    };
    Ok(rows)
}

async fn complete(
    ctx: &App,
    profile: &ConnectionProfile,
    secret: Option<Secret>,
    text: &str,
) -> Result<()> {
    let session = ctx.manager.resolve_with_secret(profile, secret).await?;
    let indexer = SchemaIndexer::new(ctx.pool.clone())
        .with_timeout(ctx.settings.limits.introspect_timeout());
    let refreshed = indexer.refresh(&session).await;
    ctx.manager.close(&session).await;
    refreshed?;

    let (context, word) = context_at(text, text.len());
    for candidate in indexer.lookup(&word, &context) {
        let owner = candidate.table.as_deref().unwrap_or(&candidate.schema);
        println!("{:<32} {:?} ({})", candidate.name, candidate.kind, owner);
    }
    Ok(())
}
