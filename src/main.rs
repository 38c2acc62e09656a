#![warn(clippy::pedantic)]

use std::{
    fs::read_to_string,
    io::{IsTerminal, stderr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

mod cascade;
mod config;
mod geo;
mod history;
mod maintenance;
mod media_server;
mod model;
mod notify;
mod poller;
mod repository;
mod rules;
mod subscriber;
mod util;

use config::{Config, LogLevel};
use history::HistoryPersistor;
use media_server::{Client as MediaClient, embyfin, plex};
use model::ServerKind;
use poller::Poller;
use repository::InMemoryRepository;
use rules::RulesEngine;

const NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(long)]
    config: PathBuf,
}

fn load_config() -> anyhow::Result<Config> {
    let args = Args::parse();
    let toml = read_to_string(&args.config)
        .with_context(|| format!("reading config from {}", args.config.to_string_lossy()))?;
    toml::from_str(&toml).context("parsing TOML config")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;

    enable_logging(config.log_dir.as_ref(), config.log_level);

    info!("{NAME} {VERSION}");

    if let Err(err) = run(config).await {
        error!("{err:#}");
        info!("{NAME} exits due to an error");
        return Err(err.into());
    }

    Ok(())
}

fn build_client(server: &config::ServerConfig) -> anyhow::Result<Arc<dyn MediaClient>> {
    let client: Arc<dyn MediaClient> = match server.kind {
        ServerKind::Plex => Arc::new(
            plex::Client::new(&server.name, server.id, &server.url, &server.api_key)
                .context("invalid Plex connection parameters")?,
        ),
        ServerKind::Emby => Arc::new(
            embyfin::Client::new(
                &server.name,
                server.id,
                &server.url,
                &server.api_key,
                embyfin::Fork::Emby,
            )
            .context("invalid Emby connection parameters")?,
        ),
        ServerKind::Jellyfin => Arc::new(
            embyfin::Client::new(
                &server.name,
                server.id,
                &server.url,
                &server.api_key,
                embyfin::Fork::Jellyfin,
            )
            .context("invalid Jellyfin connection parameters")?,
        ),
    };
    Ok(client)
}

/// Component wiring + shutdown ordering (spec §9): (1) stop accepting new
/// servers, (2) cancel the tick loop, (3) persist every live session,
/// (4) await outstanding notification dispatches, (5) drop the repository.
///
/// `InMemoryRepository` stands in for the storage layer here: a real,
/// SQL-backed `Repository` is out of scope (spec §1 Non-goals).
async fn run(config: Config) -> anyhow::Result<()> {
    let repository = Arc::new(InMemoryRepository::default());

    let geo_resolver: Option<Arc<dyn geo::GeoResolver>> = None;
    let notifier: Option<Arc<dyn notify::Notifier>> = Some(Arc::new(notify::LoggingNotifier));

    let rules_engine = Arc::new(RulesEngine::new(
        repository.clone(),
        geo_resolver.clone(),
        notifier,
        Duration::from_secs(config.rules.cache_ttl_secs),
        Duration::from_secs(config.rules.cooldown_secs),
    ));

    let history = Arc::new(HistoryPersistor::new(repository.clone()));

    let poller = Arc::new(Poller::new(
        repository.clone(),
        rules_engine.clone(),
        history.clone(),
        geo_resolver,
        config.poller.household_auto_learn_enabled,
        config.poller.household_min_sessions,
        Duration::from_secs(config.poller.tick_interval_secs),
    ));

    let _maintenance = maintenance::MaintenanceEvaluator::new(repository.clone());

    let radarr = config
        .cascade
        .radarr
        .as_ref()
        .map(|c| cascade::radarr::Client::new(&c.url, &c.api_key))
        .transpose()
        .context("invalid Radarr connection parameters")?;
    let sonarr = config
        .cascade
        .sonarr
        .as_ref()
        .map(|c| cascade::sonarr::Client::new(&c.url, &c.api_key))
        .transpose()
        .context("invalid Sonarr connection parameters")?;
    let overseerr = config
        .cascade
        .overseerr
        .as_ref()
        .map(|c| cascade::overseerr::Client::new(&c.url, &c.api_key))
        .transpose()
        .context("invalid Overseerr connection parameters")?;
    let _cascade_deleter = cascade::CascadeDeleter::new(
        radarr,
        sonarr,
        overseerr,
        Duration::from_secs(config.cascade.timeout_secs),
    );

    for server in &config.servers {
        let client = build_client(server)?;
        util::retry(config.connection_retries, async || {
            client
                .test_connection()
                .await
                .with_context(|| format!("probing {} failed", server.name))
        })
        .await?;
        poller.add_server(server.id, client).await;
        info!(server = server.name, "watching sessions");
    }

    let tick_loop = {
        let poller = poller.clone();
        tokio::spawn(async move { poller.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    poller.stop();
    let _ = tick_loop.await;

    poller.persist_active_sessions().await;
    rules_engine.wait_for_notifications().await;

    Ok(())
}

fn enable_logging(log_dir: Option<&PathBuf>, level: Option<LogLevel>) {
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(stderr().is_terminal())
        .with_writer(stderr)
        .finish();

    let filter = if let Some(level) = level {
        tracing_subscriber::filter::Targets::new()
            .with_target(env!("CARGO_PKG_NAME"), tracing::Level::from(level))
            .boxed()
    } else {
        EnvFilter::builder().from_env_lossy().boxed()
    };

    let rolling_layer = log_dir.as_ref().map(|log_dir| {
        let file_appender = tracing_appender::rolling::daily(log_dir, "streammon.log");
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender)
    });

    subscriber
        .with(filter)
        .with(rolling_layer)
        .try_init()
        .expect("setting the default subscriber");
}
