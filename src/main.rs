//! db-copilot - natural-language query service for connected databases.

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use db_copilot::cli::Cli;
use db_copilot::config::Config;
use db_copilot::connection::{ConfigConnector, Connector, MockConnector};
use db_copilot::db::MockDatabaseClient;
use db_copilot::knowledge::{KnowledgeStore, SqliteKnowledgeStore};
use db_copilot::llm::create_client;
use db_copilot::logging::{init_file_logging, init_stderr_logging};
use db_copilot::server::{serve, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    let config_path = cli.config_path();
    let mut config = Config::load_from_file(&config_path)?;
    cli.apply_overrides(&mut config);
    config.apply_env_defaults();

    match &config.logging.file {
        Some(path) => init_file_logging(path),
        None => init_stderr_logging(),
    }
    info!(config = %config_path.display(), "Configuration loaded");

    let llm = create_client(&config.llm)?;
    if llm.is_none() {
        warn!("AI backend disabled; answering from query templates only");
    }

    let connector = build_connector(&cli, &config);

    let knowledge_path = config.knowledge_path();
    let knowledge = Arc::new(SqliteKnowledgeStore::open(&knowledge_path).await?);
    info!(path = %knowledge_path.display(), "Knowledge store opened");

    let state = AppState::new(
        connector,
        Arc::clone(&knowledge) as Arc<dyn KnowledgeStore>,
        llm,
        &config,
    );
    let lifecycle = Arc::clone(&state.lifecycle);
    let analysis = state.analysis.clone();
    let shutdown = state.shutdown.clone();

    let reaper = Arc::clone(&lifecycle)
        .spawn_reaper(config.session.reaper_interval(), shutdown.child_token());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            shutdown.cancel();
        });
    }

    serve(listener, state).await?;

    shutdown.cancel();
    analysis.shutdown();
    if let Err(e) = reaper.await {
        warn!(error = %e, "Session reaper ended abnormally");
    }
    lifecycle.shutdown().await;
    knowledge.close().await;
    info!("Stopped");
    Ok(())
}

fn build_connector(cli: &Cli, config: &Config) -> Arc<dyn Connector> {
    if !cli.mock_db {
        return Arc::new(ConfigConnector::new(config.connections.iter().cloned()));
    }

    let mut ids: Vec<i64> = config.connections.iter().map(|c| c.id).collect();
    if ids.is_empty() {
        ids.push(1);
    }
    info!(?ids, "Serving mock databases");
    Arc::new(
        ids.into_iter()
            .fold(MockConnector::new(), |connector, id| {
                connector.with_client(id, MockDatabaseClient::demo())
            }),
    )
}
