//! Process bootstrap: loads configuration, connects storage, runs
//! migrations, wires the dispatcher/hub/status-reconciler singletons, and
//! serves the HTTP/WebSocket API until shutdown.

use std::sync::Arc;

use cinch_core::config::CinchConfig;
use cinch_core::crypto::Cipher;
use cinch_core::error::{CinchError, Result};
use cinch_runtime::forge::{ForgejoAdapter, ForgeRegistry, GitHubAdapter, GitLabAdapter};
use cinch_runtime::logstore::FsLogStore;
use cinch_runtime::migrations::{get_builtin_migrations, load_migrations_from_dir, MigrationRunner};
use cinch_runtime::storage::PgStorage;
use cinch_runtime::{AppState, Database, Dispatcher, Hub, LogMultiplexer, StatusReconciler};

/// Loads `config_path`, brings up storage and migrations, and serves the
/// HTTP/WebSocket API until a shutdown signal arrives.
pub async fn serve(config_path: &str) -> anyhow::Result<()> {
    init_tracing();

    let config = CinchConfig::from_file(config_path)?;
    tracing::info!("cinch starting");

    let db = Database::from_config(&config.database).await?;
    tracing::info!("connected to database");

    let runner = MigrationRunner::new(db.pool().clone());
    let mut migrations = get_builtin_migrations();
    let migrations_dir = std::path::Path::new("migrations");
    if migrations_dir.exists() {
        migrations.extend(load_migrations_from_dir(migrations_dir)?);
    }
    runner.run(migrations).await?;
    tracing::info!("migrations complete");

    let cipher = Arc::new(Cipher::new(
        &config.security.secret_key,
        config.security.secondary_key.as_deref(),
    )?);

    let storage: Arc<dyn cinch_runtime::Storage> = Arc::new(PgStorage::new(db.pool().clone()));
    ensure_canary(storage.as_ref(), &cipher).await?;

    let forges = Arc::new(build_forge_registry());
    let hub = Arc::new(Hub::new());
    let dispatcher = Arc::new(Dispatcher::new(
        storage.clone(),
        hub.clone(),
        forges.clone(),
        cipher.clone(),
    ));
    let log_mux = Arc::new(LogMultiplexer::new(FsLogStore::new(
        std::path::PathBuf::from(&config.server.data_dir).join("logs"),
    )));
    let status_reconciler = Arc::new(StatusReconciler::spawn(forges.clone(), cipher.clone()));

    let dispatcher_task = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    };

    let hub_for_shutdown = hub.clone();
    let log_mux_for_shutdown = log_mux.clone();

    let state = AppState {
        storage,
        hub,
        dispatcher,
        forges,
        cipher,
        log_mux,
        status_reconciler,
        config: Arc::new(config.clone()),
    };

    let app = cinch_runtime::router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr(&config.server.listen_addr)).await?;
    tracing::info!(addr = %config.server.listen_addr, "listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let serve_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("received shutdown signal");

    // 1. stop accepting new connections (webhooks, worker upgrades).
    let _ = shutdown_tx.send(());
    if let Err(e) = serve_task.await {
        tracing::error!(error = %e, "server task panicked during shutdown");
    }

    // 2. tell every connected worker the server is going away.
    hub_for_shutdown.broadcast(cinch_runtime::session::ServerMessage::GracefulShutdown);

    // 3. seal in-flight log files and drop any live SSE subscriptions.
    log_mux_for_shutdown.shutdown().await;

    // 4. stop the dispatch loop and close the pool.
    dispatcher_task.abort();
    db.close().await;
    tracing::info!("cinch stopped");
    Ok(())
}

fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn build_forge_registry() -> ForgeRegistry {
    let http = reqwest::Client::new();
    ForgeRegistry::new(vec![
        Arc::new(GitHubAdapter::new(http.clone())),
        Arc::new(GitLabAdapter::new(http.clone())),
        Arc::new(ForgejoAdapter::new(http)),
    ])
}

/// Writes a canary ciphertext on first boot and decrypts it on every boot
/// after. A misconfigured or rotated key then fails at startup instead of
/// corrupting every secret read for the rest of the process lifetime.
async fn ensure_canary(storage: &dyn cinch_runtime::Storage, cipher: &Cipher) -> Result<()> {
    match storage.get_canary().await? {
        Some(value) => {
            cipher.decrypt(&value).map_err(|_| CinchError::KeyMismatch)?;
        }
        None => {
            let value = cipher.encrypt("cinch-secrets-canary")?;
            storage.set_canary(&value).await?;
        }
    }
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();
}
