//! Startup helpers for the chat ledger server.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;

use crate::controller::ConversationController;
use crate::gateway::OpenAiCompatibleGateway;
use crate::ledger::core::config::LedgerConfig;
use crate::ledger::storage::SqliteDocumentStorage;
use crate::ledger::store::ConversationStore;
use crate::server::{self, AppState};

/// Run the server until ctrl-c.
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting chat ledger v{}", env!("CARGO_PKG_VERSION"));

    let config = match LedgerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let result = rt.block_on(async {
        let state = initialize(&config).await?;
        server::run_server_with_shutdown(state, config.server.socket_addr(), shutdown_signal())
            .await
            .context("server error")
    });

    if let Err(e) = result {
        tracing::error!("{e:#}");
        return ExitCode::from(1);
    }

    tracing::info!("Chat ledger stopped");
    ExitCode::SUCCESS
}

/// Open storage, load the ledger and build the application state.
///
/// # Errors
/// Returns an error if the database cannot be opened, the stored ledger is
/// corrupt, or the HTTP client cannot be built.
pub async fn initialize(config: &LedgerConfig) -> anyhow::Result<Arc<AppState>> {
    tracing::info!("Ledger database: {}", config.storage.sqlite_path.display());

    let storage = SqliteDocumentStorage::open(&config.storage)
        .await
        .with_context(|| {
            format!(
                "failed to open database {}",
                config.storage.sqlite_path.display()
            )
        })?;
    let store = ConversationStore::open(Arc::new(storage))
        .await
        .context("failed to load the ledger")?;
    let gateway =
        OpenAiCompatibleGateway::new(&config.gateway).context("failed to build the gateway")?;

    let controller = ConversationController::new(store, Arc::new(gateway), &config.gateway);
    Ok(AppState::new(controller, config.server.static_dir.clone()))
}

/// Resolve when ctrl-c is received.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_with_temporary_database() {
        let mut config = LedgerConfig::default();
        config.storage.sqlite_path =
            std::env::temp_dir().join(format!("chat_ledger_init_{}.sqlite", std::process::id()));

        let state = initialize(&config).await;
        assert!(state.is_ok());
        if let Ok(state) = state {
            assert_eq!(state.controller.folders().await.len(), 1);
        }
        let _ = std::fs::remove_file(&config.storage.sqlite_path);
    }
}
