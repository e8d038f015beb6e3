#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use assistants_client::{AssistantsApi, AssistantsClient};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    config::Config,
    config_store::ConfigStore,
    server::{AppState, build_router},
};

pub mod api_envelope;
pub mod config;
pub mod config_store;
pub mod db;
pub mod normalizer;
pub mod orchestrator;
pub mod provisioner;
pub mod server;
pub mod token_estimate;

#[cfg(test)]
pub(crate) mod test_support;

pub async fn connect_store(config: &Config) -> Result<Arc<dyn ConfigStore>> {
    config_store::connect(&config.config_store_url, &config.config_store_collection)
        .await
        .with_context(|| {
            format!(
                "config store unreachable at {}",
                db::redact_url(&config.config_store_url)
            )
        })
}

pub fn build_upstream(config: &Config) -> Result<Arc<dyn AssistantsApi>> {
    let client = AssistantsClient::new(config.client_config())
        .context("invalid upstream client configuration")?;
    Ok(Arc::new(client))
}

/// Connects the store, provisions the assistant, then serves until Ctrl-C or SIGTERM.
pub async fn serve(config: Config) -> Result<()> {
    let bind_addr = config.bind_addr;
    let store = connect_store(&config).await?;
    let api = build_upstream(&config)?;
    let state = AppState::new(config, api, store.clone());

    let provisioned = state
        .provisioner()
        .provision()
        .await
        .context("assistant provisioning failed")?;
    info!(
        assistant_id = %provisioned.assistant_id,
        outcome = ?provisioned.outcome,
        store = store.backend(),
        "assistant ready"
    );

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(bind_addr = %bind_addr, "interpreter relay listening");

    let served = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated abnormally");

    info!("draining complete; closing config store");
    store.close().await.context("failed to close config store")?;
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("ctrl-c received; shutting down"),
        () = terminate => info!("SIGTERM received; shutting down"),
    }
}
