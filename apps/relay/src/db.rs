use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};

/// Shared postgres connection for the relay's config store.
#[derive(Clone)]
pub struct RelayDb {
    client: Arc<Mutex<Client>>,
    connection_task: Arc<JoinHandle<()>>,
}

impl RelayDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .with_context(|| format!("connect to postgres at {}", redact_url(database_url)))?;

        let connection_task = tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "relay postgres connection error");
            }
        });

        let db = Self {
            client: Arc::new(Mutex::new(client)),
            connection_task: Arc::new(connection_task),
        };
        db.ping().await.context("postgres liveness check")?;
        Ok(db)
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    pub async fn ping(&self) -> Result<()> {
        let client = self.client.lock().await;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Stops the background connection driver; later queries fail with a closed-connection error.
    pub fn close(&self) {
        self.connection_task.abort();
    }
}

/// Drops the password component so connection strings can be logged.
pub fn redact_url(database_url: &str) -> String {
    let Some((scheme, rest)) = database_url.split_once("://") else {
        return database_url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return database_url.to_string();
    };
    let user = credentials.split(':').next().unwrap_or_default();
    format!("{scheme}://{user}:***@{host}")
}
