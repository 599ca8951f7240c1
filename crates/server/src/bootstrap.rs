use std::sync::Arc;

use autopoliza_agent::AgentRuntime;
use autopoliza_core::config::{AppConfig, ConfigError, LoadOptions};
use autopoliza_db::{connect_with_settings, migrations, DbPool, SqlSessionStore};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: AgentRuntime,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("agent runtime setup failed: {0:#}")]
    Runtime(anyhow::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let store = Arc::new(SqlSessionStore::new(db_pool.clone()));
    let runtime = AgentRuntime::from_config(&config, store).map_err(BootstrapError::Runtime)?;

    Ok(Application { config, db_pool, runtime })
}

#[cfg(test)]
mod tests {
    use autopoliza_agent::TurnRequest;
    use autopoliza_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_non_sqlite_database_url() {
        let result = bootstrap(overrides("postgres://localhost/autopoliza")).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("database.url"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_serves_a_turn() {
        let app = bootstrap(overrides("sqlite::memory:?cache=shared")).await.expect("bootstrap should succeed");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('sessions', 'messages', 'handler_states', 'quotations', 'policies')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("session tables should exist after bootstrap");
        assert_eq!(table_count, 5);

        let response = app.runtime.handle_turn(TurnRequest::new("S-boot", "quiero cotizar")).await;
        assert!(response.success);
        assert_eq!(response.handler, "quotation");

        let (messages,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind("S-boot")
            .fetch_one(&app.db_pool)
            .await
            .expect("count messages");
        assert_eq!(messages, 2);

        app.db_pool.close().await;
    }
}
