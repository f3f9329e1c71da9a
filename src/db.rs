//! Database connection and pool management.
//!
//! Provides a SeaORM connection pool to the relational store with retry and
//! exponential backoff, creating the target database on local profiles when
//! it does not exist yet.

use anyhow::Result;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Statement,
    Value,
};
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

use crate::config::AppConfig;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("Database connection timeout after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Initializes a database connection pool with the given configuration.
///
/// Retries transient connection failures with exponential backoff. On the
/// first attempt the target database is created if the server is reachable
/// but the database is missing.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    let database_url = cfg.database_url();

    if cfg.store_db.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "Store database name cannot be empty".to_string(),
        }
        .into());
    }

    let mut opt = ConnectOptions::new(&database_url);
    opt.max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let max_retries = 5;
    let mut retry_delay = Duration::from_millis(100);
    let mut database_ready = false;

    for attempt in 1..=max_retries {
        if !database_ready {
            match ensure_database_exists(&database_url, cfg.db_acquire_timeout_ms).await {
                Ok(_) => database_ready = true,
                Err(err) => {
                    if attempt == max_retries {
                        log::error!(
                            "Failed to prepare database after {} attempts: {}",
                            max_retries,
                            err
                        );
                        return Err(err);
                    }

                    log::warn!(
                        "Database preparation attempt {} failed: {}, retrying in {:?}",
                        attempt,
                        err,
                        retry_delay
                    );

                    sleep(retry_delay).await;
                    retry_delay *= 2;
                    continue;
                }
            }
        }

        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                log::info!("Connected to relational store (attempt {})", attempt);
                return Ok(conn);
            }
            Err(e) => {
                if attempt == max_retries {
                    log::error!(
                        "Failed to connect to database after {} attempts: {}",
                        max_retries,
                        e
                    );
                    return Err(DatabaseError::ConnectionFailed { source: e }.into());
                }

                log::warn!(
                    "Database connection attempt {} failed: {}, retrying in {:?}",
                    attempt,
                    e,
                    retry_delay
                );

                sleep(retry_delay).await;
                retry_delay *= 2;
            }
        }
    }

    Err(DatabaseError::ConnectionTimeout {
        timeout_ms: cfg.db_acquire_timeout_ms,
    }
    .into())
}

async fn ensure_database_exists(database_url: &str, acquire_timeout_ms: u64) -> Result<()> {
    let parsed_url =
        Url::parse(database_url).map_err(|error| DatabaseError::InvalidConfiguration {
            message: format!("Invalid database URL: {error}"),
        })?;

    match parsed_url.scheme() {
        "postgres" | "postgresql" => {}
        _ => return Ok(()),
    }

    let db_name = parsed_url
        .path_segments()
        .and_then(|mut segments| segments.next().map(str::to_string))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| DatabaseError::InvalidConfiguration {
            message: "Database URL must specify a database name".to_string(),
        })?;

    let mut admin_url = parsed_url.clone();
    admin_url.set_path("/postgres");
    admin_url.set_query(None);

    let mut admin_opt = ConnectOptions::new(admin_url.to_string());
    admin_opt
        .max_connections(1)
        .acquire_timeout(Duration::from_millis(acquire_timeout_ms))
        .sqlx_logging(false);

    let admin_conn = Database::connect(admin_opt)
        .await
        .map_err(|source| DatabaseError::ConnectionFailed { source })?;

    let exists_stmt = Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        "SELECT 1 FROM pg_database WHERE datname = $1",
        vec![Value::from(db_name.clone())],
    );

    let database_exists = admin_conn
        .query_one(exists_stmt)
        .await
        .map_err(|source| DatabaseError::ConnectionFailed { source })?
        .is_some();

    if !database_exists {
        let create_stmt = Statement::from_string(
            DatabaseBackend::Postgres,
            format!("CREATE DATABASE {}", quote_identifier(&db_name)),
        );

        match admin_conn.execute(create_stmt).await {
            Ok(_) => log::info!("Created database '{db_name}'"),
            Err(err) if err.to_string().contains("already exists") => {
                log::info!("Database '{db_name}' already exists");
            }
            Err(source) => {
                return Err(DatabaseError::ConnectionFailed { source }.into());
            }
        }
    }

    admin_conn
        .close()
        .await
        .map_err(|source| DatabaseError::ConnectionFailed { source })?;

    Ok(())
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_identifier_escapes_quotes() {
        assert_eq!(quote_identifier("messages_db"), "\"messages_db\"");
        assert_eq!(quote_identifier("odd\"name"), "\"odd\"\"name\"");
    }

    #[tokio::test]
    async fn init_pool_rejects_empty_database_name() {
        let config = AppConfig {
            store_db: "".to_string(),
            ..Default::default()
        };

        let result = init_pool(&config).await;
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err().downcast::<DatabaseError>(),
            Ok(DatabaseError::InvalidConfiguration { .. })
        ));
    }
}
