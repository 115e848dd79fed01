//! Database connector.
//!
//! Owns the connection pool the migrator borrows for a run. Connections go
//! through sqlx's `Any` driver, so a PostgreSQL deployment and an SQLite file
//! (or in-memory database) are driven by the same code.

use std::time::Duration;

use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;
use tracing::{debug, info};
use url::Url;

use crate::error::{MigrateError, Result};

/// Connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
    /// Database name.
    pub name: String,
    /// Full connection URL. When set, the individual fields are ignored.
    pub url: Option<String>,
    /// Upper bound on pooled connections.
    pub max_connections: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            name: String::new(),
            url: None,
            max_connections: 5,
        }
    }
}

impl DatabaseOptions {
    /// Returns the URL to connect with.
    ///
    /// Without an explicit `url`, a `postgres://` URL is built from the
    /// individual fields with user name and password percent-encoded.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Connection`] if the fields do not form a valid URL.
    pub fn connection_url(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }

        let invalid = |what: &str| {
            MigrateError::Connection(sqlx::Error::Configuration(
                format!("invalid database {what}").into(),
            ))
        };

        let mut url = Url::parse(&format!("postgres://{}:{}", self.host, self.port))
            .map_err(|e| MigrateError::Connection(sqlx::Error::Configuration(e.into())))?;
        if !self.user.is_empty() {
            url.set_username(&self.user).map_err(|()| invalid("user"))?;
        }
        if !self.password.is_empty() {
            url.set_password(Some(&self.password))
                .map_err(|()| invalid("password"))?;
        }
        url.set_path(&format!("/{}", self.name));
        Ok(url.into())
    }
}

/// An open connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: AnyPool,
}

impl Database {
    /// Connects to the database described by `options`.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Connection`] if the database cannot be reached.
    pub async fn connect(options: &DatabaseOptions) -> Result<Self> {
        install_default_drivers();

        let url = options.connection_url()?;
        if options.url.is_none() {
            info!(
                host = %options.host,
                port = options.port,
                database = %options.name,
                "Connecting to database"
            );
        } else {
            info!("Connecting to database from URL");
        }

        let pool = AnyPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .map_err(MigrateError::Connection)?;
        debug!(max_connections = options.max_connections, "Database pool ready");

        Ok(Self { pool })
    }

    /// Returns the pool to lend to a migration run.
    #[must_use]
    pub const fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Closes every pooled connection.
    pub async fn close(self) {
        self.pool.close().await;
        debug!("Database pool closed");
    }
}

/// Single-connection in-memory SQLite pool for tests.
#[cfg(test)]
pub(crate) async fn test_pool() -> AnyPool {
    install_default_drivers();
    AnyPoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}
