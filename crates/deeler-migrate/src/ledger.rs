//! Migration ledger.
//!
//! This module manages the `schema_migrations` table that records which
//! migration versions have been applied to the database.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{AnyConnection, AnyPool};

use crate::error::{MigrateError, Result};
use crate::source::{MigrationUnit, Version};

/// SQL to create the ledger table.
///
/// `applied_at` holds RFC 3339 text so the same schema works on every backend.
pub const CREATE_LEDGER_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
)
";

/// A record of an applied migration.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// Version of the applied unit.
    pub version: Version,
    /// Name of the unit when it was applied.
    pub name: String,
    /// When the unit was applied.
    pub applied_at: DateTime<Utc>,
}

/// Reads and writes the migration ledger.
///
/// Reads go through the pool. Writes take the connection of the transaction
/// that executes the unit, so a unit and its ledger row commit together.
#[derive(Debug, Clone, Copy)]
pub struct Ledger<'a> {
    pool: &'a AnyPool,
}

impl<'a> Ledger<'a> {
    /// Creates a ledger over the given pool.
    #[must_use]
    pub const fn new(pool: &'a AnyPool) -> Self {
        Self { pool }
    }

    /// Creates the ledger table if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Ledger`] if the table cannot be created.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_LEDGER_TABLE_SQL)
            .execute(self.pool)
            .await
            .map_err(|e| MigrateError::ledger("create the ledger table", e))?;
        Ok(())
    }

    /// Returns the set of applied versions.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Ledger`] if the table cannot be read.
    pub async fn applied_versions(&self) -> Result<BTreeSet<Version>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT version FROM schema_migrations")
            .fetch_all(self.pool)
            .await
            .map_err(|e| MigrateError::ledger("read applied versions", e))?;
        Ok(rows.into_iter().map(|(version,)| version).collect())
    }

    /// Returns every ledger entry in ascending version order.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Ledger`] if the table cannot be read or a
    /// row holds an unreadable `applied_at`.
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT version, name, applied_at FROM schema_migrations ORDER BY version",
        )
        .fetch_all(self.pool)
        .await
        .map_err(|e| MigrateError::ledger("read ledger entries", e))?;

        rows.into_iter()
            .map(|(version, name, applied_at)| -> Result<LedgerEntry> {
                Ok(LedgerEntry {
                    version,
                    name,
                    applied_at: parse_applied_at(version, &applied_at)?,
                })
            })
            .collect()
    }

    /// Records `unit` as applied, on the unit's transaction connection.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Ledger`] if the version is already recorded.
    pub async fn record_applied(&self, conn: &mut AnyConnection, unit: &MigrationUnit) -> Result<()> {
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES ($1, $2, $3)")
            .bind(unit.version())
            .bind(unit.name())
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *conn)
            .await
            .map_err(|e| MigrateError::ledger(format!("record migration {}", unit.version()), e))?;
        Ok(())
    }

    /// Removes the ledger row of `version`, on the unit's transaction connection.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Ledger`] if no row holds `version`.
    pub async fn record_reverted(&self, conn: &mut AnyConnection, version: Version) -> Result<()> {
        let result = sqlx::query("DELETE FROM schema_migrations WHERE version = $1")
            .bind(version)
            .execute(&mut *conn)
            .await
            .map_err(|e| MigrateError::ledger(format!("remove migration {version}"), e))?;

        if result.rows_affected() == 0 {
            return Err(MigrateError::ledger(
                format!("remove migration {version}"),
                sqlx::Error::RowNotFound,
            ));
        }

        Ok(())
    }
}

fn parse_applied_at(version: Version, text: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Rows written by hand with SQL's own timestamp format.
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .map_err(|e| {
            MigrateError::ledger(
                format!("read applied_at '{text}' of migration {version}"),
                sqlx::Error::Decode(Box::new(e)),
            )
        })
}
