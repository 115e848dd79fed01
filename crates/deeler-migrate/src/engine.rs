//! Migration engine.
//!
//! This module applies and reverts migration units against a database. Every
//! unit runs in its own transaction together with its ledger write, so a unit
//! is either fully applied and recorded or not at all. A run stops at the
//! first failing unit; units committed before it stay applied.

use std::collections::BTreeSet;
use std::fmt;

use sqlx::{AnyConnection, AnyPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Direction, MigrateError, Result};
use crate::ledger::Ledger;
use crate::source::{MigrationSet, MigrationUnit, Version};

/// What a migration run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Apply every pending unit.
    Up,
    /// Revert the most recently applied unit.
    Down,
    /// Move the database to exactly this version.
    To(Version),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
            Self::To(version) => write!(f, "to {version}"),
        }
    }
}

/// Units committed by a run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// Versions applied.
    pub applied: Vec<Version>,
    /// Versions reverted.
    pub reverted: Vec<Version>,
}

impl Report {
    /// Returns whether the run changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.reverted.is_empty()
    }

    fn record(&mut self, version: Version, direction: Direction) {
        match direction {
            Direction::Up => self.applied.push(version),
            Direction::Down => self.reverted.push(version),
        }
    }
}

/// Runs migration units from a [`MigrationSet`] against a borrowed pool.
pub struct Migrator<'a> {
    pool: &'a AnyPool,
    set: &'a MigrationSet,
    ledger: Ledger<'a>,
    cancel: CancellationToken,
}

impl<'a> Migrator<'a> {
    /// Creates a migrator for `set` over `pool`.
    #[must_use]
    pub fn new(pool: &'a AnyPool, set: &'a MigrationSet) -> Self {
        Self {
            pool,
            set,
            ledger: Ledger::new(pool),
            cancel: CancellationToken::new(),
        }
    }

    /// Aborts the run when `token` is cancelled.
    ///
    /// A unit in flight at that moment is rolled back.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the migration ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Ledger<'a> {
        &self.ledger
    }

    /// Executes `command`.
    ///
    /// # Errors
    ///
    /// Returns the error of the first unit that fails. Units committed before
    /// it stay applied.
    pub async fn run(&self, command: Command) -> Result<Report> {
        info!(%command, migrations = self.set.len(), "Starting migration run");
        let report = match command {
            Command::Up => self.up().await?,
            Command::Down => self.down().await?,
            Command::To(version) => self.to(version).await?,
        };
        if report.is_noop() {
            info!(%command, "Database already up to date");
        } else {
            info!(
                %command,
                applied = ?report.applied,
                reverted = ?report.reverted,
                "Migration run finished"
            );
        }
        Ok(report)
    }

    /// Applies all pending units in ascending order.
    pub async fn up(&self) -> Result<Report> {
        let applied = self.applied_versions().await?;

        let unknown: Vec<Version> = applied
            .iter()
            .copied()
            .filter(|v| !self.set.contains(*v))
            .collect();
        if !unknown.is_empty() {
            warn!(versions = ?unknown, "Ledger contains migrations missing from the source");
        }

        let pending: Vec<&MigrationUnit> = self
            .set
            .units()
            .iter()
            .filter(|unit| !applied.contains(&unit.version()))
            .collect();

        let mut report = Report::default();
        self.execute_all(&pending, Direction::Up, &mut report)
            .await?;
        Ok(report)
    }

    /// Reverts exactly one unit: the highest applied version.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::NothingToRevert`] on an empty ledger.
    pub async fn down(&self) -> Result<Report> {
        let applied = self.applied_versions().await?;
        let &version = applied.last().ok_or(MigrateError::NothingToRevert)?;
        let unit = self
            .set
            .get(version)
            .ok_or(MigrateError::MissingDefinition(version))?;

        let mut report = Report::default();
        self.execute_all(&[unit], Direction::Down, &mut report)
            .await?;
        Ok(report)
    }

    /// Moves the database to exactly `target`.
    ///
    /// Applied units above `target` are reverted newest first, then pending
    /// units up to and including `target` are applied oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::UnknownVersion`] before touching the database
    /// if no unit has version `target`.
    pub async fn to(&self, target: Version) -> Result<Report> {
        if !self.set.contains(target) {
            return Err(MigrateError::UnknownVersion(target));
        }

        let applied = self.applied_versions().await?;
        if applied.last() == Some(&target) {
            return Ok(Report::default());
        }

        let to_revert = applied
            .iter()
            .rev()
            .filter(|&&v| v > target)
            .map(|&v| self.set.get(v).ok_or(MigrateError::MissingDefinition(v)))
            .collect::<Result<Vec<_>>>()?;
        let to_apply: Vec<&MigrationUnit> = self
            .set
            .units()
            .iter()
            .take_while(|unit| unit.version() <= target)
            .filter(|unit| !applied.contains(&unit.version()))
            .collect();

        let mut report = Report::default();
        self.execute_all(&to_revert, Direction::Down, &mut report)
            .await?;
        self.execute_all(&to_apply, Direction::Up, &mut report)
            .await?;
        Ok(report)
    }

    async fn applied_versions(&self) -> Result<BTreeSet<Version>> {
        self.ledger.ensure_schema().await?;
        self.ledger.applied_versions().await
    }

    /// Executes `units` in the given order, stopping at the first failure.
    async fn execute_all(
        &self,
        units: &[&MigrationUnit],
        direction: Direction,
        report: &mut Report,
    ) -> Result<()> {
        for unit in units {
            if let Err(err) = self.execute(unit, direction).await {
                if !report.is_noop() {
                    warn!(
                        applied = ?report.applied,
                        reverted = ?report.reverted,
                        "Run stopped after partial progress; committed migrations remain in place"
                    );
                }
                return Err(err);
            }
            report.record(unit.version(), direction);
        }
        Ok(())
    }

    /// Runs one unit in its own transaction.
    async fn execute(&self, unit: &MigrationUnit, direction: Direction) -> Result<()> {
        let version = unit.version();
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled { version: None });
        }

        info!(version, name = unit.name(), %direction, "Running migration");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| MigrateError::Transaction {
                version,
                direction,
                source,
            })?;

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(MigrateError::Cancelled { version: Some(version) }),
            result = self.execute_in(&mut tx, unit, direction) => result,
        };

        if let Err(err) = outcome {
            if let Err(rollback) = tx.rollback().await {
                warn!(version, error = %rollback, "Failed to roll back migration transaction");
            } else {
                debug!(version, %direction, "Migration transaction rolled back");
            }
            return Err(err);
        }

        tx.commit()
            .await
            .map_err(|source| MigrateError::Transaction {
                version,
                direction,
                source,
            })?;

        info!(version, name = unit.name(), %direction, "Migration committed");
        Ok(())
    }

    /// Executes the unit's SQL body and ledger write on `conn`.
    async fn execute_in(
        &self,
        conn: &mut AnyConnection,
        unit: &MigrationUnit,
        direction: Direction,
    ) -> Result<()> {
        let version = unit.version();
        let sql = unit.sql(direction);
        if sql.trim().is_empty() {
            debug!(version, %direction, "Empty migration body");
        } else {
            debug!(version, sql, "Executing SQL");
            sqlx::raw_sql(sql)
                .execute(&mut *conn)
                .await
                .map_err(|source| MigrateError::Statement {
                    version,
                    name: unit.name().to_string(),
                    direction,
                    source,
                })?;
        }

        match direction {
            Direction::Up => self.ledger.record_applied(conn, unit).await,
            Direction::Down => self.ledger.record_reverted(conn, version).await,
        }
    }
}
