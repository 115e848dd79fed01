//! Error types for the migration system.

use std::fmt;
use std::path::PathBuf;

use crate::source::Version;

/// Direction a migration unit is executed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Applying the unit with its up SQL.
    Up,
    /// Reverting the unit with its down SQL.
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
        }
    }
}

/// Errors raised while reading migration definitions.
///
/// All of these abort a run before the database is touched.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The migrations directory or one of its files could not be read.
    #[error("Failed to read '{path}': {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// A `.sql` file does not follow the `<version>_<name>.(up|down).sql` layout.
    #[error("Invalid migration file name: {path}")]
    InvalidFileName {
        /// Offending file.
        path: PathBuf,
    },

    /// Two definitions share the same version and direction.
    #[error("Duplicate migration version {version}: '{first}' and '{second}'")]
    DuplicateVersion {
        /// The duplicated version.
        version: Version,
        /// First definition seen.
        first: String,
        /// Second definition seen.
        second: String,
    },

    /// A down file exists without the matching up file.
    #[error("Migration {version} has a down file but no up file")]
    MissingUp {
        /// Version missing its up file.
        version: Version,
    },

    /// Up and down files of one version carry different names.
    #[error("Migration {version} is named '{up}' in its up file but '{down}' in its down file")]
    NameMismatch {
        /// The version.
        version: Version,
        /// Name from the up file.
        up: String,
        /// Name from the down file.
        down: String,
    },
}

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Migration definitions are malformed or unreadable.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The database could not be reached.
    #[error("Failed to connect to database: {0}")]
    Connection(#[source] sqlx::Error),

    /// The tracking table could not be created, read or written.
    #[error("Migration ledger error while trying to {action}: {source}")]
    Ledger {
        /// What the ledger was doing.
        action: String,
        /// Database error.
        source: sqlx::Error,
    },

    /// The SQL body of a migration unit failed.
    #[error("Migration {version} ({name}) failed while running {direction}: {source}")]
    Statement {
        /// Version of the failing unit.
        version: Version,
        /// Name of the failing unit.
        name: String,
        /// Whether the unit was being applied or reverted.
        direction: Direction,
        /// Database error.
        source: sqlx::Error,
    },

    /// A unit's transaction could not be opened or committed.
    #[error("Transaction for migration {version} ({direction}) failed: {source}")]
    Transaction {
        /// Version of the unit.
        version: Version,
        /// Direction of the unit.
        direction: Direction,
        /// Database error.
        source: sqlx::Error,
    },

    /// `down` was requested but nothing has been applied.
    #[error("Nothing to revert: no migrations have been applied")]
    NothingToRevert,

    /// The requested target version is not defined by any migration.
    #[error("Unknown migration version: {0}")]
    UnknownVersion(Version),

    /// The ledger holds a version that must be reverted but has no definition.
    #[error("Applied migration {0} has no definition in the migration source")]
    MissingDefinition(Version),

    /// The run was cancelled.
    #[error("{}", cancelled_message(*.version))]
    Cancelled {
        /// Unit in flight when the cancellation fired, if any.
        version: Option<Version>,
    },
}

impl MigrateError {
    pub(crate) fn ledger(action: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Ledger {
            action: action.into(),
            source,
        }
    }

    /// Returns the version of the migration unit this error is about, if any.
    #[must_use]
    pub const fn version(&self) -> Option<Version> {
        match self {
            Self::Statement { version, .. }
            | Self::Transaction { version, .. }
            | Self::UnknownVersion(version)
            | Self::MissingDefinition(version) => Some(*version),
            Self::Load(LoadError::DuplicateVersion { version, .. })
            | Self::Load(LoadError::MissingUp { version })
            | Self::Load(LoadError::NameMismatch { version, .. }) => Some(*version),
            Self::Cancelled { version } => *version,
            _ => None,
        }
    }
}

fn cancelled_message(version: Option<Version>) -> String {
    match version {
        Some(v) => format!("Migration run cancelled while executing migration {v}"),
        None => "Migration run cancelled".to_string(),
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
