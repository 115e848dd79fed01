//! Versioned SQL schema migrations.
//!
//! `deeler-migrate` applies and reverts migration units kept as plain SQL
//! files, where:
//! - Every unit has a numeric version and is applied in version order
//! - Each unit runs in its own transaction together with its ledger row
//! - A failing unit is rolled back and stops the run; earlier units stay applied
//!
//! # Architecture
//!
//! - **Source** - Reads `<version>_<name>.up.sql` / `.down.sql` files into an ordered set
//! - **Ledger** - The `schema_migrations` table recording applied versions
//! - **Engine** - Runs `up`, `down` and `to <version>` against a database
//! - **Database** - Owns the connection pool lent to the engine
//!
//! # Example
//!
//! ```rust,ignore
//! use deeler_migrate::prelude::*;
//!
//! let set = MigrationSource::new("storage/migrations").load()?;
//! let db = Database::connect(&DatabaseOptions::default()).await?;
//!
//! let report = Migrator::new(db.pool(), &set).run(Command::Up).await?;
//! println!("applied: {:?}", report.applied);
//! db.close().await;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Apply all pending migrations
//! migrate up
//!
//! # Revert the most recently applied migration
//! migrate down
//!
//! # Move to exactly one version, applying or reverting as needed
//! migrate to 20240101120000
//! ```

pub mod database;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod source;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::database::{Database, DatabaseOptions};
    pub use crate::engine::{Command, Migrator, Report};
    pub use crate::error::{Direction, LoadError, MigrateError, Result};
    pub use crate::ledger::{Ledger, LedgerEntry};
    pub use crate::source::{MigrationSet, MigrationSource, MigrationUnit, Version};
}
