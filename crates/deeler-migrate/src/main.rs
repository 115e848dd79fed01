//! migrate CLI
//!
//! Command-line tool that applies the SQL migrations in a directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use deeler_migrate::prelude::*;

/// Applies versioned SQL schema migrations.
#[derive(Parser)]
#[command(name = "migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database host.
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    host: String,

    /// Database port.
    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    port: u16,

    /// Database user.
    #[arg(long, env = "DB_USER", default_value = "")]
    user: String,

    /// Database password.
    #[arg(long, env = "DB_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Database name.
    #[arg(long, env = "DB_NAME", default_value = "")]
    name: String,

    /// Full connection URL; overrides the individual connection options.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Migrations directory.
    #[arg(short, long, env = "MIGRATIONS_DIR", default_value = "storage/migrations")]
    migrations_dir: PathBuf,

    /// Logging environment: production, development, or anything else to disable logging.
    #[arg(long, env = "LOG_ENV", default_value = "development")]
    log_env: String,

    /// Cancel the run if it takes longer than this many seconds.
    #[arg(long, env = "MIGRATE_TIMEOUT", value_name = "SECONDS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Subcommand)]
enum Commands {
    /// Apply all pending migrations.
    Up,

    /// Revert the most recently applied migration.
    Down,

    /// Migrate to exactly the given version.
    To {
        /// Target version.
        version: Version,
    },
}

impl From<Commands> for Command {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Up => Self::Up,
            Commands::Down => Self::Down,
            Commands::To { version } => Self::To(version),
        }
    }
}

impl Cli {
    fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            name: self.name.clone(),
            url: self.database_url.clone(),
            ..DatabaseOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let logging = match init_logging(&cli.log_env) {
        Ok(enabled) => enabled,
        Err(err) => {
            eprintln!("Failed to create logger: {err:#}");
            false
        }
    };

    match start(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if logging {
                error!(error = %format!("{err:#}"), "Error migrating");
            } else {
                eprintln!("Error migrating: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Installs the global subscriber. Returns whether logging is enabled.
fn init_logging(log_env: &str) -> anyhow::Result<bool> {
    let default_level = match log_env {
        "production" => "info",
        "development" => "debug",
        _ => return Ok(false),
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let installed = if log_env == "production" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!(e))?;
    Ok(true)
}

async fn start(cli: Cli) -> anyhow::Result<()> {
    let command = Command::from(cli.command);

    // Malformed definitions abort before the database is touched
    let set = MigrationSource::new(&cli.migrations_dir)
        .load()
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                cli.migrations_dir.display()
            )
        })?;
    info!(
        count = set.len(),
        dir = %cli.migrations_dir.display(),
        "Loaded migrations"
    );

    let db = Database::connect(&cli.database_options()).await?;

    let token = CancellationToken::new();
    let watcher = watch_for_cancellation(token.clone(), cli.timeout.map(Duration::from_secs));
    let result = Migrator::new(db.pool(), &set)
        .with_cancellation(token)
        .run(command)
        .await;
    watcher.abort();
    db.close().await;

    let report = result.with_context(|| format!("migrate {command} failed"))?;
    if !report.is_noop() {
        info!(
            applied = report.applied.len(),
            reverted = report.reverted.len(),
            "Migrations complete"
        );
    }
    Ok(())
}

/// Cancels `token` on Ctrl+C or once `timeout` elapses.
fn watch_for_cancellation(token: CancellationToken, timeout: Option<Duration>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Received Ctrl+C, cancelling migration run");
            }
            () = deadline => {
                warn!(timeout = ?timeout, "Migration deadline exceeded, cancelling run");
            }
        }
        token.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("migrate").chain(args.iter().copied())).unwrap()
    }

    fn migrations_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("1_users.up.sql"),
            "CREATE TABLE users (id INTEGER);",
        )
        .unwrap();
        std::fs::write(dir.path().join("1_users.down.sql"), "DROP TABLE users;").unwrap();
        dir
    }

    #[test]
    fn test_parse_to_command() {
        let cli = Cli::try_parse_from(["migrate", "to", "20240101"]).unwrap();
        assert_eq!(Command::from(cli.command), Command::To(20_240_101));
    }

    #[test]
    fn test_to_requires_version() {
        let err = Cli::try_parse_from(["migrate", "to"]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert!(err.use_stderr());
    }

    #[test]
    fn test_unknown_command() {
        let err = Cli::try_parse_from(["migrate", "sideways"]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn test_missing_command() {
        let err = Cli::try_parse_from(["migrate"]).err().unwrap();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_connection_flags() {
        let cli = Cli::try_parse_from([
            "migrate", "--host", "db", "--port", "6543", "--user", "app", "--name", "deeler",
            "down",
        ])
        .unwrap();
        let options = cli.database_options();
        assert_eq!(options.host, "db");
        assert_eq!(options.port, 6543);
        assert_eq!(options.user, "app");
        assert_eq!(options.name, "deeler");
        assert_eq!(Command::from(cli.command), Command::Down);
    }

    #[tokio::test]
    async fn test_load_error_fails_before_connecting() {
        let cli = parse(&[
            "--migrations-dir",
            "/definitely/not/here",
            "--database-url",
            "sqlite:///definitely/not/here/db.sqlite3",
            "up",
        ]);
        let err = start(cli).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to load migrations"));
        assert!(err.downcast_ref::<LoadError>().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_database_fails() {
        let dir = migrations_dir();
        let cli = parse(&[
            "--migrations-dir",
            dir.path().to_str().unwrap(),
            "--database-url",
            "sqlite:///definitely/not/here/db.sqlite3",
            "up",
        ]);
        let err = start(cli).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MigrateError>(),
            Some(MigrateError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_run_outcomes() {
        let dir = migrations_dir();
        let db = dir.path().join("deeler.sqlite3");
        let url = format!("sqlite://{}?mode=rwc", db.display());
        let args = |command: &'static str| {
            parse(&[
                "--migrations-dir",
                dir.path().to_str().unwrap(),
                "--database-url",
                url.as_str(),
                command,
            ])
        };

        start(args("up")).await.unwrap();
        start(args("down")).await.unwrap();

        let err = start(args("down")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MigrateError>(),
            Some(MigrateError::NothingToRevert)
        ));
    }
}
