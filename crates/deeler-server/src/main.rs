//! deeler-server
//!
//! Runs the HTTP server until Ctrl+C or SIGTERM, then stops it gracefully.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use deeler_server::{Server, ServerOptions};

/// HTTP server with graceful shutdown.
#[derive(Parser)]
#[command(name = "deeler-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Host to listen on.
    #[arg(long, env = "HOST", default_value = "localhost")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Logging environment: production, development, or anything else to disable logging.
    #[arg(long, env = "LOG_ENV", default_value = "development")]
    log_env: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(&cli.log_env);

    let server = Arc::new(Server::new(ServerOptions {
        host: cli.host,
        port: cli.port,
        ..ServerOptions::default()
    }));
    let runner = Arc::clone(&server);
    let mut serving = tokio::spawn(async move { runner.start().await });

    tokio::select! {
        joined = &mut serving => {
            // start only returns on its own when listening failed
            return match joined {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(err)) => {
                    error!(error = %err, "Server failed");
                    ExitCode::FAILURE
                }
                Err(err) => {
                    error!(error = %err, "Server task panicked");
                    ExitCode::FAILURE
                }
            };
        }
        () = shutdown_signal() => {}
    }

    if let Err(err) = server.stop().await {
        error!(error = %err, "Failed to stop server");
        return ExitCode::FAILURE;
    }
    match serving.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            error!(error = %err, "Server failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %err, "Server task panicked");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_env: &str) {
    let default_level = match log_env {
        "production" => "info",
        "development" => "debug",
        _ => return,
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
    if let Err(err) = installed {
        eprintln!("Failed to create logger: {err}");
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        () = terminate => info!("Received terminate signal, shutting down gracefully"),
    }
}
