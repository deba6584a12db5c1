//! Kiln daemon - main entry point.
//!
//! Loads configuration from the environment, wires the GitHub adapter,
//! SQLite store, and agent CLI executor into the daemon, and runs the poll
//! loop until SIGINT/SIGTERM. Exit code 0 on clean shutdown; non-zero on
//! fatal configuration or authorization errors.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln::config::Config;
use kiln::daemon::Daemon;
use kiln::executor::AgentCliExecutor;
use kiln::store::SqliteStore;
use kiln::ticket::GitHubAdapter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Configuration error");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        boards = config.boards.len(),
        poll_interval_secs = config.poll_interval.as_secs(),
        max_concurrent = config.max_concurrent_workflows,
        "Starting kiln daemon"
    );

    let store = match SqliteStore::open(&config.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, path = %config.database_path.display(), "Failed to open database");
            return ExitCode::FAILURE;
        }
    };

    let adapter = Arc::new(GitHubAdapter::new(config.github_token.clone()));
    let executor = Arc::new(AgentCliExecutor::new(config.agent_binary.clone()));

    let daemon = match Daemon::new(&config, adapter, store, executor).await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start daemon");
            return ExitCode::FAILURE;
        }
    };

    // SIGINT / SIGTERM enter the cancellation path: the poller stops
    // dispatching, signals every active workflow, and waits for them.
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match daemon.run(shutdown).await {
        Ok(()) => {
            tracing::info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Daemon exited with fatal error");
            ExitCode::FAILURE
        }
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => tracing::info!("SIGINT received, shutting down"),
                _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("Ctrl-C received, shutting down");
        }

        shutdown.cancel();
    });
}
