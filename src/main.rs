//! authgate - forward-authentication gateway for reverse proxies

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use authgate::{
    cli::{Cli, Command, TlsCommand},
    config::Config,
    server::Server,
    setup_tracing, tlsgen,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Tls(tls_cmd)) => run_tls_command(&tls_cmd),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Run TLS helper commands
fn run_tls_command(cmd: &TlsCommand) -> ExitCode {
    match cmd {
        TlsCommand::Init { dir, hostname } => {
            match tlsgen::write_dev_certs(dir, hostname) {
                Ok(()) => {
                    println!("Development certificates written to {}", dir.display());
                    println!("  CA:   tls-ca.pem (key: tls-ca.key)");
                    println!("  Cert: tls-cert.pem");
                    println!("  Key:  tls-key.pem");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to generate certificates: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref bind) = cli.bind {
                config.server.bind = bind.clone();
            }
            if cli.metrics {
                config.metrics.enabled = true;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind,
        port = config.server.port,
        metrics = config.metrics.enabled,
        provider = ?config.auth.provider,
        "Starting authgate"
    );

    let server = match Server::new(Arc::new(config)) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The cancellation token is the single shutdown source; signals feed it.
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    if let Err(e) = server.run(shutdown).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

/// Cancel the token on Ctrl+C or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {},
            () = terminate => {},
        }

        info!("Shutdown signal received");
        shutdown.cancel();
    });
}
