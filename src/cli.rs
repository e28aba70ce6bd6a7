//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Forward-authentication gateway for reverse proxies
#[derive(Parser, Debug)]
#[command(name = "authgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTHGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port for the application server
    #[arg(short, long, env = "AUTHGATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind the application server to
    #[arg(long, env = "AUTHGATE_BIND")]
    pub bind: Option<String>,

    /// Enable the metrics server
    #[arg(long)]
    pub metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "AUTHGATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTHGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// TLS helper commands
    #[command(subcommand)]
    Tls(TlsCommand),
}

/// TLS subcommands
#[derive(Subcommand, Debug)]
pub enum TlsCommand {
    /// Generate a development CA and server certificate pair in the layout
    /// the gateway reads (`tls-ca.pem`, `tls-cert.pem`, `tls-key.pem`)
    Init {
        /// Directory to write the certificates into
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// DNS names for the server certificate
        #[arg(long, default_value = "localhost")]
        hostname: Vec<String>,
    },
}
