use std::path::PathBuf;

use clap::{Args, Subcommand};
use netbase_peer::DEFAULT_MAX_CONNECTIONS;
use netbase_transport::{EndpointConfig, Mode};

use crate::exit::{CliError, CliResult, INTERNAL};
use crate::logging::LogLevel;
use crate::output::OutputFormat;

pub mod connect;
pub mod datagram;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a stream server that answers every message.
    Serve(ServeArgs),
    /// Connect to a stream server and exchange messages.
    Connect(ConnectArgs),
    /// Exchange messages over datagrams.
    Datagram(DatagramArgs),
    /// Show version information.
    Version(VersionArgs),
}

impl Command {
    /// Level used when `--log-level` is not given. Long-running endpoints
    /// report their lifecycle; one-shot commands only warn.
    pub fn default_log_level(&self) -> LogLevel {
        match self {
            Command::Serve(_) | Command::Datagram(_) => LogLevel::Info,
            Command::Connect(_) | Command::Version(_) => LogLevel::Warn,
        }
    }
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Connect(args) => connect::run(args, format),
        Command::Datagram(args) => datagram::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Address options shared by every endpoint.
#[derive(Args, Debug, Clone)]
pub struct EndpointArgs {
    /// IPv4 address, or a socket path with --unix.
    pub address: String,
    /// Port number (ignored with --unix).
    #[arg(long, short = 'p', default_value_t = 0)]
    pub port: u16,
    /// Use unix domain sockets.
    #[arg(long)]
    pub unix: bool,
    /// Append endpoint events to this file.
    #[arg(long, value_name = "PATH", env = "NETBASE_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl EndpointArgs {
    pub fn mode(&self) -> Mode {
        if self.unix {
            Mode::Local
        } else {
            Mode::Remote
        }
    }

    pub fn config(&self) -> EndpointConfig {
        let config = EndpointConfig::new(self.address.clone(), self.port, self.mode());
        match &self.log_file {
            Some(path) => config.with_log_file(path),
            None => config,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Maximum number of concurrent clients.
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: u16,
    /// Reply sent for every received message.
    #[arg(long, default_value = "Data arrived OK")]
    pub reply: String,
    /// Stop after answering N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Message to send; repeatable. Reads lines from stdin when absent.
    #[arg(long, short = 'd')]
    pub data: Vec<String>,
    /// Do not wait for a reply after each message.
    #[arg(long)]
    pub no_wait: bool,
}

#[derive(Args, Debug)]
pub struct DatagramArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Destination address (a socket path with --unix).
    #[arg(long)]
    pub peer: String,
    /// Destination port.
    #[arg(long, default_value_t = 0)]
    pub peer_port: u16,
    /// Message to send; repeatable.
    #[arg(long, short = 'd')]
    pub data: Vec<String>,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show build details.
    #[arg(long)]
    pub extended: bool,
}

/// Run `on_interrupt` on Ctrl-C.
pub fn install_ctrlc_handler<F>(on_interrupt: F) -> CliResult<()>
where
    F: Fn() + Send + 'static,
{
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received, shutting down");
        on_interrupt();
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
