//! mcp-stdio-gateway: expose a stdio MCP server over WebSocket or HTTP
//!
//! Runs the configured command as a child process per client and bridges
//! its standard input and output to the network.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mcp_stdio_gateway::config::{self, Config, Transport};
use mcp_stdio_gateway::gateway::server::{run_boot_command, Gateway};

/// Expose a stdio MCP server over WebSocket or streamable HTTP.
///
/// Command-line flags and their environment variables override the
/// configuration file.
#[derive(Parser, Debug)]
#[command(name = "mcp-stdio-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Command line of the stdio MCP server to run
    #[arg(long, env = "MCP_COMMAND")]
    command: Option<String>,

    /// Shell command to run once before serving
    #[arg(long, env = "BOOT_COMMAND")]
    boot_command: Option<String>,

    /// Transport to expose
    #[arg(long, env = "TRANSPORT", value_enum)]
    transport: Option<Transport>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Number of warm processes to keep (at most 10)
    #[arg(long, env = "POOL_SIZE")]
    pool_size: Option<usize>,

    /// Restart dead session processes automatically
    #[arg(long, env = "DURABLE_MODE", value_parser = clap::builder::BoolishValueParser::new())]
    durable: Option<bool>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Layers command-line values over the file configuration.
    fn apply(&self, cfg: &mut Config) {
        if let Some(command) = &self.command {
            cfg.command.clone_from(command);
        }
        if let Some(boot_command) = &self.boot_command {
            cfg.boot_command = Some(boot_command.clone()).filter(|c| !c.trim().is_empty());
        }
        if let Some(transport) = self.transport {
            cfg.transport = transport;
        }
        if let Some(port) = self.port {
            cfg.server.listen.set_port(port);
        }
        if let Some(size) = self.pool_size {
            cfg.pool.size = size;
        }
        if let Some(durable) = self.durable {
            cfg.session.durable = durable;
        }
    }
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "info" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Entry point for the gateway.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let mut cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut cfg);
    if let Err(e) = cfg.validate() {
        eprintln!("Configuration error: {e}");
        if config_path.is_none() {
            if let Some(default_path) = config::default_config_path() {
                eprintln!("\nConfig file location: {}", default_path.display());
            }
        }
        return ExitCode::FAILURE;
    }

    // Initialise logging
    init_tracing(get_log_level(args.verbose, args.quiet, &cfg.logging.level));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = %cfg.command,
        transport = %cfg.transport,
        "Starting mcp-stdio-gateway"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => {
            info!("Gateway shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Gateway error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(boot_command) = &cfg.boot_command {
        run_boot_command(boot_command).await?;
    }

    let listener = tokio::net::TcpListener::bind(cfg.server.listen).await?;
    let gateway = Gateway::build(&cfg).await?;

    let path = match cfg.transport {
        Transport::Websocket => &cfg.server.websocket_path,
        Transport::Http | Transport::Session => &cfg.server.http_path,
    };
    info!(
        addr = %cfg.server.listen,
        path = %path,
        transport = %cfg.transport,
        "Gateway listening"
    );

    gateway.serve(listener).await?;
    Ok(())
}
