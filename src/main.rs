//! racing-proxy: local HTTP(S) proxy with connection racing
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./racing-proxy
//!
//! # Run with custom configuration
//! ./racing-proxy -c /path/to/config.json
//!
//! # Run with environment overrides
//! RACING_PROXY_LOG_LEVEL=debug ./racing-proxy
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use racing_proxy::config::{create_default_config, load_config_with_env, Config};
use racing_proxy::connection::{run_accept_loop, ConnectionManager, ProxyHandler};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => generate_config = true,
                "--check" => check_config = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("racing-proxy v{}", racing_proxy::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"racing-proxy v{}

Local HTTP(S) proxy racing connections to every address of an origin.

USAGE:
    racing-proxy [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    RACING_PROXY_LISTEN_ADDR      Override listen address
    RACING_PROXY_LOG_LEVEL        Override log level (trace, debug, info, warn, error)
    RACING_PROXY_MAX_CONNECTIONS  Override maximum connections
    RACING_PROXY_DNS_SERVERS      Override upstream DNS servers (comma separated)
    RUST_LOG                      Extra tracing directives
",
        racing_proxy::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    match (config.log.format == "json", config.log.timestamps) {
        (true, true) => builder.json().init(),
        (true, false) => builder.json().without_time().init(),
        (false, true) => builder.init(),
        (false, false) => builder.without_time().init(),
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config_path))?;

    // Filters are compiled here so bad rules fail the check too.
    let handler = ProxyHandler::from_config(&config).context("Failed to build proxy")?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("racing-proxy v{}", racing_proxy::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);
    info!(
        "Filters: {}",
        handler.chain().names().collect::<Vec<_>>().join(", ")
    );

    let connection_manager = Arc::new(ConnectionManager::new(&config.connection, Arc::new(handler)));

    let listener = TcpListener::bind(config.listen.address)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen.address))?;

    info!(
        "racing-proxy ready on {} (transparent TLS: {}), startup took {:.2}ms",
        config.listen.address,
        config.listen.transparent_tls,
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let accept_result = tokio::select! {
        result = run_accept_loop(listener, Arc::clone(&connection_manager)) => result,
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
            Ok(())
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
            Ok(())
        }
    };

    info!("Shutting down...");
    connection_manager.shutdown().await;

    let stats = connection_manager.stats_snapshot();
    info!(
        clients = ?stats.clients,
        requests = ?stats.requests,
        bytes_up = stats.bytes_up,
        bytes_down = stats.bytes_down,
        "final stats"
    );
    info!(
        "Races: tcp {:?} ({:.1}% cached), tls {:?} ({:.1}% cached)",
        stats.tcp,
        stats.tcp.cache_hit_rate(),
        stats.tls,
        stats.tls.cache_hit_rate()
    );

    let direct = connection_manager.handler().direct().connector();
    info!(
        "Address quality: tcp {:?}, tls {:?}",
        direct.tcp.tracker().snapshot(),
        direct.tls.tracker().snapshot()
    );

    info!("Shutdown complete");
    accept_result.context("Accept loop error")
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
