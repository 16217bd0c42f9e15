//! tun-nat: userspace NAT for a TUN device
//!
//! # Usage
//!
//! ```bash
//! # Run against a tunnel fd inherited from the parent process
//! ./tun-nat -c /path/to/config.json --tun-fd 3
//!
//! # Run with environment overrides
//! TUN_NAT_LOG_LEVEL=debug TUN_NAT_TUN_FD=3 ./tun-nat
//! ```

use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use tun_nat::config::{load_config_with_env, Config};
use tun_nat::outbound::{NoProtection, RouteProtector, SocketProtector};
use tun_nat::tunnel::{run_tunnel_reader, run_tunnel_writer};
use tun_nat::{Engine, TrafficFilter};

/// How long the tunnel writer gets to flush queued replies on shutdown
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Tunnel fd, overrides the configuration
    tun_fd: Option<RawFd>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tun-nat/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut tun_fd = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "--tun-fd" => match args.next().map(|fd| fd.parse::<RawFd>()) {
                    Some(Ok(fd)) if fd >= 0 => tun_fd = Some(fd),
                    _ => {
                        eprintln!("--tun-fd expects a non-negative file descriptor");
                        std::process::exit(1);
                    }
                },
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tun-nat v{}", tun_nat::VERSION);
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
            tun_fd,
        }
    }
}

fn print_help() {
    println!(
        r#"tun-nat v{}

Userspace NAT: terminates TCP and UDP flows read from a TUN device and
relays them over ordinary sockets.

USAGE:
    tun-nat [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tun-nat/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    --tun-fd <FD>           Already-open tunnel file descriptor
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    TUN_NAT_LOG_LEVEL        Override log level (trace, debug, info, warn, error)
    TUN_NAT_TUN_FD           Override tunnel file descriptor
    TUN_NAT_MAX_WORKERS      Override worker pool size
    TUN_NAT_ROUTING_MARK     Override SO_MARK for outbound sockets

The outbound sockets must not be routed back into the tunnel. Either set
protect.routing_mark / protect.bind_interface, or exclude this process
from the tunnel routes.
"#,
        tun_nat::VERSION
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "mio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn build_protector(config: &Config) -> Arc<dyn SocketProtector> {
    let protector = RouteProtector::from_config(&config.protect);
    if protector.is_noop() {
        info!("Outbound sockets are not protected");
        Arc::new(NoProtection)
    } else {
        info!(
            "Outbound sockets protected (mark {:?}, interface {:?})",
            config.protect.routing_mark, config.protect.bind_interface
        );
        Arc::new(protector)
    }
}

/// Open both directions of the tunnel fd
fn open_tunnel(fd: RawFd) -> Result<(tokio::fs::File, tokio::fs::File)> {
    // SAFETY: the fd is handed to this process for its exclusive use and
    // is not owned by anything else in it.
    let file = unsafe { std::fs::File::from_raw_fd(fd) };
    let writer = file
        .try_clone()
        .with_context(|| format!("Failed to duplicate tunnel fd {fd}"))?;
    Ok((tokio::fs::File::from_std(file), tokio::fs::File::from_std(writer)))
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        tun_nat::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    // Load configuration
    let mut config = load_config_with_env(&args.config_path).with_context(|| {
        format!("Failed to load configuration from {:?}", args.config_path)
    })?;
    if let Some(fd) = args.tun_fd {
        config.tunnel.fd = Some(fd);
    }

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tun-nat v{}", tun_nat::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let fd = config
        .tunnel
        .fd
        .ok_or(tun_nat::TunnelError::NoDevice)
        .context("Pass --tun-fd or set tunnel.fd")?;
    let (tun_reader, tun_writer) = open_tunnel(fd)?;

    let (packet_tx, packet_rx) = mpsc::channel(config.tunnel.queue_capacity);
    let mut engine = Engine::start(
        &config.engine,
        build_protector(&config),
        Arc::new(packet_tx),
    )
    .context("Failed to start engine")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let filter = TrafficFilter::new(config.filter.addresses.iter().copied());
    let mut reader_handle = tokio::spawn(run_tunnel_reader(
        tun_reader,
        engine.handler(),
        filter,
        config.tunnel.mtu,
        shutdown_rx,
    ));
    let writer_handle = tokio::spawn(run_tunnel_writer(tun_writer, packet_rx));

    info!(
        "tun-nat ready on fd {} (mtu {}), startup took {:.2}ms",
        fd,
        config.tunnel.mtu,
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let mut reader_finished = false;
    let run_result = tokio::select! {
        result = &mut reader_handle => {
            reader_finished = true;
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("Tunnel reader failed")),
                Err(e) => Err(anyhow::Error::new(e).context("Tunnel reader panicked")),
            }
        }
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
    let _ = shutdown_tx.send(());
    if !reader_finished {
        // The reader holds the dispatcher, and through it the sink
        let _ = reader_handle.await;
    }
    tokio::task::block_in_place(|| engine.shutdown());

    // Dropping the engine releases the last sink; the writer drains what is queued
    let stats = engine.stats().snapshot();
    drop(engine);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_handle)
        .await
        .is_err()
    {
        error!("Tunnel writer did not finish in {:?}", WRITER_DRAIN_TIMEOUT);
    }

    info!(
        "Final stats: {} packets in, {} out, {} malformed, {} unsupported, {} filtered",
        stats.packets_in, stats.packets_out, stats.parse_errors, stats.unsupported, stats.filtered
    );
    info!(
        "Sessions: {} created, {} closed, {} resets sent",
        stats.sessions_created, stats.sessions_closed, stats.resets_sent
    );
    info!(
        "Transferred: {} bytes to remotes, {} bytes from remotes",
        stats.bytes_to_remote, stats.bytes_from_remote
    );
    info!("Shutdown complete");

    run_result
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
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
