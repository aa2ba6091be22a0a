//! dualspeed - concurrent TCP + UDP throughput testing

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dualspeed::client::{Client, ClientConfig, DEFAULT_DISCOVERY_TIMEOUT, DEFAULT_FILE_SIZE};
use dualspeed::config::Config;
use dualspeed::discover::{BroadcastConfig, DEFAULT_BROADCAST_INTERVAL};
use dualspeed::output::plain::output_result_line;
use dualspeed::output::{output_csv, output_json, output_plain};
use dualspeed::protocol::{
    DEFAULT_DISCOVERY_PORT, DEFAULT_SEGMENT_SIZE, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT,
    MAX_SEGMENT_SIZE, ServerEndpoint, TransferResult,
};
use dualspeed::serve::{Server, ServerConfig};
use dualspeed::tcp::TcpConfig;
use dualspeed::udp::{DEFAULT_SILENCE_TIMEOUT, UdpReceiveConfig, UdpSendConfig};

/// Output format options
struct OutputOptions {
    json: bool,
    csv: bool,
    quiet: bool,
    output: Option<PathBuf>,
}

/// Initialize logging with optional file output
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = log_level.unwrap_or("info");
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("dualspeed={}", level).parse()?);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%H:%M:%S".to_string(),
        ));

    if let Some(file_path) = log_file {
        let expanded_path = if let Some(rest) = file_path.strip_prefix("~/") {
            dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(file_path))
        } else {
            PathBuf::from(file_path)
        };

        if let Some(parent) = expanded_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file_appender = tracing_appender::rolling::daily(
            expanded_path
                .parent()
                .unwrap_or_else(|| std::path::Path::new(".")),
            expanded_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("dualspeed.log")),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Keep guard alive for the duration of the program
        std::mem::forget(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "dualspeed")]
#[command(author, version, about = "Concurrent TCP + UDP throughput testing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Generate shell completions
    #[arg(long, value_name = "SHELL", value_parser = ["bash", "zsh", "fish", "powershell", "elvish"])]
    completions: Option<String>,

    /// Server address; when omitted the server is found by broadcast discovery
    #[arg(value_name = "HOST", env = "DUALSPEED_HOST")]
    host: Option<String>,

    /// Server TCP port (with HOST) [default: 12345]
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Server UDP port (with HOST) [default: 13117]
    #[arg(long)]
    udp_port: Option<u16>,

    /// Port to listen on for offers [default: 13118]
    #[arg(long, env = "DUALSPEED_DISCOVERY_PORT")]
    discovery_port: Option<u16>,

    /// How long to wait for an offer
    #[arg(long, value_parser = parse_duration)]
    discovery_timeout: Option<Duration>,

    /// Bytes requested per connection (e.g., 1M, 500K)
    #[arg(short = 's', long, value_parser = parse_size, env = "DUALSPEED_FILE_SIZE")]
    size: Option<u64>,

    /// Number of TCP connections
    #[arg(short = 'T', long)]
    tcp: Option<u32>,

    /// Number of UDP connections
    #[arg(short = 'U', long)]
    udp: Option<u32>,

    /// UDP receive silence after which a transfer ends
    #[arg(long, value_parser = parse_duration)]
    silence_timeout: Option<Duration>,

    /// Disable Nagle algorithm
    #[arg(long)]
    tcp_nodelay: bool,

    /// Number of test rounds (0 = until interrupted)
    #[arg(short = 'n', long, default_value_t = 1)]
    rounds: u32,

    /// JSON output
    #[arg(long)]
    json: bool,

    /// CSV output
    #[arg(long)]
    csv: bool,

    /// Quiet mode - suppress per-connection lines, show only summary
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Save the last round's report as JSON
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Log file path (e.g., "~/.config/dualspeed/dualspeed.log")
    #[arg(long, env = "DUALSPEED_LOG_FILE")]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "DUALSPEED_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start server mode
    Serve {
        /// Address to bind the service sockets to
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,

        /// TCP service port
        #[arg(long, env = "DUALSPEED_TCP_PORT")]
        tcp_port: Option<u16>,

        /// UDP service port
        #[arg(long, env = "DUALSPEED_UDP_PORT")]
        udp_port: Option<u16>,

        /// Port offers are sent to [default: 13118]
        #[arg(long, env = "DUALSPEED_DISCOVERY_PORT")]
        discovery_port: Option<u16>,

        /// Offer destination address
        #[arg(long)]
        broadcast_addr: Option<IpAddr>,

        /// Interval between offers
        #[arg(long, value_parser = parse_duration)]
        broadcast_interval: Option<Duration>,

        /// Do not send offers
        #[arg(long)]
        no_broadcast: bool,

        /// UDP segment payload size in bytes
        #[arg(long, value_parser = parse_segment_size)]
        segment_size: Option<usize>,

        /// Pause between UDP segments (e.g., 1ms)
        #[arg(long, value_parser = parse_duration)]
        pace: Option<Duration>,

        /// Log file path
        #[arg(long, env = "DUALSPEED_LOG_FILE")]
        log_file: Option<String>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long, env = "DUALSPEED_LOG_LEVEL")]
        log_level: Option<String>,
    },

    /// Wait for a server offer and print it
    Discover {
        /// Port to listen on for offers
        #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
        port: u16,

        /// Discovery timeout
        #[arg(long, default_value = "5s", value_parser = parse_duration)]
        timeout: Duration,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_uppercase();
    let (num, suffix) = if s.ends_with('G') {
        (s.trim_end_matches('G'), 1024 * 1024 * 1024u64)
    } else if s.ends_with('M') {
        (s.trim_end_matches('M'), 1024 * 1024u64)
    } else if s.ends_with('K') {
        (s.trim_end_matches('K'), 1024u64)
    } else {
        (s.as_str(), 1u64)
    };

    let size = num
        .parse::<u64>()
        .map_err(|e| e.to_string())?
        .checked_mul(suffix)
        .ok_or_else(|| "size too large".to_string())?;
    if size == 0 {
        return Err("size must be greater than 0".to_string());
    }
    Ok(size)
}

fn parse_segment_size(s: &str) -> Result<usize, String> {
    let size = s.parse::<usize>().map_err(|e| e.to_string())?;
    if size == 0 || size > MAX_SEGMENT_SIZE {
        return Err(format!("segment size must be 1..={}", MAX_SEGMENT_SIZE));
    }
    Ok(size)
}

/// CLI flag, then config file, then built-in default
fn resolve_port(flag: Option<u16>, file: Option<u16>, default: u16) -> u16 {
    flag.or(file).unwrap_or(default)
}

/// Whether each round listens for a fresh offer
fn rediscovers(config: &ClientConfig) -> bool {
    config.server.is_none()
}

fn resolve_host(host: &str) -> Result<IpAddr> {
    let addrs: Vec<IpAddr> = (host, 0)
        .to_socket_addrs()
        .with_context(|| format!("Could not resolve host: {}", host))?
        .map(|a| a.ip())
        .collect();
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow::anyhow!("No addresses found for host: {}", host))
}

fn generate_completions(shell: &str) {
    use clap::CommandFactory;
    use clap_complete::{Shell, generate};

    let mut cmd = Cli::command();
    let shell = match shell {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" => Shell::PowerShell,
        "elvish" => Shell::Elvish,
        _ => {
            eprintln!("Unknown shell: {}", shell);
            std::process::exit(1);
        }
    };
    generate(shell, &mut cmd, "dualspeed", &mut std::io::stdout());
}

fn parse_config_duration(value: Option<&String>, key: &str) -> Result<Option<Duration>> {
    value
        .map(|s| parse_duration(s).map_err(|e| anyhow::anyhow!("config {}: {}", key, e)))
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(ref shell) = cli.completions {
        generate_completions(shell);
        return Ok(());
    }

    // Load config file (falls back to defaults if not found)
    let file_config = Config::load().unwrap_or_default();

    match cli.command {
        Some(Commands::Serve {
            bind,
            tcp_port,
            udp_port,
            discovery_port,
            broadcast_addr,
            broadcast_interval,
            no_broadcast,
            segment_size,
            pace,
            log_file,
            log_level,
        }) => {
            let server_defaults = &file_config.server;
            init_logging(
                log_file.as_ref().or(server_defaults.log_file.as_ref()).map(|s| s.as_str()),
                log_level.as_ref().or(server_defaults.log_level.as_ref()).map(|s| s.as_str()),
            )?;

            let broadcast = if no_broadcast {
                None
            } else {
                let target = match broadcast_addr {
                    Some(addr) => Some(addr),
                    None => server_defaults
                        .broadcast_addr
                        .as_deref()
                        .map(str::parse::<IpAddr>)
                        .transpose()
                        .context("config broadcast_addr")?,
                };
                let interval = match broadcast_interval {
                    Some(interval) => Some(interval),
                    None => parse_config_duration(
                        server_defaults.broadcast_interval.as_ref(),
                        "broadcast_interval",
                    )?,
                };
                let defaults = BroadcastConfig::default();
                Some(BroadcastConfig {
                    discovery_port: resolve_port(
                        discovery_port,
                        server_defaults.discovery_port,
                        DEFAULT_DISCOVERY_PORT,
                    ),
                    target: target.unwrap_or(defaults.target),
                    interval: interval.unwrap_or(DEFAULT_BROADCAST_INTERVAL),
                })
            };

            let pace = match pace {
                Some(pace) => Some(pace),
                None => parse_config_duration(server_defaults.pace.as_ref(), "pace")?,
            };

            let config = ServerConfig {
                bind_ip: bind,
                tcp_port: resolve_port(tcp_port, server_defaults.tcp_port, DEFAULT_TCP_PORT),
                udp_port: resolve_port(udp_port, server_defaults.udp_port, DEFAULT_UDP_PORT),
                broadcast,
                tcp: TcpConfig::default(),
                udp: UdpSendConfig {
                    segment_size: segment_size
                        .or(server_defaults.segment_size)
                        .unwrap_or(DEFAULT_SEGMENT_SIZE)
                        .clamp(1, MAX_SEGMENT_SIZE),
                    pace,
                },
            };
            Server::new(config).run().await?;
        }

        Some(Commands::Discover { port, timeout }) => {
            init_logging(cli.log_file.as_deref(), cli.log_level.as_deref())?;
            println!("Waiting for offers on port {}...", port);

            match dualspeed::discover::discover(port, timeout).await {
                Ok(server) => println!("Found server: {}", server),
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }

        None => {
            let client_defaults = &file_config.client;
            init_logging(
                cli.log_file.as_ref().or(client_defaults.log_file.as_ref()).map(|s| s.as_str()),
                cli.log_level.as_ref().or(client_defaults.log_level.as_ref()).map(|s| s.as_str()),
            )?;

            let host = cli.host.clone().or_else(|| client_defaults.host.clone());
            let server = match host {
                Some(host) => Some(ServerEndpoint {
                    ip: resolve_host(&host)?,
                    tcp_port: resolve_port(cli.tcp_port, client_defaults.tcp_port, DEFAULT_TCP_PORT),
                    udp_port: resolve_port(cli.udp_port, client_defaults.udp_port, DEFAULT_UDP_PORT),
                }),
                None => None,
            };

            let file_size = match cli.size {
                Some(size) => size,
                None => match client_defaults.file_size.as_deref() {
                    Some(s) => parse_size(s).map_err(|e| anyhow::anyhow!("config file_size: {}", e))?,
                    None => DEFAULT_FILE_SIZE,
                },
            };

            let discovery_timeout = match cli.discovery_timeout {
                Some(timeout) => timeout,
                None => parse_config_duration(
                    client_defaults.discovery_timeout.as_ref(),
                    "discovery_timeout",
                )?
                .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT),
            };

            let silence_timeout = match cli.silence_timeout {
                Some(timeout) => timeout,
                None => parse_config_duration(
                    client_defaults.silence_timeout.as_ref(),
                    "silence_timeout",
                )?
                .unwrap_or(DEFAULT_SILENCE_TIMEOUT),
            };

            let config = ClientConfig {
                server,
                discovery_port: resolve_port(
                    cli.discovery_port,
                    client_defaults.discovery_port,
                    DEFAULT_DISCOVERY_PORT,
                ),
                discovery_timeout,
                file_size,
                tcp_connections: cli.tcp.or(client_defaults.tcp_connections).unwrap_or(1),
                udp_connections: cli.udp.or(client_defaults.udp_connections).unwrap_or(1),
                tcp: TcpConfig {
                    nodelay: cli.tcp_nodelay || client_defaults.tcp_nodelay.unwrap_or(false),
                    ..Default::default()
                },
                udp: UdpReceiveConfig {
                    silence_timeout,
                    ..Default::default()
                },
            };
            config.validate()?;

            let opts = OutputOptions {
                json: cli.json || client_defaults.json_output.unwrap_or(false),
                csv: cli.csv,
                quiet: cli.quiet,
                output: cli.output.clone(),
            };

            run_client(config, opts, cli.rounds).await?;
        }
    }

    Ok(())
}

async fn run_client(config: ClientConfig, opts: OutputOptions, rounds: u32) -> Result<()> {
    let client = Client::new(config);
    let mut round: u32 = 0;

    loop {
        round += 1;
        if rounds != 1 {
            info!("Round {}", round);
        }

        tokio::select! {
            result = run_round(&client, &opts) => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }

        if rounds != 0 && round >= rounds {
            break;
        }
        if rediscovers(client.config()) {
            info!("All transfers complete, listening to offer requests");
        }
    }

    Ok(())
}

async fn run_round(client: &Client, opts: &OutputOptions) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<TransferResult>(100);
    let live = !(opts.quiet || opts.json || opts.csv);

    // Print each connection as it finishes
    let print_handle = tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            if live {
                println!("{}", output_result_line(&result));
                let _ = io::stdout().flush();
            }
        }
    });

    let report = client.run(Some(tx)).await;
    let _ = print_handle.await;
    let report = report?;

    let output_str = if opts.json {
        output_json(&report)
    } else if opts.csv {
        output_csv(&report)
    } else {
        output_plain(&report)
    };
    println!("{}", output_str);

    if let Some(path) = &opts.output {
        dualspeed::output::json::save_json(&report, path)?;
        info!("Results saved to {}", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1000"), Ok(1000));
        assert_eq!(parse_size("1K"), Ok(1024));
        assert_eq!(parse_size("2m"), Ok(2 * 1024 * 1024));
        assert!(parse_size("0").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn test_parse_segment_size() {
        assert_eq!(parse_segment_size("1024"), Ok(1024));
        assert!(parse_segment_size("0").is_err());
        assert!(parse_segment_size("70000").is_err());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["dualspeed", "10.0.0.2", "-s", "1M", "-T", "5", "-U", "5"])
            .unwrap();
        assert_eq!(cli.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(cli.size, Some(1024 * 1024));
        assert_eq!(cli.tcp, Some(5));
        assert_eq!(cli.udp, Some(5));
    }

    #[test]
    fn test_port_precedence() {
        assert_eq!(resolve_port(Some(1), Some(2), 3), 1);
        assert_eq!(resolve_port(None, Some(2), 3), 2);
        assert_eq!(resolve_port(None, None, 3), 3);

        let cli = Cli::try_parse_from(["dualspeed", "10.0.0.2"]).unwrap();
        assert!(cli.tcp_port.is_none());
        assert!(cli.udp_port.is_none());
    }

    #[test]
    fn test_rediscovers_only_without_host() {
        assert!(rediscovers(&ClientConfig::default()));

        let config = ClientConfig {
            server: Some(ServerEndpoint {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                tcp_port: DEFAULT_TCP_PORT,
                udp_port: DEFAULT_UDP_PORT,
            }),
            ..Default::default()
        };
        assert!(!rediscovers(&config));
    }

    #[test]
    fn test_resolve_literal_ip() {
        assert_eq!(
            resolve_host("127.0.0.1").unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }
}
