//! `teavpn2-server`: CLI driver around `teavpn2_core::Lifecycle`.
//!
//! Owns everything the core deliberately stays out of: argument
//! parsing, config-file loading, the root logger, and the file-backed
//! `AuthAdapter`.

mod auth_file;

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use slog::{Drain, Logger};
use teavpn2_core::config::{Configuration, IfaceConfig, SockType, SocketConfig, SystemConfig};
use teavpn2_core::provision::IpCommandProvisioner;
use teavpn2_core::Lifecycle;

use auth_file::FileAuthAdapter;

/// TeaVPN2 server core — a layer-3 VPN concentrator.
#[derive(Parser, Debug)]
#[command(name = "teavpn2-server", version, about)]
enum Cli {
    Server(ServerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "/var/lib/teavpn2")]
    data_dir: String,

    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, default_value_t = 1)]
    thread: u16,

    #[arg(long, default_value = "tcp")]
    sock_type: String,

    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: String,

    #[arg(long, default_value_t = 55555)]
    bind_port: u16,

    #[arg(long, default_value_t = 256)]
    max_conn: u16,

    #[arg(long, default_value_t = 128)]
    backlog: i32,

    #[arg(long)]
    disable_encryption: bool,

    #[arg(long)]
    ssl_cert: Option<String>,

    #[arg(long)]
    ssl_priv_key: Option<String>,

    #[arg(long, default_value = "tvpn0")]
    dev: String,

    #[arg(long, default_value_t = 1400)]
    mtu: u16,

    #[arg(long, default_value = "10.8.0.1")]
    ipv4: String,

    #[arg(long, default_value = "255.255.255.0")]
    ipv4_netmask: String,
}

/// On-disk mirror of `ServerArgs`; every field optional so a config
/// file may specify a subset and let CLI flags/defaults fill the rest.
#[derive(Debug, Default, serde::Deserialize)]
struct FileConfig {
    data_dir: Option<String>,
    verbose: Option<u8>,
    thread: Option<u16>,
    sock_type: Option<String>,
    bind_addr: Option<String>,
    bind_port: Option<u16>,
    max_conn: Option<u16>,
    backlog: Option<i32>,
    disable_encryption: Option<bool>,
    ssl_cert: Option<String>,
    ssl_priv_key: Option<String>,
    dev: Option<String>,
    mtu: Option<u16>,
    ipv4: Option<String>,
    ipv4_netmask: Option<String>,
}

fn build_logger(verbosity: u8) -> Logger {
    let level = match verbosity {
        0 => slog::Level::Info,
        1 => slog::Level::Debug,
        _ => slog::Level::Trace,
    };
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!("component" => "teavpn2-server"))
}

fn merge(args: ServerArgs, file: FileConfig) -> ServerArgs {
    ServerArgs {
        config: args.config,
        data_dir: file.data_dir.unwrap_or(args.data_dir),
        verbose: file.verbose.unwrap_or(args.verbose),
        thread: file.thread.unwrap_or(args.thread),
        sock_type: file.sock_type.unwrap_or(args.sock_type),
        bind_addr: file.bind_addr.unwrap_or(args.bind_addr),
        bind_port: file.bind_port.unwrap_or(args.bind_port),
        max_conn: file.max_conn.unwrap_or(args.max_conn),
        backlog: file.backlog.unwrap_or(args.backlog),
        disable_encryption: file.disable_encryption.unwrap_or(args.disable_encryption),
        ssl_cert: file.ssl_cert.or(args.ssl_cert),
        ssl_priv_key: file.ssl_priv_key.or(args.ssl_priv_key),
        dev: file.dev.unwrap_or(args.dev),
        mtu: file.mtu.unwrap_or(args.mtu),
        ipv4: file.ipv4.unwrap_or(args.ipv4),
        ipv4_netmask: file.ipv4_netmask.unwrap_or(args.ipv4_netmask),
    }
}

fn into_configuration(args: ServerArgs) -> anyhow::Result<Configuration> {
    let sock_type = match args.sock_type.as_str() {
        "tcp" => SockType::Tcp,
        "udp" => SockType::Udp,
        other => anyhow::bail!("unrecognized --sock-type {other:?}, expected tcp or udp"),
    };

    Ok(Configuration {
        system: SystemConfig {
            config_path: args.config.map(|p| p.display().to_string()),
            data_dir: args.data_dir,
            verbose: args.verbose,
            thread: args.thread,
        },
        socket: SocketConfig {
            sock_type,
            bind_addr: args.bind_addr,
            bind_port: args.bind_port,
            max_conn: args.max_conn,
            backlog: args.backlog,
            use_encrypt: !args.disable_encryption,
            ssl_cert: args.ssl_cert,
            ssl_priv_key: args.ssl_priv_key,
        },
        iface: IfaceConfig {
            dev: args.dev,
            mtu: args.mtu,
            ipv4: args.ipv4,
            ipv4_netmask: args.ipv4_netmask,
        },
    })
}

fn run() -> anyhow::Result<()> {
    let Cli::Server(args) = Cli::parse();

    let file_config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            toml::from_str(&text)?
        }
        None => FileConfig::default(),
    };
    let args = merge(args, file_config);
    let verbose = args.verbose;
    let log = build_logger(verbose);

    let cfg = into_configuration(args)?;
    cfg.validate()?;

    let auth = FileAuthAdapter::new(cfg.system.data_dir.clone(), cfg.iface.clone());
    let provisioner = IpCommandProvisioner;

    let mut lifecycle = Lifecycle::bring_up(&cfg, auth, provisioner, log.clone())?;
    slog::info!(log, "serving"; "bind" => format!("{}:{}", cfg.socket.bind_addr, cfg.socket.bind_port));
    lifecycle.run()?;
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("teavpn2-server: fatal: {e:#}");
        std::process::exit(1);
    }
}
