//! sniffyctl - inspect and edit a sniffy connectivity policy file.
//!
//! The file is the JSON document read by `IO_SNIFFY_REGISTRY_PATH`; editing
//! it here changes which endpoints instrumented processes may reach.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;

use sniffy_core::config::ENV_REGISTRY_PATH;
use sniffy_core::identity::SocketAddress;
use sniffy_core::policy::{PolicyRegistry, PolicyStatus, RegistryError};

/// Connectivity policy editor.
#[derive(Parser)]
#[command(name = "sniffyctl", about = "Inspect and edit sniffy connectivity policy", version)]
struct Args {
    /// Policy file to operate on.
    #[arg(long, env = ENV_REGISTRY_PATH, value_name = "PATH")]
    registry: PathBuf,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is warn level.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every entry.
    Show {
        /// Print the raw policy document.
        #[arg(long)]
        json: bool,
    },
    /// Set the status of a host/port pattern. Omitted fields match anything.
    SetSocket {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// OPEN, CLOSED, THROTTLE(ms), REFUSE_AFTER(ms) or a legacy integer.
        status: PolicyStatus,
    },
    /// Set the status of a data source url/user pattern. Omitted fields match anything.
    SetDataSource {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        user: Option<String>,
        status: PolicyStatus,
    },
    /// Print the effective status for an address ("host:port").
    ResolveSocket {
        #[arg(value_parser = parse_address)]
        address: SocketAddress,
    },
    /// Print the effective status for a data source.
    ResolveDataSource {
        url: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// Turn write-through persistence on or off.
    Persistent {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Remove every entry.
    Clear,
}

fn parse_address(s: &str) -> Result<SocketAddress, String> {
    SocketAddress::parse(s).ok_or_else(|| format!("invalid address '{}', expected host:port", s))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(path = %args.registry.display(), error = %e, "policy command failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), RegistryError> {
    let registry = PolicyRegistry::open(&args.registry)?;
    debug!(
        path = %args.registry.display(),
        entries = registry.entries().len(),
        persistent = registry.is_persistent(),
        "policy file loaded"
    );

    match &args.command {
        Command::Show { json } => {
            if *json {
                let document = serde_json::to_string_pretty(&registry.to_document())?;
                println!("{}", document);
            } else {
                println!("persistent: {}", registry.is_persistent());
                for entry in registry.entries() {
                    println!("{}", entry);
                }
            }
        }
        Command::SetSocket { host, port, status } => {
            registry.set_socket_status(host.as_deref(), *port, *status);
            registry.save()?;
            info!(host = ?host, port = ?port, status = %status, "socket policy saved");
        }
        Command::SetDataSource { url, user, status } => {
            registry.set_data_source_status(url.as_deref(), user.as_deref(), *status);
            registry.save()?;
            info!(url = ?url, user = ?user, status = %status, "data source policy saved");
        }
        Command::ResolveSocket { address } => {
            println!("{}", registry.resolve_socket(&address.host, address.port));
        }
        Command::ResolveDataSource { url, user } => {
            println!("{}", registry.resolve_data_source(url, user.as_deref()));
        }
        Command::Persistent { enabled } => {
            registry.set_persistent(*enabled);
            registry.save()?;
            info!(persistent = enabled, "persistence flag saved");
        }
        Command::Clear => {
            registry.clear();
            registry.save()?;
            info!("policy cleared");
        }
    }
    Ok(())
}

/// Initializes the tracing subscriber on stderr so stdout stays parseable.
/// Default level is WARN. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("sniffyctl={}", level).parse().unwrap())
        .add_directive(format!("sniffy_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
