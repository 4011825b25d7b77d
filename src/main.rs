use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use brine::config::{MasterConfig, MinionConfig};
use brine::error::BrineError;
use brine::master::Master;
use brine::minion::run_minion;
use brine::pki::identity::load_public_key;
use brine::pki::{fingerprint, AcceptedKeySet, FsKeyBackend, KeyState};
use brine::shutdown::install_shutdown_handler;
use brine::transport::TcpTransport;

/// Process exit code when a master fails an integrity check.
const EXIT_SECURITY_VIOLATION: u8 = 42;
/// Process exit code when no master could be resolved.
const EXIT_RESOLUTION: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "brine")]
#[command(version)]
#[command(about = "Master/minion remote execution with authenticated sessions")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a master
    Master {
        /// Path to the master YAML configuration
        #[arg(long, short = 'c', default_value = "/etc/brine/master")]
        config: PathBuf,
    },

    /// Run a minion
    Minion {
        /// Path to the minion YAML configuration
        #[arg(long, short = 'c', default_value = "/etc/brine/minion")]
        config: PathBuf,
    },

    /// Inspect and manage minion keys held by a master
    Key {
        /// Master pki directory
        #[arg(long, default_value = "/etc/brine/pki/master")]
        pki_dir: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum KeyCommands {
    /// List minion keys by state
    List,
    /// Accept a pending or rejected minion key
    Accept { id: String },
    /// Reject a minion key
    Reject { id: String },
    /// Print the fingerprint of a public key in the pki directory
    Fingerprint {
        /// Key name, e.g. `master` or `master_sign`
        #[arg(long, default_value = "master")]
        name: String,
    },
}

#[derive(Serialize)]
struct KeyListOutput {
    accepted: Vec<String>,
    pending: Vec<String>,
    rejected: Vec<String>,
}

#[derive(Serialize)]
struct KeyActionOutput {
    id: String,
    state: String,
}

#[derive(Serialize)]
struct FingerprintOutput {
    name: String,
    fingerprint: String,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn exit_code(err: &BrineError) -> u8 {
    match err {
        BrineError::SecurityViolation(_) => EXIT_SECURITY_VIOLATION,
        BrineError::Resolution { .. } => EXIT_RESOLUTION,
        _ => 1,
    }
}

// =============================================================================
// Daemons
// =============================================================================

async fn run_master(config: PathBuf) -> Result<(), BrineError> {
    let config = MasterConfig::load(&config)?;
    tracing::info!(
        id = %config.id,
        interface = %config.interface,
        ret_port = config.ret_port,
        api_port = ?config.api_port,
        worker_threads = config.worker_threads,
        "Starting brine master"
    );

    let shutdown = install_shutdown_handler()?;
    let master = Arc::new(Master::bootstrap(config).await?);
    master.run(shutdown).await
}

async fn run_minion_daemon(config: PathBuf) -> Result<(), BrineError> {
    let config = MinionConfig::load(&config)?;
    tracing::info!(
        id = %config.id,
        masters = ?config.masters,
        master_type = %config.effective_master_type(),
        "Starting brine minion"
    );

    let shutdown = install_shutdown_handler()?;
    run_minion(config, Arc::new(TcpTransport::default()), shutdown).await
}

// =============================================================================
// Key management
// =============================================================================

async fn handle_key(
    pki_dir: PathBuf,
    output: &OutputFormat,
    command: KeyCommands,
) -> Result<(), BrineError> {
    if let KeyCommands::Fingerprint { name } = &command {
        let key = load_public_key(&pki_dir.join(format!("{}.pub", name))).await?;
        let out = FingerprintOutput {
            name: name.clone(),
            fingerprint: fingerprint(&key),
        };
        match output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            OutputFormat::Table => println!("{}: {}", out.name, out.fingerprint),
        }
        return Ok(());
    }

    let mut keys = AcceptedKeySet::new(Box::new(FsKeyBackend::new(&pki_dir)))?;
    match command {
        KeyCommands::List => {
            let out = KeyListOutput {
                accepted: keys.list(KeyState::Accepted),
                pending: keys.list(KeyState::Pending),
                rejected: keys.list(KeyState::Rejected),
            };
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&out)?),
                OutputFormat::Table => {
                    for (title, ids) in [
                        ("Accepted Keys:", &out.accepted),
                        ("Unaccepted Keys:", &out.pending),
                        ("Rejected Keys:", &out.rejected),
                    ] {
                        println!("{}", title);
                        for id in ids {
                            println!("  {}", id);
                        }
                    }
                }
            }
        }
        KeyCommands::Accept { id } | KeyCommands::Reject { id } if keys.get(&id).is_none() => {
            return Err(BrineError::Config(format!("no key for minion {}", id)));
        }
        KeyCommands::Accept { id } => print_key_action(output, &id, keys.accept(&id))?,
        KeyCommands::Reject { id } => print_key_action(output, &id, keys.reject(&id))?,
        KeyCommands::Fingerprint { .. } => {}
    }
    Ok(())
}

fn print_key_action(
    output: &OutputFormat,
    id: &str,
    state: Option<KeyState>,
) -> Result<(), BrineError> {
    let state = state.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into());
    match output {
        OutputFormat::Json => {
            let out = KeyActionOutput {
                id: id.to_string(),
                state,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => println!("Key for minion {} is now {}", id, state),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let result = match args.command {
        Commands::Master { config } => run_master(config).await,
        Commands::Minion { config } => run_minion_daemon(config).await,
        Commands::Key {
            pki_dir,
            output,
            command,
        } => handle_key(pki_dir, &output, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            tracing::error!(error = %e, exit_code = code, "Exiting");
            eprintln!("Error: {}", e);
            ExitCode::from(code)
        }
    }
}
