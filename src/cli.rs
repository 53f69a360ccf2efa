use crate::allowlist::{Allowlist, Allowlists};
use crate::config::GreylistConfig;
use crate::daemon::{Config, daemon};
use crate::engine::State;
use crate::greylister::{Greylister, Request};
use crate::immunity::ConnectionSignals;
use crate::maintenance;
use clap::Parser;
use std::error::Error;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const DEFAULT_CONFIG: &str = "/etc/greymilter/greylisting";

#[derive(clap::Parser)]
#[command(version, about)]
struct Cli {
    #[arg(short, long)]
    verbose: bool,
    /// Greylisting options file, one `name value` per line
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Directory holding `<recipient>/greylisting` option files and stores
    #[arg(long)]
    recipient_config_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
pub struct DaemonArgs {
    #[arg(default_value = "0.0.0.0:7045")]
    pub address: String,
    #[arg(long = "fork", default_value_t = 0)]
    pub fork_max: u16,
    #[arg(long = "threads", default_value_t = 0)]
    pub threads_max: u16,
    #[arg(long)]
    pub allowlist_hosts: Option<PathBuf>,
    #[arg(long)]
    pub allowlist_senders: Option<PathBuf>,
    #[arg(long)]
    pub allowlist_recipients: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the milter
    Daemon(DaemonArgs),
    /// Run one decision per recipient against the real database
    Check {
        remote_ip: IpAddr,
        sender: String,
        recipients: Vec<String>,
    },
    /// Remove records older than white_timeout
    Prune,
    /// Convert dotted-quad keys written by older versions
    Migrate,
    /// List records with their current state
    Dump,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "greymilter=debug"
    } else {
        "greymilter=info"
    };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<GreylistConfig, Box<dyn Error>> {
    match path {
        Some(path) => Ok(GreylistConfig::load(path)?.0),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Ok(GreylistConfig::load(Path::new(DEFAULT_CONFIG))?.0)
        }
        None => Ok(GreylistConfig::default()),
    }
}

fn load_allowlist(path: Option<&PathBuf>) -> Result<Allowlist, Box<dyn Error>> {
    match path {
        Some(path) => {
            let list = Allowlist::load(path)
                .map_err(|e| format!("{}: {e}", path.display()))?;
            info!(path = %path.display(), entries = list.len(), "allowlist loaded");
            Ok(list)
        }
        None => Ok(Allowlist::default()),
    }
}

fn cmd_daemon(greylister: Greylister, args: &DaemonArgs) -> Result<(), Box<dyn Error>> {
    let allowlists = Allowlists {
        hosts: load_allowlist(args.allowlist_hosts.as_ref())?,
        senders: load_allowlist(args.allowlist_senders.as_ref())?,
        recipients: load_allowlist(args.allowlist_recipients.as_ref())?,
    };
    let config = Config {
        allowlists: Arc::new(allowlists),
        ..Config::new(greylister)
    };
    daemon(&config, args)
}

fn cmd_check(
    greylister: &Greylister,
    remote_ip: IpAddr,
    sender: &str,
    recipients: &[String],
) -> Result<(), Box<dyn Error>> {
    let signals = ConnectionSignals::default();
    let targets: Vec<Option<&str>> = if recipients.is_empty() {
        vec![None]
    } else {
        recipients.iter().map(|r| Some(r.as_str())).collect()
    };
    for recipient in targets {
        let decision = greylister.try_check(&Request {
            remote_ip,
            sender,
            recipient,
            signals: &signals,
        })?;
        println!("{}: {decision}", recipient.unwrap_or("-"));
    }
    Ok(())
}

fn cmd_dump(greylister: &Greylister) -> Result<(), Box<dyn Error>> {
    let config = greylister.base_config();
    let store = greylister.open_store(config, None)?;
    let now = greylister.now();
    let locked = store.lock()?;
    println!("# {}", store.path().display());
    for (key, record) in locked.iter() {
        match record {
            Some(r) => println!("{key}\t{r}\t{}", State::of(Some(&r), now, config)),
            None => println!("{key}\t(unreadable)"),
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = load_config(cli.config.as_deref())?;
    let greylister = Greylister::new(config).with_recipient_config_dir(cli.recipient_config_dir);
    match cli.command {
        Command::Daemon(args) => cmd_daemon(greylister, &args),
        Command::Check {
            remote_ip,
            sender,
            recipients,
        } => cmd_check(&greylister, remote_ip, &sender, &recipients),
        Command::Prune => {
            let base = greylister.base_config();
            let store = greylister.open_store(base, None)?;
            let pruned = maintenance::prune(&store, base.white_timeout, greylister.now())?;
            println!("pruned {pruned} records from {}", store.path().display());
            Ok(())
        }
        Command::Migrate => {
            let store = greylister.open_store(greylister.base_config(), None)?;
            let migrated = maintenance::migrate_legacy_keys(&store)?;
            println!("migrated {migrated} keys in {}", store.path().display());
            Ok(())
        }
        Command::Dump => cmd_dump(&greylister),
    }
}

pub fn cli() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
