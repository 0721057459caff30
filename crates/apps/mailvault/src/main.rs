//! mailvault - IMAP mailbox backup into a deduplicated local store
//!
//! Usage:
//!   mailvault backup [--jobs FILE] [--store DIR] [NAME...]
//!   mailvault copy --source NAME --destination NAME [--idle]
//!   mailvault folders [NAME...]
//!   mailvault reindex --store DIR [--mailbox NAME]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use mailsync::{MailboxJob, find_job, load_jobs};

#[derive(Parser)]
#[command(name = "mailvault")]
#[command(about = "Mailbox backup into a deduplicated, indexed local store")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Jobs file (defaults to jobs.json in the config directory)
    #[arg(long, global = true)]
    jobs: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up mailboxes into the store
    Backup {
        /// Store root directory (defaults to the platform data directory)
        #[arg(short, long)]
        store: Option<PathBuf>,
        /// Job names to run (all jobs when omitted)
        names: Vec<String>,
    },
    /// Copy messages from one mailbox to another
    Copy {
        /// Source job name
        #[arg(short, long)]
        source: String,
        /// Destination job name
        #[arg(short, long)]
        destination: String,
        /// Keep running and re-copy on every push notification
        #[arg(long)]
        idle: bool,
    },
    /// List the folders each job can see
    Folders {
        /// Job names to list (all jobs when omitted)
        names: Vec<String>,
    },
    /// Rebuild the metadata index from an existing store tree
    Reindex {
        /// Store root directory
        #[arg(short, long)]
        store: PathBuf,
        /// Link every message to this mailbox name
        #[arg(short, long)]
        mailbox: Option<String>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(err) = config::init() {
        error!("Failed to initialize config directory: {}", err);
    }

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Fatal: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Backup { store, names } => {
            let jobs = load_jobs_file(cli.jobs)?;
            let store = store
                .or_else(config::default_store_dir)
                .context("No store directory given and no data directory available")?;
            for job in selected_jobs(&jobs, &names)? {
                info!("{}: starting backup", job.name);
                // One failed mailbox must not stop the others.
                if let Err(err) = mailsync::backup(job, &store) {
                    error!("{}: backup failed: {:#}", job.name, err);
                }
            }
            Ok(())
        }
        Commands::Copy {
            source,
            destination,
            idle,
        } => {
            let jobs = load_jobs_file(cli.jobs)?;
            let source =
                find_job(&jobs, &source).with_context(|| format!("No job named '{source}'"))?;
            let destination = find_job(&jobs, &destination)
                .with_context(|| format!("No job named '{destination}'"))?;
            mailsync::copy(source, destination, idle)
        }
        Commands::Folders { names } => {
            let jobs = load_jobs_file(cli.jobs)?;
            for job in selected_jobs(&jobs, &names)? {
                mailsync::folder_list(job)?;
            }
            Ok(())
        }
        Commands::Reindex { store, mailbox } => {
            mailsync::update_db_from_archive(&store, mailbox.as_deref())
        }
    }
}

fn load_jobs_file(path: Option<PathBuf>) -> Result<Vec<MailboxJob>> {
    let path = match path {
        Some(path) => path,
        None => config::jobs_path().context("Could not determine config directory")?,
    };
    load_jobs(&path)
}

fn selected_jobs<'a>(jobs: &'a [MailboxJob], names: &[String]) -> Result<Vec<&'a MailboxJob>> {
    if names.is_empty() {
        return Ok(jobs.iter().collect());
    }
    names
        .iter()
        .map(|name| find_job(jobs, name).with_context(|| format!("No job named '{name}'")))
        .collect()
}
