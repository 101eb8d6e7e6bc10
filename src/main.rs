use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use crate::condor::submit::CondorSubmitter;
use crate::condor::write::stage;
use crate::config::Configuration;
use crate::request::message::{load_schema, Message};
use crate::request::read::get_message_paths;

/// Render, stage and submit job requests
mod condor;
/// JSON configuration
mod config;
mod error;
/// Job requests and the job model
mod request;

#[derive(Parser, Debug)]
#[command(name = "condor-launcher")]
#[command(about = "Submit job requests to an HTCondor cluster")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,
    /// A job request JSON file, or a directory of them
    #[arg(short, long)]
    request: PathBuf,
    /// Stage job files without running condor_submit
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    info!("terve! starting up :)");

    let args = Args::parse();
    let config = Configuration::load(&args.config)?;
    if !config.valid() {
        bail!("Invalid configuration in {}", args.config.display());
    }

    let schema = load_schema()?;
    let submitter = CondorSubmitter::new(config.scheduler_env());

    for path in request_paths(&args.request)? {
        let message = Message::new(&path, &schema);
        let submission = message
            .read()
            .with_context(|| format!("Can't load job request {}", path.display()))?
            .with_defaults(&config);
        info!("Loaded analysis {} ({}) for {}", submission.name, submission.uuid, submission.username);

        let files = stage(&config.condor_log_path, &submission)
            .with_context(|| format!("Can't stage submission {}", submission.uuid))?;

        if args.dry_run {
            info!("--dry-run set, not submitting {} ({})", files.cmd_path.display(), files.sh_path.display());
            continue;
        }

        let job_id = submitter
            .submit(&files, &submission)
            .with_context(|| format!("Can't submit {}", submission.uuid))?;
        println!("{}\t{}", submission.uuid, job_id);
    }

    Ok(())
}

fn request_paths(path: &Path) -> Result<Vec<PathBuf>> {
    match path.is_dir() {
        true => get_message_paths(path).with_context(|| format!("Can't list job requests in {}", path.display())),
        false => Ok(vec![path.to_path_buf()]),
    }
}
