use std::env;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use log::{info, warn};
use regex::bytes::Regex;

use crate::condor::write::SubmissionFiles;
use crate::config::SchedulerEnv;
use crate::error::SubmitError;
use crate::request::submission::Submission;

/// HTCondor's submission tool
pub static CONDOR_SUBMIT: &str = "condor_submit";

/// What a finished process left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stdout and stderr interleaved as the process wrote them
    pub output: Vec<u8>,
}

/// Runs external programs
///
/// `env` is the complete environment of the child, nothing is inherited.
pub trait CommandRunner {
    fn run(&self, program: &Path, args: &[&OsStr], dir: &Path, env: &[(&str, &str)]) -> io::Result<CommandOutput>;
}

/// Runs programs with [`std::process::Command`], blocking until they exit
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[&OsStr], dir: &Path, env: &[(&str, &str)]) -> io::Result<CommandOutput> {
        // stdout and stderr share one pipe so the output keeps the order it was written in
        let (mut reader, writer) = os_pipe::pipe()?;
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(dir)
            .env_clear()
            .envs(env.iter().copied())
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        info!("Running {:?}", &command);

        let mut child = command.spawn()?;
        // the command still holds the write ends, reading only sees EOF once they're closed
        drop(command);

        let mut output = Vec::new();
        reader.read_to_end(&mut output)?;
        let status = child.wait()?;

        Ok(CommandOutput { success: status.success(), code: status.code(), output })
    }
}

/// Submits staged jobs with `condor_submit`
pub struct CondorSubmitter<R: CommandRunner = SystemRunner> {
    env: SchedulerEnv,
    runner: R,
    binary: String,
}

impl CondorSubmitter<SystemRunner> {
    pub fn new(env: SchedulerEnv) -> Self {
        CondorSubmitter::with_runner(env, SystemRunner)
    }
}

impl<R: CommandRunner> CondorSubmitter<R> {
    pub fn with_runner(env: SchedulerEnv, runner: R) -> Self {
        CondorSubmitter { env, runner, binary: CONDOR_SUBMIT.to_string() }
    }

    /// Find the submission tool on the configured search path
    ///
    /// Relative search path entries are resolved against `dir`.
    pub fn locate(&self, dir: &Path) -> Result<PathBuf, SubmitError> {
        let found = which::which_in(&self.binary, Some(&self.env.path), dir).map_err(|source| {
            SubmitError::BinaryNotFound {
                binary: self.binary.clone(),
                search_path: self.env.path.clone(),
                source,
            }
        })?;

        if found.is_absolute() {
            return Ok(found);
        }
        env::current_dir()
            .map(|cwd| cwd.join(&found))
            .map_err(|source| SubmitError::PathResolution { path: found, source })
    }

    /// Submit the staged files, returning the cluster id HTCondor assigned
    ///
    /// The id is empty if the tool succeeded but its output didn't mention a cluster.
    pub fn submit(&self, files: &SubmissionFiles, submission: &Submission) -> Result<String, SubmitError> {
        let dir = files.working_directory();
        let program = self.locate(dir)?;
        info!("Submitting {} with {}", submission.uuid, program.display());

        let result = self
            .runner
            .run(&program, &[files.cmd_path.as_os_str()], dir, &self.env.vars())
            .map_err(|source| SubmitError::Launch { program: program.clone(), source })?;

        if !result.success {
            return Err(SubmitError::ExitStatus {
                program,
                code: result.code,
                output: String::from_utf8_lossy(&result.output).into_owned(),
            });
        }

        match extract_job_id(&result.output) {
            Some(id) => {
                info!("HTCondor job id for {}: {}", submission.uuid, id);
                Ok(id)
            }
            None => {
                warn!(
                    "{} succeeded for {} but no cluster id found in output: {}",
                    self.binary,
                    submission.uuid,
                    String::from_utf8_lossy(&result.output)
                );
                Ok(String::new())
            }
        }
    }
}

/// Pull the cluster id out of `condor_submit` output
///
/// Only the first "submitted to cluster N." line counts.
pub fn extract_job_id(output: &[u8]) -> Option<String> {
    static EXTRACTOR: OnceLock<Regex> = OnceLock::new();
    let extractor = EXTRACTOR.get_or_init(|| {
        Regex::new(r"submitted to cluster \(((\d+\.?)+)\)").expect("Valid job id pattern")
    });

    extractor
        .captures(output)
        .and_then(|captures| captures.get(1))
        .map(|id| String::from_utf8_lossy(id.as_bytes()).into_owned())
}
