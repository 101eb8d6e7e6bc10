use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::Deserialize;

/// Static values read from a JSON file at startup
///
/// Only the settings needed to stage and submit a job live here. Messaging and event logging are
/// configured elsewhere.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Search path for `condor_submit`, also exported as `PATH` to the submit process
    pub path: String,
    /// Exported as `CONDOR_CONFIG` to the submit process
    pub condor_config: String,
    /// Per-submission working directories are created under this root
    pub condor_log_path: PathBuf,
    /// Tag of the data transfer image (discoenv/porklock)
    pub porklock_tag: String,
    /// Used when a submission doesn't request disk itself
    #[serde(default)]
    pub request_disk: String,
}

/// The only environment the submit process gets to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerEnv {
    pub path: String,
    pub condor_config: String,
}

impl SchedulerEnv {
    pub fn vars(&self) -> [(&'static str, &str); 2] {
        [("PATH", self.path.as_str()), ("CONDOR_CONFIG", self.condor_config.as_str())]
    }
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Configuration> {
        info!("Reading configuration from {}", path.display());
        if path.is_dir() {
            bail!("{} is a directory", path.display());
        }
        let json = fs::read_to_string(path)
            .with_context(|| format!("Can't read configuration at {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Invalid configuration JSON in {}", path.display()))
    }

    /// Check required settings, logging each one that's missing
    pub fn valid(&self) -> bool {
        let required = [
            ("path", self.path.is_empty()),
            ("condor_config", self.condor_config.is_empty()),
            ("condor_log_path", self.condor_log_path.as_os_str().is_empty()),
            ("porklock_tag", self.porklock_tag.is_empty()),
        ];

        let mut valid = true;
        for (name, missing) in required {
            if missing {
                warn!("{name} must be set in the configuration file.");
                valid = false;
            }
        }
        valid
    }

    pub fn scheduler_env(&self) -> SchedulerEnv {
        SchedulerEnv { path: self.path.clone(), condor_config: self.condor_config.clone() }
    }

    pub fn transfer_image(&self) -> String {
        format!("discoenv/porklock:{}", self.porklock_tag)
    }
}
