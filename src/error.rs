use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Everything that can go wrong between a loaded submission and a job id
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The descriptor references the first step directly, so at least one is required
    #[error("submission {uuid} has no steps")]
    MissingStep { uuid: Uuid },

    /// A request value that can't be placed in a job file or path as given
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("can't render {template} template: {source}")]
    Render {
        template: &'static str,
        #[source]
        source: tinytemplate::error::Error,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{binary} not found on search path {search_path}: {source}")]
    BinaryNotFound {
        binary: String,
        search_path: String,
        #[source]
        source: which::Error,
    },

    #[error("can't resolve absolute path of {}: {source}", .path.display())]
    PathResolution {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("can't launch {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `code` is `None` when the process was killed by a signal
    #[error("{} exited with code {code:?}: {output}", .program.display())]
    ExitStatus {
        program: PathBuf,
        code: Option<i32>,
        output: String,
    },
}

impl SubmitError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> SubmitError {
        let path = path.into();
        move |source| SubmitError::Io { path, source }
    }
}
