use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::condor::render::{render_script, render_submit};
use crate::error::SubmitError;
use crate::request::submission::Submission;

/// Submit description file name, HTCondor is run against this
pub static SUBMIT_FILE: &str = "iplant.cmd";
/// Job script file name, referenced by the submit description
pub static SCRIPT_FILE: &str = "iplant.sh";

/// Paths of the files staged for one submission
///
/// Both files live in the same per-submission working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionFiles {
    pub cmd_path: PathBuf,
    pub sh_path: PathBuf,
}

impl SubmissionFiles {
    pub fn working_directory(&self) -> &Path {
        self.cmd_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Create the working directory for a submission under `root`
///
/// Succeeds if the directory already exists: files from an earlier attempt are overwritten later.
pub fn create_submission_directory(root: &Path, submission: &Submission) -> Result<PathBuf, SubmitError> {
    if !submission.username_is_path_safe() {
        return Err(SubmitError::InvalidValue {
            field: "username",
            value: submission.username.clone(),
            reason: "must be a single directory name under the log root",
        });
    }
    let dir = submission.working_directory(root);
    if dir.exists() {
        warn!("Job directory {} already exists, files will be overwritten", dir.display());
    } else {
        info!("Creating job {} in working directory {}", submission.uuid, dir.display());
    }
    fs::create_dir_all(&dir).map_err(SubmitError::io(&dir))?;
    Ok(dir)
}

/// Render both templates and write them to `dir`
///
/// Rendering happens before anything touches the disk. A failed second write leaves the first file
/// in place.
pub fn create_submission_files(dir: &Path, submission: &Submission) -> Result<SubmissionFiles, SubmitError> {
    let cmd_contents = render_submit(submission)?;
    let sh_contents = render_script(submission)?;

    let cmd_path = dir.join(SUBMIT_FILE);
    let sh_path = dir.join(SCRIPT_FILE);

    info!("Writing submit description to {}", cmd_path.display());
    fs::write(&cmd_path, cmd_contents).map_err(SubmitError::io(&cmd_path))?;
    info!("Writing job script to {}", sh_path.display());
    fs::write(&sh_path, sh_contents).map_err(SubmitError::io(&sh_path))?;
    make_executable(&sh_path)?;

    Ok(SubmissionFiles { cmd_path, sh_path })
}

/// Directory creation and file writing in one go
pub fn stage(root: &Path, submission: &Submission) -> Result<SubmissionFiles, SubmitError> {
    let dir = create_submission_directory(root, submission)?;
    create_submission_files(&dir, submission)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), SubmitError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(SubmitError::io(path))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), SubmitError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::request::submission::fixture::submission;

    use super::*;

    #[test]
    fn stages_both_files() {
        let root = TempDir::new().unwrap();
        let s = submission();
        let files = stage(root.path(), &s).unwrap();

        let dir = root.path().join("ipctest").join(s.uuid.to_string());
        assert_eq!(files.cmd_path, dir.join("iplant.cmd"));
        assert_eq!(files.sh_path, dir.join("iplant.sh"));
        assert_eq!(files.working_directory(), dir.as_path());
        assert_eq!(fs::read_to_string(&files.cmd_path).unwrap(), render_submit(&s).unwrap());
        assert_eq!(fs::read_to_string(&files.sh_path).unwrap(), render_script(&s).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn script_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let files = stage(root.path(), &submission()).unwrap();
        let mode = fs::metadata(&files.sh_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn directory_creation_is_idempotent() {
        let root = TempDir::new().unwrap();
        let s = submission();
        let first = create_submission_directory(root.path(), &s).unwrap();
        let second = create_submission_directory(root.path(), &s).unwrap();
        assert_eq!(first, second);
        assert!(second.is_dir());

        // a retry overwrites whatever the last attempt left behind
        fs::write(first.join("iplant.cmd"), "partial").unwrap();
        let files = stage(root.path(), &s).unwrap();
        assert_ne!(fs::read_to_string(files.cmd_path).unwrap(), "partial");
    }

    #[test]
    fn distinct_uuids_get_distinct_directories() {
        let root = TempDir::new().unwrap();
        let a = submission();
        let mut b = a.clone();
        b.uuid = Uuid::new_v4();

        let a_files = stage(root.path(), &a).unwrap();
        let b_files = stage(root.path(), &b).unwrap();
        assert_ne!(a_files.working_directory(), b_files.working_directory());
    }

    #[test]
    fn directory_failure_is_propagated() {
        let root = TempDir::new().unwrap();
        // a regular file where the user directory should be
        fs::write(root.path().join("ipctest"), "").unwrap();
        let err = create_submission_directory(root.path(), &submission()).unwrap_err();
        assert!(matches!(err, SubmitError::Io { .. }), "{err}");
    }

    #[test]
    fn username_stays_under_root() {
        let root = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();

        for username in [elsewhere.path().to_str().unwrap(), "..", ".", "../ipctest", "ipc/test", "", "ipctest/"] {
            let mut s = submission();
            s.username = username.to_string();
            let err = create_submission_directory(root.path(), &s).unwrap_err();
            assert!(matches!(err, SubmitError::InvalidValue { field: "username", .. }), "{username}: {err}");
        }
        assert_eq!(fs::read_dir(elsewhere.path()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn write_failure_is_propagated() {
        let root = TempDir::new().unwrap();
        let s = submission();
        let dir = create_submission_directory(root.path(), &s).unwrap();
        // a directory in the way of the script
        fs::create_dir(dir.join("iplant.sh")).unwrap();

        let err = create_submission_files(&dir, &s).unwrap_err();
        assert!(matches!(&err, SubmitError::Io { path, .. } if path.ends_with("iplant.sh")), "{err}");
        // not rolled back
        assert!(dir.join("iplant.cmd").is_file());
    }

    #[test]
    fn nothing_is_written_without_steps() {
        let root = TempDir::new().unwrap();
        let mut s = submission();
        s.steps.clear();
        let dir = create_submission_directory(root.path(), &s).unwrap();
        assert!(matches!(create_submission_files(&dir, &s), Err(SubmitError::MissingStep { .. })));
        assert!(!dir.join("iplant.cmd").exists());
    }
}
