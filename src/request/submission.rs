use std::collections::BTreeMap;
use std::path::{self, Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Configuration;

/// Working directory inside every job container, bind mounted from the condor scratch directory
static WORK_DIR: &str = "/de-app-work";

/// One analysis to run on the cluster
///
/// Built once from a job request and only read after that: rendering and submission borrow it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Submission {
    /// Correlation token for artifacts and container names
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub request_disk: String,
    #[serde(default)]
    pub output_dir: String,
    /// Image used to stage inputs and collect outputs
    #[serde(default)]
    pub transfer_image: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub data_containers: Vec<DataContainer>,
    #[serde(default)]
    pub container_images: Vec<ContainerImage>,
    #[serde(default)]
    pub file_metadata: Vec<FileMetadata>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Step {
    pub component: Component,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Component {
    pub name: String,
    pub location: String,
    pub container: Container,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Container {
    pub image: ContainerImage,
    /// Name prefixes of the data containers this step mounts
    #[serde(default)]
    pub volumes_from: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub cpu_shares: Option<u64>,
    #[serde(default)]
    pub network_mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StepConfig {
    #[serde(default)]
    pub params: Vec<StepParam>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepParam {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ContainerImage {
    pub name: String,
    pub tag: String,
}

/// A volume container created before the steps run and removed afterwards
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataContainer {
    pub name: String,
    pub tag: String,
    pub name_prefix: String,
    #[serde(default)]
    pub host_path: Option<String>,
    #[serde(default)]
    pub container_path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// A file or folder staged into the working directory before any step runs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Input {
    #[serde(default)]
    pub name: String,
    /// Source path in the data store
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileMetadata {
    pub attribute: String,
    pub value: String,
    #[serde(default)]
    pub unit: String,
}

impl Submission {
    /// Fill in settings the request may leave to the deployment
    pub fn with_defaults(self, config: &Configuration) -> Submission {
        let request_disk = match self.request_disk.is_empty() {
            true => config.request_disk.clone(),
            false => self.request_disk,
        };
        let transfer_image = match self.transfer_image.is_empty() {
            true => config.transfer_image(),
            false => self.transfer_image,
        };
        Submission { request_disk, transfer_image, ..self }
    }

    /// Unique per submission: `<root>/<username>/<uuid>`
    ///
    /// Callers staging files must check the username with [`Submission::username_is_path_safe`].
    pub fn working_directory(&self, root: &Path) -> PathBuf {
        root.join(&self.username).join(self.uuid.to_string())
    }

    /// The username is a single plain directory name: not absolute, no separators, not `.` or `..`
    pub fn username_is_path_safe(&self) -> bool {
        let mut components = Path::new(&self.username).components();
        matches!(
            (components.next(), components.next()),
            (Some(path::Component::Normal(name)), None) if name.to_str() == Some(self.username.as_str())
        )
    }

    /// Collects everything left in the working directory and uploads it to `output_dir`
    pub fn final_output_arguments(&self) -> String {
        let mut args = transfer_arguments(&self.transfer_image, "put");
        args.extend([
            "--user".to_string(),
            shell_quote(&self.username),
            "--config".to_string(),
            "irods-config".to_string(),
            "--destination".to_string(),
            shell_quote(&self.output_dir),
        ]);
        args.extend(metadata_arguments(&self.file_metadata));
        args.join(" ")
    }

    pub fn final_output_stdout(&self) -> &'static str {
        "logs/output-last-stdout"
    }

    pub fn final_output_stderr(&self) -> &'static str {
        "logs/output-last-stderr"
    }
}

impl Step {
    /// Location and name joined with a single `/`, an absolute name stays under the location
    pub fn executable(&self) -> String {
        if self.component.location.is_empty() {
            return self.component.name.clone();
        }
        let location = self.component.location.trim_end_matches('/');
        let name = self.component.name.trim_start_matches('/');
        format!("{location}/{name}")
    }

    /// Arguments to `docker` that run this step
    pub fn arguments(&self, uuid: &Uuid) -> String {
        let container = &self.component.container;
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-e".into(),
            "IPLANT_USER".into(),
            "-e".into(),
            "IPLANT_EXECUTION_ID".into(),
        ];

        // BTreeMap keeps the environment in a stable order
        for (key, value) in &self.environment {
            args.push("-e".into());
            args.push(shell_quote(&format!("{key}={value}")));
        }

        args.push("-v".into());
        args.push(format!("$(pwd):{WORK_DIR}"));
        args.push("-w".into());
        args.push(shell_quote(container.working_dir.as_deref().unwrap_or(WORK_DIR)));

        for prefix in &container.volumes_from {
            args.push("--volumes-from".into());
            args.push(shell_quote(&format!("{prefix}-{uuid}")));
        }
        if let Some(memory) = container.memory_limit {
            args.push("-m".into());
            args.push(memory.to_string());
        }
        if let Some(shares) = container.cpu_shares {
            args.push("--cpu-shares".into());
            args.push(shares.to_string());
        }
        if let Some(network) = &container.network_mode {
            args.push("--net".into());
            args.push(shell_quote(network));
        }
        if let Some(entrypoint) = &container.entrypoint {
            args.push("--entrypoint".into());
            args.push(shell_quote(entrypoint));
        }

        args.push("--label".into());
        args.push(format!("org.iplantc.analysis.id={uuid}"));
        args.push(shell_quote(&container.image.reference()));
        args.push(shell_quote(&self.executable()));

        let mut params: Vec<&StepParam> = self.config.params.iter().collect();
        // stable sort, params sharing an order keep request order
        params.sort_by_key(|p| p.order);
        for param in params {
            if !param.name.is_empty() {
                args.push(shell_quote(&param.name));
            }
            if !param.value.is_empty() {
                args.push(shell_quote(&param.value));
            }
        }

        args.join(" ")
    }

    pub fn stdout(&self, index: usize) -> String {
        format!("logs/step-stdout-{index}")
    }

    pub fn stderr(&self, index: usize) -> String {
        format!("logs/step-stderr-{index}")
    }
}

impl Input {
    /// Arguments to `docker` that download this input into the working directory
    pub fn arguments(&self, username: &str, metadata: &[FileMetadata], transfer_image: &str) -> String {
        let mut args = transfer_arguments(transfer_image, "get");
        args.extend([
            "--user".to_string(),
            shell_quote(username),
            "--source".to_string(),
            shell_quote(&self.value),
            "--config".to_string(),
            "irods-config".to_string(),
        ]);
        args.extend(metadata_arguments(metadata));
        args.join(" ")
    }

    pub fn stdout(&self, index: usize) -> String {
        format!("logs/input-stdout-{index}")
    }

    pub fn stderr(&self, index: usize) -> String {
        format!("logs/input-stderr-{index}")
    }
}

impl ContainerImage {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

impl DataContainer {
    pub fn image(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    pub fn instance_name(&self, uuid: &Uuid) -> String {
        format!("{}-{}", self.name_prefix, uuid)
    }

    /// `-v [host:]container[:ro]` with the mount quoted as one word, or nothing when neither path is set
    pub fn volume(&self) -> Option<String> {
        let host = self.host_path.as_deref().unwrap_or_default();
        let container = self.container_path.as_deref().unwrap_or_default();
        if host.is_empty() && container.is_empty() {
            return None;
        }

        let mut mount = String::new();
        if !host.is_empty() {
            mount.push_str(host);
            mount.push(':');
        }
        mount.push_str(container);
        if self.read_only {
            mount.push_str(":ro");
        }
        Some(format!("-v {}", shell_quote(&mount)))
    }
}

fn transfer_arguments(image: &str, action: &str) -> Vec<String> {
    vec![
        "run".into(),
        "--rm".into(),
        "-v".into(),
        format!("$(pwd):{WORK_DIR}"),
        "-w".into(),
        WORK_DIR.into(),
        shell_quote(image),
        action.into(),
    ]
}

fn metadata_arguments(metadata: &[FileMetadata]) -> Vec<String> {
    metadata
        .iter()
        .flat_map(|m| ["-m".to_string(), shell_quote(&format!("{},{},{}", m.attribute, m.value, m.unit))])
        .collect()
}

/// POSIX single quoting, left bare when nothing needs quoting
pub fn shell_quote(value: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c);
    if !value.is_empty() && value.chars().all(safe) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}


#[cfg(test)]
mod tests {
    use std::path::Path;

    use uuid::Uuid;

    use super::fixture::submission;
    use super::*;

    #[test]
    fn step_arguments() {
        let s = submission();
        let args = s.steps[0].arguments(&s.uuid);
        assert_eq!(
            args,
            format!(
                "run --rm -e IPLANT_USER -e IPLANT_EXECUTION_ID -e LANG=C -v $(pwd):/de-app-work -w /de-app-work \
                 --volumes-from ref-genome-{uuid} -m 2000000000 --label org.iplantc.analysis.id={uuid} \
                 discoenv/wc:1.0 /usr/bin/wc -l 'my input.txt'",
                uuid = s.uuid
            )
        );
    }

    #[test]
    fn step_params_follow_order() {
        let s = submission();
        let args = s.steps[1].arguments(&s.uuid);
        assert!(args.ends_with("discoenv/gzip:1.6 /bin/gzip -9 -c out.txt"), "{args}");
        assert!(args.contains("--entrypoint /bin/sh"));
        assert!(args.contains("--net none"));
    }

    #[test]
    fn input_arguments() {
        let s = submission();
        let args = s.inputs[0].arguments(&s.username, &s.file_metadata, &s.transfer_image);
        assert_eq!(
            args,
            "run --rm -v $(pwd):/de-app-work -w /de-app-work discoenv/porklock:latest get --user ipctest \
             --source '/iplant/home/ipctest/my input.txt' --config irods-config \
             -m ipc-analysis-id,a1b2c3,UUID"
        );
    }

    #[test]
    fn final_output_arguments() {
        let s = submission();
        assert_eq!(
            s.final_output_arguments(),
            "run --rm -v $(pwd):/de-app-work -w /de-app-work discoenv/porklock:latest put --user ipctest \
             --config irods-config --destination /iplant/home/ipctest/analyses/wc-1 \
             -m ipc-analysis-id,a1b2c3,UUID"
        );
    }

    #[test]
    fn log_names_depend_only_on_index() {
        let s = submission();
        let mut step = s.steps[0].clone();
        step.component = s.steps[1].component.clone();
        assert_eq!(s.steps[0].stdout(3), step.stdout(3));
        assert_ne!(s.steps[0].stdout(0), s.steps[0].stdout(1));
        assert_eq!(s.steps[1].stderr(1), "logs/step-stderr-1");
        assert_eq!(s.inputs[0].stdout(0), "logs/input-stdout-0");
        assert_eq!(s.inputs[0].stderr(2), "logs/input-stderr-2");
    }

    #[test]
    fn data_container_volumes() {
        let s = submission();
        let uuid = s.uuid;
        let dc = &s.data_containers[0];
        assert_eq!(dc.instance_name(&uuid), format!("ref-genome-{uuid}"));
        assert_eq!(dc.volume().as_deref(), Some("-v /data/ref:/ref:ro"));

        let mut bare = dc.clone();
        bare.host_path = None;
        bare.read_only = false;
        assert_eq!(bare.volume().as_deref(), Some("-v /ref"));

        bare.container_path = Some(String::new());
        assert_eq!(bare.volume(), None);
    }

    #[test]
    fn working_directories_differ_by_uuid() {
        let a = submission();
        let mut b = a.clone();
        b.uuid = Uuid::new_v4();
        let root = Path::new("/condor/logs");
        assert_eq!(a.working_directory(root), root.join("ipctest").join(a.uuid.to_string()));
        assert_ne!(a.working_directory(root), b.working_directory(root));
    }

    #[test]
    fn defaults_only_fill_gaps() {
        let config: Configuration =
            serde_json::from_str(include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/test/config.json")))
                .unwrap();

        let mut s = submission();
        s.request_disk.clear();
        s.transfer_image.clear();
        let s = s.with_defaults(&config);
        assert_eq!(s.request_disk, "0");
        assert_eq!(s.transfer_image, "discoenv/porklock:latest");

        let s = submission().with_defaults(&config);
        assert_eq!(s.request_disk, "4000000");
    }

    #[test]
    fn executable_keeps_location() {
        let mut step = submission().steps[0].clone();
        step.component.name = "/wc".into();
        assert_eq!(step.executable(), "/usr/bin/wc");

        step.component.location = "/usr/bin/".into();
        assert_eq!(step.executable(), "/usr/bin/wc");

        step.component.location = "/".into();
        assert_eq!(step.executable(), "/wc");

        step.component.location = String::new();
        step.component.name = "wc".into();
        assert_eq!(step.executable(), "wc");
    }

    #[test]
    fn path_safe_usernames() {
        let mut s = submission();
        assert!(s.username_is_path_safe());
        for username in ["/tmp/elsewhere", "..", ".", "../x", "a/b", "", "ipctest/"] {
            s.username = username.into();
            assert!(!s.username_is_path_safe(), "{username}");
        }
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("plain-value_1.txt"), "plain-value_1.txt");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }
}
