use std::sync::OnceLock;

use log::debug;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tinytemplate::TinyTemplate;

use crate::error::SubmitError;
use crate::request::submission::{shell_quote, Step, Submission};

/// included HTCondor submit description template
static SUBMIT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/templates/iplant.cmd.txt"));
/// included job script template
static SCRIPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/templates/iplant.sh.txt"));

/// Rendering context for the submit description (iplant.cmd)
#[derive(Serialize)]
struct SubmitContext<'a> {
    request_disk: &'a str,
    uuid: String,
    username: &'a str,
    group: Option<&'a str>,
    exe: &'a str,
    exe_path: &'a str,
}

/// Rendering context for the job script (iplant.sh)
///
/// TinyTemplate can't call methods, so every docker argument list and log file name is worked out
/// up front.
#[derive(Serialize)]
struct ScriptContext<'a> {
    username: &'a str,
    uuid: String,
    /// Data container images first, then the other container images
    pulls: Vec<String>,
    data_containers: Vec<DataContainerContext>,
    inputs: Vec<InvocationContext>,
    steps: Vec<InvocationContext>,
    output: InvocationContext,
}

#[derive(Serialize)]
struct DataContainerContext {
    image: String,
    instance: String,
    /// `-v ...` followed by a space, or empty
    volume: String,
}

/// One `docker` command and where its output goes
#[derive(Serialize)]
struct InvocationContext {
    arguments: String,
    stdout: String,
    stderr: String,
}

/// Render the HTCondor submit description
///
/// The executable attributes always describe the first step, so a submission without steps is
/// rejected here rather than rendered with blanks.
pub fn render_submit(submission: &Submission) -> Result<String, SubmitError> {
    let first: &Step = submission
        .steps
        .first()
        .ok_or(SubmitError::MissingStep { uuid: submission.uuid })?;

    if !valid_disk_request(&submission.request_disk) {
        return Err(SubmitError::InvalidValue {
            field: "request_disk",
            value: submission.request_disk.clone(),
            reason: "expected a number of KiB with an optional K, M, G or T unit",
        });
    }

    let context = SubmitContext {
        request_disk: &submission.request_disk,
        uuid: submission.uuid.to_string(),
        username: &submission.username,
        group: submission.group.as_deref().filter(|group| !group.is_empty()),
        exe: &first.component.name,
        exe_path: &first.component.location,
    };

    debug!("Rendering submit description for {}", submission.uuid);
    render("iplant.cmd", SUBMIT, &context)
}

/// Render the bash script HTCondor runs on the execute node
pub fn render_script(submission: &Submission) -> Result<String, SubmitError> {
    if submission.steps.is_empty() {
        return Err(SubmitError::MissingStep { uuid: submission.uuid });
    }
    let uuid = &submission.uuid;

    let pulls = submission
        .data_containers
        .iter()
        .map(|dc| dc.image())
        .chain(submission.container_images.iter().map(|image| image.reference()))
        .collect();

    let data_containers = submission
        .data_containers
        .iter()
        .map(|dc| DataContainerContext {
            image: dc.image(),
            instance: dc.instance_name(uuid),
            volume: dc.volume().map(|v| format!("{v} ")).unwrap_or_default(),
        })
        .collect();

    let inputs = submission
        .inputs
        .iter()
        .enumerate()
        .map(|(i, input)| InvocationContext {
            arguments: input.arguments(&submission.username, &submission.file_metadata, &submission.transfer_image),
            stdout: input.stdout(i),
            stderr: input.stderr(i),
        })
        .collect();

    let steps = submission
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| InvocationContext {
            arguments: step.arguments(uuid),
            stdout: step.stdout(i),
            stderr: step.stderr(i),
        })
        .collect();

    let output = InvocationContext {
        arguments: submission.final_output_arguments(),
        stdout: submission.final_output_stdout().to_string(),
        stderr: submission.final_output_stderr().to_string(),
    };

    let context = ScriptContext {
        username: &submission.username,
        uuid: uuid.to_string(),
        pulls,
        data_containers,
        inputs,
        steps,
        output,
    };

    debug!("Rendering job script for {}", submission.uuid);
    render("iplant.sh", SCRIPT, &context)
}

/// `request_disk` is written to the descriptor unquoted
fn valid_disk_request(value: &str) -> bool {
    static DISK: OnceLock<Regex> = OnceLock::new();
    DISK.get_or_init(|| Regex::new(r"^[0-9]+ ?([KMGTkmgt][Bb]?)?$").expect("Valid disk request pattern"))
        .is_match(value)
}

fn render<C: Serialize>(name: &'static str, template: &'static str, context: &C) -> Result<String, SubmitError> {
    let into_error = |source| SubmitError::Render { template: name, source };

    let mut tt = TinyTemplate::new();
    // nothing here is HTML
    tt.set_default_formatter(&tinytemplate::format_unescaped);
    tt.add_formatter("quoted", format_quoted);
    tt.add_formatter("shell", format_shell);
    tt.add_template(name, template).map_err(into_error)?;
    tt.render(name, context).map_err(into_error)
}

/// ClassAd string literal contents: backslash escape `"` and `\`
///
/// Control characters would end the line and start a new submit command, so they are refused.
fn format_quoted(value: &Value, output: &mut String) -> tinytemplate::error::Result<()> {
    match value {
        Value::String(s) if s.chars().any(char::is_control) => Err(tinytemplate::error::Error::GenericError {
            msg: format!("control character in descriptor value {s:?}"),
        }),
        Value::String(s) => {
            output.push_str(&s.replace('\\', r"\\").replace('"', "\\\""));
            Ok(())
        }
        _ => tinytemplate::format_unescaped(value, output),
    }
}

fn format_shell(value: &Value, output: &mut String) -> tinytemplate::error::Result<()> {
    match value {
        Value::String(s) => {
            output.push_str(&shell_quote(s));
            Ok(())
        }
        _ => tinytemplate::format_unescaped(value, output),
    }
}
