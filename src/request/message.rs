use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use log::{info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::request::submission::Submission;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("can't read job request at {}: {source}", .path.display())]
    MessageReadError { path: PathBuf, source: std::io::Error },
    #[error("job request isn't valid JSON: {0}")]
    JSONDecodeError(serde_json::Error),
    #[error("job request fails validation: {}", .0.join("; "))]
    JSONValidationError(Vec<String>),
    #[error("can't deserialise job request: {0}")]
    DeserialisationError(serde_json::Error),
    #[error("bundled submission schema is invalid: {0}")]
    SchemaError(String),
}

/// A job request on disk
pub struct Message<'a> {
    pub path: PathBuf,
    pub compiled_schema: &'a JSONSchema,
}

/// Compile the submission schema that ships with the binary
pub fn load_schema() -> Result<JSONSchema, RequestError> {
    /// included submission schema
    static SCHEMA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/schema/submission.json"));
    let schema: Value = serde_json::from_str(SCHEMA).map_err(|err| RequestError::SchemaError(err.to_string()))?;
    JSONSchema::compile(&schema).map_err(|err| RequestError::SchemaError(err.to_string()))
}

impl<'a> Message<'a> {
    pub fn new(path: &Path, compiled_schema: &'a JSONSchema) -> Message<'a> {
        Message { path: path.to_path_buf(), compiled_schema }
    }

    pub fn read(&self) -> Result<Submission, RequestError> {
        let json: Value = self.parse_untyped_json()?;

        match self.validate(&json) {
            Ok(_) => {
                info!("Message is valid");
                self.parse_json(json)
            }
            Err(err) => {
                warn!("Message fails validation");
                Err(err)
            }
        }
    }

    fn validate(&self, json: &Value) -> Result<(), RequestError> {
        info!("Validating raw message against JSON schema");
        self.compiled_schema.validate(json).map_err(|errors| {
            let errors: Vec<String> = errors.map(|err| format!("{} at {}", err, err.instance_path)).collect();
            RequestError::JSONValidationError(errors)
        })
    }

    fn read_file(&self) -> Result<String, RequestError> {
        let path: &Path = self.path.as_path();
        info!("Reading message at {}", path.display());
        fs::read_to_string(path).map_err(|source| {
            warn!("Can't read message job request at path {}: {}", path.display(), source);
            RequestError::MessageReadError { path: path.to_path_buf(), source }
        })
    }

    fn parse_json(&self, value: Value) -> Result<Submission, RequestError> {
        info!("Deserialising valid JSON into typed Rust object");
        serde_json::from_value::<Submission>(value).map_err(RequestError::DeserialisationError)
    }

    fn parse_untyped_json(&self) -> Result<Value, RequestError> {
        info!("Parsing JSON into untyped structure");
        let json_string = self.read_file()?;
        serde_json::from_str::<Value>(&json_string).map_err(RequestError::JSONDecodeError)
    }
}
