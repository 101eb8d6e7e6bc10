//! Job requests: reading, validating, and deserialising submissions

/// Typed job model built from a validated request
pub mod submission;

/// Read a request file, validate it against the bundled JSON schema, and deserialise it
pub mod message;

/// Find request files on disk
pub mod read;
