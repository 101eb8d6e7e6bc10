//! Render HTCondor job files, stage them on disk, and submit them

/// Render the submit description and job script with TinyTemplate
pub mod render;

/// Write rendered files into a per-submission working directory
pub mod write;

/// Run condor_submit and extract the cluster id from its output
pub mod submit;
