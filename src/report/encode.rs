use std::io;
use std::path::Path;

use crate::report::types::Report;

/// Encode a report as pretty-printed JSON.
pub fn emit_json(report: &Report) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|e| format!("{{ \"error\": \"{}\" }}", e))
}

/// Encode a report as YAML.
pub fn emit_yaml(report: &Report) -> String {
    serde_yaml::to_string(report).unwrap_or_else(|e| format!("# Error serializing report: {e}"))
}

/// Decode a report from JSON.
///
/// # Errors
///
/// Returns the underlying deserialization error for malformed input.
/// Unknown enum strings inside a well-formed document do not error;
/// they decode to their `Invalid` variants.
pub fn parse_json(input: &str) -> Result<Report, serde_json::Error> {
    serde_json::from_str(input)
}

/// Decode a report from YAML.
///
/// # Errors
///
/// Returns the underlying deserialization error for malformed input.
pub fn parse_yaml(input: &str) -> Result<Report, serde_yaml::Error> {
    serde_yaml::from_str(input)
}

/// Write a report to a JSON file.
///
/// # Errors
///
/// Returns an [`io::Error`] if serialization or the write fails.
pub fn write_json_file(report: &Report, path: &Path) -> io::Result<()> {
    let json = serde_json::to_string_pretty(report).map_err(io::Error::other)?;
    std::fs::write(path, json)
}

/// Read a report back from a JSON file.
///
/// # Errors
///
/// Returns an [`io::Error`] if the read or deserialization fails.
pub fn read_json_file(path: &Path) -> io::Result<Report> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
}
