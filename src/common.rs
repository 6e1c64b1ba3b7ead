use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Could not find file {0:?} on disk")]
    InputNotFound(PathBuf),

    #[error("Could not load file {path:?} as a PE: {reason}")]
    NotAValidImage { path: PathBuf, reason: String },

    #[error("Malformed manifest: {0}")]
    ManifestParseError(String),

    #[error("API set schema error: {0}")]
    ApisetError(String),

    #[error("Lookup context building error: {0}")]
    ContextDeductionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("{0}")]
    UnsupportedOutput(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    PEError(#[from] pelite::Error),
    #[error(transparent)]
    XmlError(#[from] roxmltree::Error),
    #[error(transparent)]
    RegexError(#[from] regex::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

/// Lowercase key used wherever Windows compares module names
pub fn module_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref()
        .to_str()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{:?}", p.as_ref()))
}

/// Remove the `\\?\` prefix that `canonicalize` adds on Windows
pub fn decanonicalize(s: &str) -> String {
    s.strip_prefix(r"\\?\").unwrap_or(s).to_owned()
}

/// Human readable rendering of an optional resolved path (empty when absent)
pub fn display_path(p: Option<&Path>) -> String {
    p.map(|p| decanonicalize(&path_to_string(p)))
        .unwrap_or_default()
}
