//! Untrusted-input validation.
//!
//! Three strings arrive from the outside world — a spec location, an
//! optional commit id, and an output path — and everything downstream
//! (tool handlers, the file store, process working directories) trusts
//! them. [`validate_and_create`] is the only path by which those strings
//! become a [`ValidationContext`]; [`ValidationContext::from_validated`]
//! exists solely to pass already-proven values between internal stages
//! and must never be reachable from an untrusted entry point.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// File extensions that mark a directory as a spec tree.
const SPEC_EXTENSIONS: &[&str] = &["tsp", "yaml"];

/// Commit id bounds: short hash through full SHA-1/SHA-256 prefix.
const COMMIT_ID_MIN_LEN: usize = 6;
const COMMIT_ID_MAX_LEN: usize = 40;

/// Absolute directories an output path may never resolve into.
#[cfg(unix)]
const DISALLOWED_OUTPUT_ROOTS: &[&str] = &[
    "/bin", "/boot", "/dev", "/etc", "/lib", "/proc", "/sbin", "/sys", "/usr",
];

#[cfg(windows)]
const DISALLOWED_OUTPUT_ROOTS: &[&str] = &["C:\\Windows", "C:\\Program Files"];

/// Where the spec files live for this session.
///
/// The two variants carry the invariant the validator enforces: a local
/// directory never has a commit id, and a repository fragment always
/// does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecSource {
    /// An absolute local directory known to exist and to contain at
    /// least one spec file.
    Local { dir: PathBuf },
    /// A repository-relative path fragment pinned to a commit.
    Repository { fragment: String, commit_id: String },
}

/// Immutable, trusted bundle of validated inputs.
///
/// Constructed once per session and shared read-only across concurrent
/// tool dispatches. All fields are private; there is no mutation API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    spec_source: SpecSource,
    output_dir: PathBuf,
}

impl ValidationContext {
    /// Trusted constructor for values already proven valid upstream.
    ///
    /// No re-validation is performed. This exists only for internal
    /// stages handing validated values to each other; external entry
    /// points must go through [`validate_and_create`].
    pub fn from_validated(spec_source: SpecSource, output_dir: PathBuf) -> Self {
        Self {
            spec_source,
            output_dir,
        }
    }

    pub fn spec_source(&self) -> &SpecSource {
        &self.spec_source
    }

    /// The local spec directory, when this session works against one.
    pub fn local_spec_dir(&self) -> Option<&Path> {
        match &self.spec_source {
            SpecSource::Local { dir } => Some(dir),
            SpecSource::Repository { .. } => None,
        }
    }

    /// The validated commit id, when this session is pinned to one.
    pub fn commit_id(&self) -> Option<&str> {
        match &self.spec_source {
            SpecSource::Local { .. } => None,
            SpecSource::Repository { commit_id, .. } => Some(commit_id),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// Turn three untrusted strings into a trusted [`ValidationContext`].
///
/// An empty `commit_id` means `spec_location` is a local directory; a
/// non-empty one means it is a repository-relative fragment. Failures
/// are attributed to the offending field (`spec_location`, `commit_id`,
/// or `output_path`).
pub fn validate_and_create(
    spec_location: &str,
    commit_id: &str,
    output_path: &str,
) -> Result<ValidationContext> {
    debug!(spec_location, commit_id, output_path, "validating inputs");

    let spec_source = if commit_id.trim().is_empty() {
        SpecSource::Local {
            dir: validate_local_spec_dir(spec_location)?,
        }
    } else {
        SpecSource::Repository {
            fragment: validate_repo_fragment(spec_location)?,
            commit_id: validate_commit_id(commit_id)?,
        }
    };

    let output_dir = validate_output_path(output_path)?;

    debug!(?spec_source, output_dir = %output_dir.display(), "validation context created");
    Ok(ValidationContext {
        spec_source,
        output_dir,
    })
}

fn validate_local_spec_dir(spec_location: &str) -> Result<PathBuf> {
    if spec_location.trim().is_empty() {
        warn!("spec location rejected: empty");
        return Err(Error::validation(
            "spec_location",
            "spec location cannot be empty",
        ));
    }
    if has_traversal_segments(spec_location) {
        warn!(spec_location, "spec location rejected: traversal segments");
        return Err(Error::validation(
            "spec_location",
            "path contains traversal segments",
        ));
    }

    let dir = Path::new(spec_location);
    let dir = dir.canonicalize().map_err(|_| {
        warn!(spec_location, "spec location rejected: not found");
        Error::validation(
            "spec_location",
            format!("spec directory not found: {spec_location}"),
        )
    })?;
    if !dir.is_dir() {
        return Err(Error::validation(
            "spec_location",
            format!("spec location is not a directory: {spec_location}"),
        ));
    }

    if !contains_spec_files(&dir) {
        warn!(dir = %dir.display(), "spec location rejected: no spec files");
        return Err(Error::validation(
            "spec_location",
            "no spec files found: directory contains no .tsp or .yaml files",
        ));
    }

    debug!(dir = %dir.display(), "local spec directory validated");
    Ok(dir)
}

/// Recursively checks for at least one file with a recognized spec
/// extension. Walk errors (unreadable subtrees) are skipped rather than
/// treated as matches.
fn contains_spec_files(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .any(|entry| entry.file_type().is_file() && is_spec_file(entry.path()))
}

/// True if `path` carries a recognized spec extension.
pub(crate) fn is_spec_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SPEC_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn validate_repo_fragment(fragment: &str) -> Result<String> {
    if fragment.trim().is_empty() {
        return Err(Error::validation(
            "spec_location",
            "spec location cannot be empty",
        ));
    }
    if fragment.starts_with('/') || fragment.contains('\\') {
        warn!(fragment, "repository fragment rejected: not repo-relative");
        return Err(Error::validation(
            "spec_location",
            "repository fragment must be a relative path with forward slashes",
        ));
    }
    if has_traversal_segments(fragment) {
        warn!(fragment, "repository fragment rejected: traversal segments");
        return Err(Error::validation(
            "spec_location",
            "path contains traversal segments",
        ));
    }
    if !fragment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
    {
        warn!(fragment, "repository fragment rejected: charset");
        return Err(Error::validation(
            "spec_location",
            "repository fragment contains characters outside [A-Za-z0-9._/-]",
        ));
    }

    debug!(fragment, "repository fragment validated");
    Ok(fragment.to_string())
}

fn validate_commit_id(commit_id: &str) -> Result<String> {
    let ok = (COMMIT_ID_MIN_LEN..=COMMIT_ID_MAX_LEN).contains(&commit_id.len())
        && commit_id.chars().all(|c| c.is_ascii_hexdigit());
    if !ok {
        warn!(commit_id, "commit id rejected");
        return Err(Error::validation(
            "commit_id",
            format!(
                "must be {COMMIT_ID_MIN_LEN}-{COMMIT_ID_MAX_LEN} hexadecimal characters, got '{commit_id}'"
            ),
        ));
    }
    Ok(commit_id.to_ascii_lowercase())
}

fn validate_output_path(output_path: &str) -> Result<PathBuf> {
    if output_path.trim().is_empty() {
        return Err(Error::validation(
            "output_path",
            "output directory path cannot be empty",
        ));
    }
    if has_traversal_segments(output_path) {
        warn!(output_path, "output path rejected: traversal segments");
        return Err(Error::validation(
            "output_path",
            "path contains traversal segments",
        ));
    }

    let path = Path::new(output_path);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::validation("output_path", format!("cannot resolve: {e}")))?
            .join(path)
    };

    if resolves_into_system_root(&absolute) {
        warn!(output_path, "output path rejected: system root");
        return Err(Error::validation(
            "output_path",
            format!("output path resolves into a disallowed system root: {output_path}"),
        ));
    }

    std::fs::create_dir_all(&absolute).map_err(|e| {
        Error::validation(
            "output_path",
            format!("cannot create output directory '{output_path}': {e}"),
        )
    })?;
    let absolute = absolute.canonicalize().map_err(|e| {
        Error::validation(
            "output_path",
            format!("cannot resolve output directory '{output_path}': {e}"),
        )
    })?;

    debug!(dir = %absolute.display(), "output directory validated");
    Ok(absolute)
}

fn resolves_into_system_root(path: &Path) -> bool {
    // The filesystem root itself is never an acceptable output target.
    if path.parent().is_none() {
        return true;
    }
    DISALLOWED_OUTPUT_ROOTS
        .iter()
        .any(|root| path.starts_with(root))
}

pub(crate) fn has_traversal_segments(raw: &str) -> bool {
    // Check raw separators first so `..\foo` is caught on every platform,
    // then the parsed components for the host platform.
    raw.split(['/', '\\']).any(|segment| segment == "..")
        || Path::new(raw)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}
