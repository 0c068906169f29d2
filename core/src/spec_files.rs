//! Confined access to the session's spec file tree.
//!
//! The agent names files as free-text strings; every name passes a
//! traversal check and a canonicalize-and-confine check against the
//! store's root before any read or write touches storage. The store also
//! owns the session temp directories used when spec files arrive from a
//! repository snapshot rather than local disk, and cleans them up
//! best-effort on drop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::validation::{ValidationContext, has_traversal_segments, is_spec_file};

/// Longest sanitized directory-name component kept for temp paths.
const MAX_SANITIZED_NAME_LEN: usize = 50;

static TEMP_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Read/write access to spec files beneath a single validated root.
#[derive(Debug)]
pub struct SpecFileStore {
    root: PathBuf,
    /// Session temp directory owned by this store, if the spec tree was
    /// materialized from fetched content. Removed on drop.
    temp_dir: Option<PathBuf>,
}

impl SpecFileStore {
    /// Store over the validated local spec directory.
    ///
    /// Fails with a state error when the context carries a repository
    /// fragment instead — those sessions must materialize fetched files
    /// first via [`SpecFileStore::from_fetched_files`].
    pub fn for_local(ctx: &ValidationContext) -> Result<Self> {
        let dir = ctx.local_spec_dir().ok_or_else(|| {
            Error::State(
                "No local spec directory available. Materialize fetched files first.".to_string(),
            )
        })?;
        Ok(Self {
            root: dir.to_path_buf(),
            temp_dir: None,
        })
    }

    /// Write fetched spec content into a fresh session temp directory
    /// under the validated output dir and return a store rooted there.
    ///
    /// File names with traversal segments are skipped with a warning
    /// rather than failing the whole batch, mirroring how a hostile
    /// single entry should not poison an otherwise good snapshot.
    pub fn from_fetched_files(
        ctx: &ValidationContext,
        files: &BTreeMap<String, String>,
    ) -> Result<Self> {
        if files.is_empty() {
            return Err(Error::State(
                "No spec files found in repository snapshot".to_string(),
            ));
        }

        let root = session_temp_path(ctx);
        std::fs::create_dir_all(&root).map_err(|source| Error::FileWrite {
            path: root.clone(),
            source,
        })?;
        let canonical_root = root.canonicalize().map_err(|source| Error::FileRead {
            path: root.clone(),
            source,
        })?;

        let mut written = 0usize;
        for (name, content) in files {
            if has_traversal_segments(name) || Path::new(name).is_absolute() {
                warn!(name, "skipping fetched file with unsafe name");
                continue;
            }
            let target = canonical_root.join(name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|source| Error::FileWrite {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::write(&target, content).map_err(|source| Error::FileWrite {
                path: target.clone(),
                source,
            })?;
            written += 1;
        }
        debug!(count = written, root = %canonical_root.display(), "materialized fetched spec files");

        Ok(Self {
            root: canonical_root.clone(),
            temp_dir: Some(canonical_root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths of every spec file beneath the root, sorted.
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file() && is_spec_file(entry.path()))
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Name → content map of every spec file beneath the root.
    pub async fn collect_files(&self) -> Result<BTreeMap<String, String>> {
        let mut files = BTreeMap::new();
        for name in self.list_files()? {
            let content = self.read_file(&name).await?;
            files.insert(name, content);
        }
        Ok(files)
    }

    /// Read one spec file named by a (possibly hostile) relative path.
    pub async fn read_file(&self, name: &str) -> Result<String> {
        let path = self.confine(name)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| Error::FileRead { path, source })
    }

    /// Overwrite one spec file with agent-proposed content, confined to
    /// the root. Used when applying a fix iteration.
    pub async fn update_file(&self, name: &str, content: &str) -> Result<()> {
        let path = self.confine(name)?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| Error::FileWrite { path: path.clone(), source })?;
        debug!(file = name, bytes = content.len(), "updated spec file");
        Ok(())
    }

    /// Resolve `name` beneath the root or fail.
    ///
    /// The traversal check catches `..` before the filesystem is
    /// consulted; the canonicalized prefix check catches everything else
    /// (absolute names, symlink escapes of existing files).
    fn confine(&self, name: &str) -> Result<PathBuf> {
        if name.trim().is_empty() {
            return Err(Error::validation("path", "file path cannot be empty"));
        }
        if has_traversal_segments(name) || Path::new(name).is_absolute() {
            warn!(name, "rejected file path outside the spec directory");
            return Err(Error::validation(
                "path",
                format!("file path escapes the spec directory: {name}"),
            ));
        }

        let candidate = self.root.join(name);
        // For existing files canonicalize the full path; for new files
        // canonicalize the nearest existing ancestor.
        let resolved = match candidate.canonicalize() {
            Ok(resolved) => resolved,
            Err(_) => {
                let parent = candidate
                    .parent()
                    .ok_or_else(|| Error::validation("path", "file path has no parent"))?;
                let file_name = candidate
                    .file_name()
                    .ok_or_else(|| Error::validation("path", "file path has no file name"))?;
                parent
                    .canonicalize()
                    .map_err(|source| Error::FileRead {
                        path: parent.to_path_buf(),
                        source,
                    })?
                    .join(file_name)
            }
        };

        if !resolved.starts_with(&self.root) {
            warn!(name, "rejected file path that resolves outside the spec directory");
            return Err(Error::validation(
                "path",
                format!("file path escapes the spec directory: {name}"),
            ));
        }
        Ok(resolved)
    }
}

impl Drop for SpecFileStore {
    fn drop(&mut self) {
        if let Some(dir) = self.temp_dir.take() {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!(dir = %dir.display(), "removed session temp directory"),
                Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove session temp directory"),
            }
        }
    }
}

/// Unique temp path under `{output_dir}/temp/spec/{sanitized}/{stamp}_{seq}`.
fn session_temp_path(ctx: &ValidationContext) -> PathBuf {
    let label = match ctx.spec_source() {
        crate::validation::SpecSource::Local { dir } => dir.to_string_lossy().into_owned(),
        crate::validation::SpecSource::Repository { fragment, .. } => fragment.clone(),
    };
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = TEMP_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    ctx.output_dir()
        .join("temp")
        .join("spec")
        .join(sanitize_dir_name(&label))
        .join(format!("{stamp}_{seq}"))
}

/// Collapse anything that is not a plain name character into `_` and cap
/// the length, so repository fragments make safe directory components.
fn sanitize_dir_name(name: &str) -> String {
    if name.trim().is_empty() {
        return "default".to_string();
    }
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    sanitized.truncate(MAX_SANITIZED_NAME_LEN);
    let trimmed = sanitized.trim_end_matches('_');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}
