//! Mirrors copy batch outputs from scratch to durable storage.

use super::exclude::ExcludeList;
use crate::errors::SchedulerError;
use crate::scheduler::run_command;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Counters reported by a mirror.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStats {
    /// Files written at the destination.
    pub copied: u64,
    /// Files already up to date.
    pub unchanged: u64,
}

/// Mirror failures.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Filesystem error.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The path being read or written.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The external copy tool could not run.
    #[error(transparent)]
    Command(#[from] SchedulerError),
    /// The external copy tool exited non-zero.
    #[error("{tool} exited with {code:?}: {stderr}")]
    Failed {
        /// Tool name.
        tool: String,
        /// Exit code.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
}

impl MirrorError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Copies files between two trees without deleting at the destination.
///
/// Both operations are additive and may be repeated; a second run copies
/// nothing that is already current.
#[async_trait]
pub trait Mirror: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Copies exactly the listed files (relative to `src`).
    ///
    /// `manifest` holds the same list, one path per line.
    async fn copy_listed(
        &self,
        src: &Path,
        dest: &Path,
        files: &[PathBuf],
        manifest: &Path,
    ) -> Result<MirrorStats, MirrorError>;

    /// Copies the whole tree except excluded paths.
    ///
    /// `exclude_file` holds the same patterns, one per line.
    async fn mirror_tree(
        &self,
        src: &Path,
        dest: &Path,
        excludes: &ExcludeList,
        exclude_file: &Path,
    ) -> Result<MirrorStats, MirrorError>;
}

/// Mirrors with `rsync -a`.
#[derive(Debug, Clone)]
pub struct RsyncMirror {
    binary: String,
    dry_run: bool,
}

impl Default for RsyncMirror {
    fn default() -> Self {
        Self {
            binary: "rsync".to_string(),
            dry_run: false,
        }
    }
}

impl RsyncMirror {
    /// Creates a mirror using `rsync` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Passes `--dry-run` to every call.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["-a".to_string(), "--stats".to_string()];
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        args
    }

    async fn run(&self, mut args: Vec<String>, src: &Path, dest: &Path) -> Result<MirrorStats, MirrorError> {
        std::fs::create_dir_all(dest).map_err(|e| MirrorError::io(dest, e))?;
        args.push(format!("{}/", src.display()));
        args.push(format!("{}/", dest.display()));
        debug!(tool = %self.binary, ?args, "Mirroring");

        let output = run_command(&self.binary, &args, &[]).await?;
        if !output.success() {
            return Err(MirrorError::Failed {
                tool: self.binary.clone(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(parse_rsync_stats(&output.stdout))
    }
}

/// Reads the transfer counters from `rsync --stats` output.
fn parse_rsync_stats(stdout: &str) -> MirrorStats {
    let number = |label: &str| {
        stdout.lines().find_map(|line| {
            let rest = line.trim().strip_prefix(label)?;
            rest.trim_start_matches(':')
                .split_whitespace()
                .next()?
                .replace(',', "")
                .parse::<u64>()
                .ok()
        })
    };
    let files = number("Number of regular files transferred").unwrap_or(0);
    let total = number("Number of files").unwrap_or(files);
    MirrorStats {
        copied: files,
        unchanged: total.saturating_sub(files),
    }
}

#[async_trait]
impl Mirror for RsyncMirror {
    fn name(&self) -> &str {
        "rsync"
    }

    async fn copy_listed(
        &self,
        src: &Path,
        dest: &Path,
        _files: &[PathBuf],
        manifest: &Path,
    ) -> Result<MirrorStats, MirrorError> {
        let mut args = self.base_args();
        args.push(format!("--files-from={}", manifest.display()));
        self.run(args, src, dest).await
    }

    async fn mirror_tree(
        &self,
        src: &Path,
        dest: &Path,
        _excludes: &ExcludeList,
        exclude_file: &Path,
    ) -> Result<MirrorStats, MirrorError> {
        let mut args = self.base_args();
        args.push(format!("--exclude-from={}", exclude_file.display()));
        self.run(args, src, dest).await
    }
}

/// Mirrors with plain file copies.
///
/// A file is skipped when the destination already has the same size and
/// modification time; copies carry the source modification time over.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMirror;

impl LocalMirror {
    fn copy_one(src: &Path, dest: &Path, stats: &mut MirrorStats) -> Result<(), MirrorError> {
        let meta = std::fs::metadata(src).map_err(|e| MirrorError::io(src, e))?;
        let modified = meta.modified().map_err(|e| MirrorError::io(src, e))?;

        if let Ok(existing) = std::fs::metadata(dest) {
            if existing.len() == meta.len() && existing.modified().ok() == Some(modified) {
                stats.unchanged += 1;
                return Ok(());
            }
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
        }
        std::fs::copy(src, dest).map_err(|e| MirrorError::io(dest, e))?;
        std::fs::File::options()
            .write(true)
            .open(dest)
            .and_then(|f| f.set_modified(modified))
            .map_err(|e| MirrorError::io(dest, e))?;
        stats.copied += 1;
        Ok(())
    }

    fn copy_listed_blocking(
        src: &Path,
        dest: &Path,
        files: &[PathBuf],
    ) -> Result<MirrorStats, MirrorError> {
        let mut stats = MirrorStats::default();
        for rel in files {
            Self::copy_one(&src.join(rel), &dest.join(rel), &mut stats)?;
        }
        Ok(stats)
    }

    fn mirror_tree_blocking(
        src: &Path,
        dest: &Path,
        excludes: &ExcludeList,
    ) -> Result<MirrorStats, MirrorError> {
        let mut stats = MirrorStats::default();
        std::fs::create_dir_all(dest).map_err(|e| MirrorError::io(dest, e))?;
        if !src.exists() {
            return Ok(stats);
        }

        let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(src)
                .map(|rel| !excludes.matches(rel, entry.file_type().is_dir()))
                .unwrap_or(true)
        });
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(src).to_path_buf();
                MirrorError::io(&path, e.into())
            })?;
            let Ok(rel) = entry.path().strip_prefix(src) else {
                continue;
            };
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target).map_err(|e| MirrorError::io(&target, e))?;
            } else if entry.file_type().is_file() {
                Self::copy_one(entry.path(), &target, &mut stats)?;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl Mirror for LocalMirror {
    fn name(&self) -> &str {
        "local"
    }

    async fn copy_listed(
        &self,
        src: &Path,
        dest: &Path,
        files: &[PathBuf],
        _manifest: &Path,
    ) -> Result<MirrorStats, MirrorError> {
        let (src, dest, files) = (src.to_path_buf(), dest.to_path_buf(), files.to_vec());
        tokio::task::spawn_blocking(move || Self::copy_listed_blocking(&src, &dest, &files))
            .await
            .map_err(|e| MirrorError::io(Path::new("."), std::io::Error::other(e)))?
    }

    async fn mirror_tree(
        &self,
        src: &Path,
        dest: &Path,
        excludes: &ExcludeList,
        _exclude_file: &Path,
    ) -> Result<MirrorStats, MirrorError> {
        let (src, dest, excludes) = (src.to_path_buf(), dest.to_path_buf(), excludes.clone());
        tokio::task::spawn_blocking(move || Self::mirror_tree_blocking(&src, &dest, &excludes))
            .await
            .map_err(|e| MirrorError::io(Path::new("."), std::io::Error::other(e)))?
    }
}
