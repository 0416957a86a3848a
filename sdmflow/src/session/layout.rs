//! Persisted state layout on scratch and durable storage.

use std::io;
use std::path::{Path, PathBuf};

const STATE_DIR: &str = "state";
const OUTPUT_DIR: &str = "output";
const TMP_DIR: &str = "tmp";
const LOG_DIR: &str = "logs";
const ACCOUNTING_DIR: &str = "accounting";

/// Where every file the driver reads or writes lives.
///
/// Stage work units discover the current batch through
/// [`SessionLayout::batch_marker`]; the settings-update step writes
/// [`SessionLayout::entity_list`] and [`SessionLayout::entity_count`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    scratch: PathBuf,
    durable: PathBuf,
    finished_models: PathBuf,
}

impl SessionLayout {
    /// Creates a layout rooted at the given scratch and durable directories.
    ///
    /// `finished_models` is relative to the scratch output tree.
    #[must_use]
    pub fn new(
        scratch: impl Into<PathBuf>,
        durable: impl Into<PathBuf>,
        finished_models: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scratch: scratch.into(),
            durable: durable.into(),
            finished_models: finished_models.into(),
        }
    }

    /// Scratch root.
    #[must_use]
    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Durable root.
    #[must_use]
    pub fn durable(&self) -> &Path {
        &self.durable
    }

    /// Driver-owned state files.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.scratch.join(STATE_DIR)
    }

    /// Batch output tree on scratch.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.scratch.join(OUTPUT_DIR)
    }

    /// Temporary files written by work units.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.scratch.join(TMP_DIR)
    }

    /// Subtree holding fitted model objects.
    #[must_use]
    pub fn finished_models_dir(&self) -> PathBuf {
        self.output_dir().join(&self.finished_models)
    }

    /// Root of the stage log directories.
    #[must_use]
    pub fn log_root(&self) -> PathBuf {
        self.scratch.join(LOG_DIR)
    }

    /// Log directory for one stage.
    #[must_use]
    pub fn stage_log_dir(&self, stage: &str) -> PathBuf {
        self.log_root().join(stage)
    }

    /// Mirror destination for batch outputs.
    #[must_use]
    pub fn durable_output_dir(&self) -> PathBuf {
        self.durable.join(OUTPUT_DIR)
    }

    /// Session accounting logs.
    #[must_use]
    pub fn accounting_dir(&self) -> PathBuf {
        self.durable.join(ACCOUNTING_DIR)
    }

    /// Session identifiers, one appended per session.
    #[must_use]
    pub fn session_id_file(&self) -> PathBuf {
        self.state_dir().join("session_id.txt")
    }

    /// Index of the batch currently running.
    #[must_use]
    pub fn batch_marker(&self) -> PathBuf {
        self.state_dir().join("batch_index.txt")
    }

    /// Entities of the current batch, one per line.
    #[must_use]
    pub fn entity_list(&self) -> PathBuf {
        self.state_dir().join("entity_list.txt")
    }

    /// Entity count of the current batch.
    #[must_use]
    pub fn entity_count(&self) -> PathBuf {
        self.state_dir().join("entity_count.txt")
    }

    /// Total number of batches, written by the partition step.
    #[must_use]
    pub fn batch_count(&self) -> PathBuf {
        self.state_dir().join("n_batches.txt")
    }

    /// Simulation combinations, one `a_b` per line.
    #[must_use]
    pub fn combinations_file(&self) -> PathBuf {
        self.state_dir().join("sim_combinations.txt")
    }

    /// Manifest of priority artifacts for the selective sync.
    #[must_use]
    pub fn manifest_file(&self) -> PathBuf {
        self.state_dir().join("finished_models.manifest")
    }

    /// Exclusion patterns for the bulk sync.
    #[must_use]
    pub fn exclude_file(&self) -> PathBuf {
        self.state_dir().join("sync_exclude.txt")
    }

    /// Accounting log for one batch.
    #[must_use]
    pub fn accounting_log(&self, session_id: &str, batch_stamp: &str) -> PathBuf {
        self.accounting_dir()
            .join(format!("accounting_{session_id}_{batch_stamp}.log"))
    }

    /// Creates every directory the driver writes into.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            self.state_dir(),
            self.output_dir(),
            self.tmp_dir(),
            self.log_root(),
            self.durable_output_dir(),
            self.accounting_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Writes the batch index marker.
    ///
    /// The marker is written to a sibling file and renamed into place so a
    /// reader never sees a partial value.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn write_batch_marker(&self, index: u32) -> io::Result<()> {
        let marker = self.batch_marker();
        let staging = marker.with_extension("txt.tmp");
        std::fs::write(&staging, format!("{index}\n"))?;
        std::fs::rename(&staging, &marker)
    }

    /// Removes the previous batch's entity list and entity count.
    ///
    /// Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    pub fn clear_batch_entities(&self) -> io::Result<()> {
        remove_if_present(&self.entity_list())?;
        remove_if_present(&self.entity_count())
    }

    /// Removes a combination file left by an earlier session.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    pub fn clear_combinations(&self) -> io::Result<()> {
        remove_if_present(&self.combinations_file())
    }

    /// Reads the batch index marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker is missing or malformed.
    pub fn read_batch_marker(&self) -> io::Result<u32> {
        let raw = std::fs::read_to_string(self.batch_marker())?;
        raw.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_rooted() {
        let layout = SessionLayout::new("/scratch/run", "/project/run", "finished_models");
        assert_eq!(
            layout.batch_marker(),
            PathBuf::from("/scratch/run/state/batch_index.txt")
        );
        assert_eq!(
            layout.finished_models_dir(),
            PathBuf::from("/scratch/run/output/finished_models")
        );
        assert_eq!(
            layout.stage_log_dir("global_fit"),
            PathBuf::from("/scratch/run/logs/global_fit")
        );
        assert_eq!(
            layout.accounting_log("abc", "20240101T000000"),
            PathBuf::from("/project/run/accounting/accounting_abc_20240101T000000.log")
        );
    }

    #[test]
    fn test_batch_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(dir.path().join("s"), dir.path().join("d"), "models");
        layout.ensure_dirs().unwrap();

        layout.write_batch_marker(3).unwrap();
        assert_eq!(layout.read_batch_marker().unwrap(), 3);
        layout.write_batch_marker(4).unwrap();
        assert_eq!(layout.read_batch_marker().unwrap(), 4);
        assert!(!layout.batch_marker().with_extension("txt.tmp").exists());
    }

    #[test]
    fn test_clear_batch_entities() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(dir.path().join("s"), dir.path().join("d"), "models");
        layout.ensure_dirs().unwrap();

        layout.clear_batch_entities().unwrap();
        std::fs::write(layout.entity_list(), "sp1\n").unwrap();
        std::fs::write(layout.entity_count(), "1\n").unwrap();
        layout.clear_batch_entities().unwrap();
        assert!(!layout.entity_list().exists());
        assert!(!layout.entity_count().exists());
    }
}
