//! Scratch cleanup.

use std::io;
use std::path::Path;

/// Removes everything inside `dir`, keeping `dir` itself.
///
/// Clearing a directory that does not exist is a no-op. Returns the number
/// of top-level entries removed.
///
/// # Errors
///
/// Returns an error if an entry cannot be removed.
pub fn clear_subtree(dir: &Path) -> io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clears_contents_and_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output");
        std::fs::create_dir_all(output.join("maps/sp1")).unwrap();
        std::fs::write(output.join("maps/sp1/a.tif"), "x").unwrap();
        std::fs::write(output.join("top.csv"), "y").unwrap();

        assert_eq!(clear_subtree(&output).unwrap(), 2);
        assert!(output.is_dir());
        assert_eq!(std::fs::read_dir(&output).unwrap().count(), 0);
        assert_eq!(clear_subtree(&output).unwrap(), 0);
    }

    #[test]
    fn test_missing_directory_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(clear_subtree(&dir.path().join("absent")).unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_is_unlinked_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("keep.txt"), "k").unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        std::os::unix::fs::symlink(&outside, tmp.join("link")).unwrap();

        clear_subtree(&tmp).unwrap();
        assert!(outside.join("keep.txt").is_file());
        assert!(!tmp.join("link").exists());
    }
}
