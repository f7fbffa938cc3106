//! Size-based file rotation
//!
//! Numbered backups: `name` is live, `name.1` is the most recent backup,
//! `name.<max_backups>` the oldest. Rotation happens before a write that
//! would cross the size limit.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::domain::{AgentError, Result};

pub struct SizeRotator {
    path: PathBuf,
    max_size: u64,
    max_backups: usize,
    file: Option<File>,
    written: u64,
}

impl SizeRotator {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_size_mb: u64, max_backups: usize) -> SizeRotator {
        SizeRotator {
            path: path.into(),
            max_size: max_size_mb * 1024 * 1024,
            max_backups,
            file: None,
            written: 0,
        }
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.file.is_none() {
            self.open()?;
        }
        if self.written + data.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let file = self.file.as_mut().expect("opened above");
        file.write_all(data).map_err(|e| AgentError::file(self.path.display().to_string(), e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::file(parent.display().to_string(), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AgentError::file(self.path.display().to_string(), e))?;
        self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.file = None;

        if self.max_backups == 0 {
            std::fs::remove_file(&self.path)
                .map_err(|e| AgentError::file(self.path.display().to_string(), e))?;
        } else {
            let backup = |n: usize| PathBuf::from(format!("{}.{n}", self.path.display()));
            let _ = std::fs::remove_file(backup(self.max_backups));
            for n in (1..self.max_backups).rev() {
                let _ = std::fs::rename(backup(n), backup(n + 1));
            }
            std::fs::rename(&self.path, backup(1))
                .map_err(|e| AgentError::file(self.path.display().to_string(), e))?;
        }

        self.open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let mut rotator = SizeRotator::new(&path, 1, 2);
        rotator.write_all(b"one\n").unwrap();
        rotator.write_all(b"two\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_rotation_shifts_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        // limit of 0 MiB forces a rotation on every write
        let mut rotator = SizeRotator::new(&path, 0, 2);

        rotator.write_all(b"first\n").unwrap();
        rotator.write_all(b"second\n").unwrap();
        rotator.write_all(b"third\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "third\n");
        assert_eq!(
            std::fs::read_to_string(format!("{}.1", path.display())).unwrap(),
            "second\n"
        );
        assert_eq!(
            std::fs::read_to_string(format!("{}.2", path.display())).unwrap(),
            "first\n"
        );
        assert!(!std::path::Path::new(&format!("{}.3", path.display())).exists());
    }

    #[test]
    fn test_existing_size_counts_toward_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        std::fs::write(&path, vec![b'x'; 1024 * 1024]).unwrap();

        let mut rotator = SizeRotator::new(&path, 1, 1);
        rotator.write_all(b"overflow\n").unwrap();
        // the old megabyte moved to the backup
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "overflow\n");
        assert!(std::path::Path::new(&format!("{}.1", path.display())).exists());
    }
}
