use super::{MappingBackend, MappingSnapshot, SNAPSHOT_VERSION};
use crate::core::{MigrateError, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Stores the mapping snapshot as a single JSON document.
///
/// Each persist writes a temp file next to the target and renames it over
/// the old snapshot, so readers never observe a partially written file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl MappingBackend for FileBackend {
    fn load(&self) -> Result<MappingSnapshot> {
        if !self.path.exists() {
            return Ok(MappingSnapshot {
                version: SNAPSHOT_VERSION,
                ..MappingSnapshot::default()
            });
        }
        let file = File::open(&self.path).map_err(|e| {
            MigrateError::Io(format!(
                "Failed to open mapping file '{}': {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            MigrateError::Serialization(format!(
                "Failed to parse mapping file '{}': {}",
                self.path.display(),
                e
            ))
        })
    }

    fn persist(&mut self, snapshot: &MappingSnapshot) -> Result<()> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir).map_err(|e| {
            MigrateError::Io(format!(
                "Failed to create mapping directory '{}': {}",
                dir.display(),
                e
            ))
        })?;

        let temp = NamedTempFile::new_in(&dir).map_err(|e| {
            MigrateError::Io(format!("Failed to create temp file in '{}': {}", dir.display(), e))
        })?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, snapshot)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| {
            MigrateError::Io(format!(
                "Failed to replace mapping file '{}': {}",
                self.path.display(),
                e.error
            ))
        })?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
