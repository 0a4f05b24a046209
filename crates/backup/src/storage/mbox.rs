//! Append-only message body log

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// The `.mbox` file of one folder
#[derive(Debug)]
pub struct Mbox {
    path: PathBuf,
}

impl Mbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Current size in bytes (0 if the file does not exist yet)
    pub fn length(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", self.path.display())),
        }
    }

    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(data)
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        file.flush()?;
        Ok(())
    }

    /// Truncate the log back to `length` bytes
    pub fn rewind(&self, length: u64) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.set_len(length)
            .with_context(|| format!("Failed to truncate {}", self.path.display()))
    }

    /// Read `length` bytes starting at `offset`
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = Vec::with_capacity(length as usize);
        file.take(length)
            .read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(buffer)
    }

    pub fn delete(&self) -> Result<()> {
        if self.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to delete {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn rename(&mut self, new_path: PathBuf) -> Result<()> {
        if self.exists() {
            fs::rename(&self.path, &new_path).with_context(|| {
                format!("Failed to rename {} to {}", self.path.display(), new_path.display())
            })?;
        }
        self.path = new_path;
        Ok(())
    }
}
