use crate::error::{Result, ShepherdError};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// LogWriter appends captured lines to one destination file
///
/// Files are only ever opened in append mode, so content written by earlier
/// lives of a process is never truncated.
pub struct LogWriter {
    /// Destination file
    path: PathBuf,
    /// Open handle, `None` after a failed write until the next reopen
    file: Option<File>,
    /// strftime pattern prefixed to each line, when timestamps are enabled
    timestamp_format: Option<String>,
}

impl LogWriter {
    /// Open (or create) a destination file for appending
    ///
    /// # Arguments
    /// * `path` - Destination file; missing parent directories are created
    /// * `timestamp_format` - strftime pattern to prefix each line with
    ///
    /// # Returns
    /// * `Ok(LogWriter)` - File is open
    /// * `Err(ShepherdError::RuntimeIo)` - File could not be opened
    pub async fn open(path: &Path, timestamp_format: Option<String>) -> Result<Self> {
        let mut writer = Self::detached(path, timestamp_format);
        writer.ensure_open().await?;
        Ok(writer)
    }

    /// Create a writer that opens its file on first write
    pub fn detached(path: &Path, timestamp_format: Option<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            timestamp_format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. A newline is added; `line` must not carry its own.
    ///
    /// A failed write closes the file and retries once on a fresh handle.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let entry = self.format_log_entry(&Local::now(), line);

        if let Err(first) = self.append(&entry).await {
            tracing::warn!(
                "Write to {} failed ({}), reopening",
                self.path.display(),
                first
            );
            self.file = None;
            if let Err(second) = self.append(&entry).await {
                self.file = None;
                return Err(second);
            }
        }
        Ok(())
    }

    /// Flush any buffered data to disk
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await.map_err(|e| {
                ShepherdError::RuntimeIo(format!("Failed to flush {}: {}", self.path.display(), e))
            })?;
        }
        Ok(())
    }

    async fn append(&mut self, entry: &[u8]) -> Result<()> {
        let path = self.path.clone();
        let file = self.ensure_open().await?;
        file.write_all(entry).await.map_err(|e| {
            ShepherdError::RuntimeIo(format!("Failed to write to {}: {}", path.display(), e))
        })?;
        file.flush().await.map_err(|e| {
            ShepherdError::RuntimeIo(format!("Failed to flush {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    async fn ensure_open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ShepherdError::RuntimeIo(format!(
                        "Failed to create log directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    ShepherdError::RuntimeIo(format!(
                        "Failed to open {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
            self.file = Some(file);
        }

        self.file
            .as_mut()
            .ok_or_else(|| ShepherdError::Internal("log file handle missing".to_string()))
    }

    /// Build `<timestamp>: <line>\n`, or just `<line>\n` without timestamps
    fn format_log_entry(&self, timestamp: &DateTime<Local>, line: &[u8]) -> Vec<u8> {
        let mut prefix = String::new();
        if let Some(ref format) = self.timestamp_format {
            // Formats are validated at load; an unexpected failure just drops the prefix
            if write!(prefix, "{}: ", timestamp.format(format)).is_err() {
                prefix.clear();
            }
        }

        let mut entry = Vec::with_capacity(prefix.len() + line.len() + 1);
        entry.extend_from_slice(prefix.as_bytes());
        entry.extend_from_slice(line);
        entry.push(b'\n');
        entry
    }
}
