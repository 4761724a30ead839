//! File Sink
//!
//! Writes encoded messages to disk. Per-message files are written to a
//! temporary name, synced, then renamed into place. The append layout
//! writes each message with one `write_all` plus `sync_data`; a message torn
//! by a crash is cut off the end of the file the first time the sink writes
//! after a restart.

use crate::{Delivery, MessageSink, TransportError};
use async_trait::async_trait;
use hl7_encoder::ObservationMessage;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How messages are laid out on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileLayout {
    /// One file per message inside a directory
    #[default]
    PerMessage,
    /// All messages appended to a single file, newline separated
    Append,
}

/// File sink settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSinkConfig {
    /// Directory for `PerMessage`, file for `Append`
    pub path: PathBuf,
    pub layout: FileLayout,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hl7_messages"),
            layout: FileLayout::PerMessage,
        }
    }
}

impl FileSinkConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.path.as_os_str().is_empty() {
            return Err("File sink path cannot be empty".to_string());
        }
        if self.layout == FileLayout::Append && self.path.file_name().is_none() {
            return Err(format!(
                "Append layout needs a file path, got {}",
                self.path.display()
            ));
        }
        Ok(())
    }
}

/// Sink that writes messages to the local filesystem
pub struct FileSink {
    config: FileSinkConfig,
    /// Append target checked for a torn tail
    tail_checked: bool,
}

impl FileSink {
    pub fn new(config: FileSinkConfig) -> Self {
        Self {
            config,
            tail_checked: false,
        }
    }

    /// Name of the file a message lands in under the `PerMessage` layout
    pub fn message_file_name(message: &ObservationMessage) -> String {
        format!(
            "HL7_{}_{}.hl7",
            message.created_at.format("%Y%m%d_%H%M%S_%6f"),
            message.control_id
        )
    }
}

#[async_trait]
impl MessageSink for FileSink {
    async fn deliver(&mut self, message: &ObservationMessage) -> Result<Delivery, TransportError> {
        let config = self.config.clone();
        let encoded = message.encode();
        let file_name = Self::message_file_name(message);
        let check_tail = !self.tail_checked;

        let written = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            match config.layout {
                FileLayout::PerMessage => {
                    fs::create_dir_all(&config.path)?;
                    let target = config.path.join(file_name);
                    write_atomic(&target, encoded.as_bytes())?;
                    Ok(target)
                }
                FileLayout::Append => {
                    if check_tail {
                        if let Some(cut) = trim_torn_tail(&config.path)? {
                            warn!(
                                "Removed {} bytes of an incomplete message from {}",
                                cut,
                                config.path.display()
                            );
                        }
                    }
                    append_message(&config.path, &encoded)?;
                    Ok(config.path.clone())
                }
            }
        })
        .await
        .map_err(|e| TransportError::File(format!("write task failed: {}", e)))?;

        let target = written.map_err(|e| TransportError::File(e.to_string()))?;
        self.tail_checked = true;
        debug!("Message {} written to {}", message.control_id, target.display());
        Ok(Delivery::Delivered)
    }

    async fn close(&mut self) {
        info!("File sink {} closed", self.config.path.display());
    }

    fn describe(&self) -> String {
        format!("file://{}", self.config.path.display())
    }
}

const TAIL_CHUNK: u64 = 4096;

fn parent_dir(target: &Path) -> PathBuf {
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Append one message and its newline, then flush it to disk
fn append_message(path: &Path, encoded: &str) -> std::io::Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir)?;
    let created = !path.exists();

    let mut record = Vec::with_capacity(encoded.len() + 1);
    record.extend_from_slice(encoded.as_bytes());
    record.push(b'\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&record)?;
    file.sync_data()?;

    if created {
        sync_dir_logged(&dir);
    }
    Ok(())
}

/// Cut everything after the last newline of `path`, which is what an
/// interrupted append leaves behind. Returns the number of bytes removed.
fn trim_torn_tail(path: &Path) -> std::io::Result<Option<u64>> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(None);
    }

    // Scan backwards for the last newline, one chunk at a time
    let mut end = len;
    let mut keep = 0;
    let mut chunk = vec![0u8; TAIL_CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK);
        let size = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk[..size])?;
        if let Some(pos) = chunk[..size].iter().rposition(|&b| b == b'\n') {
            keep = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    if keep == len {
        return Ok(None);
    }
    file.set_len(keep)?;
    file.sync_all()?;
    Ok(Some(len - keep))
}

/// Temp file + fsync + rename, then fsync the directory
fn write_atomic(target: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = parent_dir(target);
    fs::create_dir_all(&dir)?;

    let temp = dir.join(format!(
        ".{}.{}.{}.tmp",
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&temp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp, target)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result?;

    sync_dir_logged(&dir);
    Ok(())
}

/// Persist directory entries (new names, renames)
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// A failure leaves the data synced but its directory entry possibly not
fn sync_dir_logged(dir: &Path) {
    if let Err(e) = sync_dir(dir) {
        warn!("Could not sync directory {}: {}", dir.display(), e);
    }
}
