//! Append-only JSONL journal.
//!
//! One JSON document per line. Appends take an exclusive file lock so two
//! processes sharing a home directory never interleave partial lines.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::error::TransientIoError;

const TAIL_CHUNK: usize = 4096;

/// Typed append-only log stored at a single path
#[derive(Debug)]
pub struct Journal<T> {
    path: PathBuf,
    _entry: PhantomData<fn() -> T>,
}

impl<T> Journal<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open (creating parent directories) a journal at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, TransientIoError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                TransientIoError::new(format!("create directory {}", parent.display()), e)
            })?;
        }
        Ok(Self {
            path,
            _entry: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it
    pub async fn append(&self, entry: &T) -> Result<(), TransientIoError> {
        let json = serde_json::to_string(entry)
            .map_err(|e| TransientIoError::new("serialize journal entry", e))?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || append_line(&path, &json))
            .await
            .map_err(|e| TransientIoError::new("journal append task", e))?
    }

    /// Read every entry in append order.
    ///
    /// A torn final line (crash mid-append) is skipped with a warning; any
    /// other malformed line is an error.
    pub async fn replay(&self) -> Result<Vec<T>, TransientIoError> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(TransientIoError::new(
                    format!("open journal {}", self.path.display()),
                    e,
                ))
            }
        };

        let mut lines = BufReader::new(file).lines();
        let mut raw = Vec::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| TransientIoError::new(format!("read journal {}", self.path.display()), e))?
        {
            if !line.trim().is_empty() {
                raw.push(line);
            }
        }

        let last = raw.len().saturating_sub(1);
        let mut entries = Vec::with_capacity(raw.len());
        for (idx, line) in raw.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if idx == last => {
                    warn!(path = %self.path.display(), error = %e, "Skipping torn journal line");
                }
                Err(e) => {
                    return Err(TransientIoError::new(
                        format!("parse journal {} line {}", self.path.display(), idx + 1),
                        e,
                    ))
                }
            }
        }
        Ok(entries)
    }
}

fn append_line(path: &Path, json: &str) -> Result<(), TransientIoError> {
    let op = || format!("append to {}", path.display());

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| TransientIoError::new(op(), e))?;

    file.lock_exclusive()
        .map_err(|e| TransientIoError::new(op(), e))?;

    // A crash mid-append leaves a partial line; cut it before writing
    let dropped = truncate_torn_tail(&mut file).map_err(|e| TransientIoError::new(op(), e))?;
    if dropped > 0 {
        warn!(path = %path.display(), bytes = dropped, "Dropped torn journal tail");
    }

    writeln!(file, "{}", json).map_err(|e| TransientIoError::new(op(), e))?;
    file.flush().map_err(|e| TransientIoError::new(op(), e))?;

    // Lock is released when file is dropped
    Ok(())
}

/// Cut everything after the last newline. Returns the number of bytes removed.
fn truncate_torn_tail(file: &mut std::fs::File) -> std::io::Result<u64> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut buf = vec![0u8; TAIL_CHUNK];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;

        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            let keep = start + pos as u64 + 1;
            if keep < len {
                file.set_len(keep)?;
            }
            return Ok(len - keep);
        }
        end = start;
    }

    file.set_len(0)?;
    Ok(len)
}
