//! Staging buffer for copies: memory first, spilling to a temporary file.
//!
//! A [`HybridBuffer`] is written once (it implements `AsyncWrite`), sealed
//! with [`HybridBuffer::finish_writing`], then read back once (it
//! implements `AsyncRead`). Bytes up to the memory limit never touch the
//! disk; everything after that goes to a uniquely named file that
//! [`HybridBuffer::dispose`] removes.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpConfig;
use std::fs::OpenOptions;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use uuid::Uuid;

/// Where the backing store currently lives. The transition from
/// `InMemory` to `SpilledToDisk` happens at most once.
enum Storage {
    InMemory { bytes: Vec<u8> },
    SpilledToDisk { bytes: Vec<u8>, path: PathBuf, file: File },
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Filling,
    Draining { memory_pos: usize },
    Disposed,
}

/// Naming of the spill file.
#[derive(Debug, Clone)]
pub struct SpillTarget {
    pub directory: PathBuf,
    pub prefix: String,
    pub suffix: String,
}

impl SpillTarget {
    fn fresh_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}{}{}", self.prefix, Uuid::new_v4(), self.suffix))
    }
}

pub struct HybridBuffer {
    storage: Storage,
    phase: Phase,
    memory_limit: usize,
    spill: SpillTarget,
    written: u64,
}

impl HybridBuffer {
    pub fn new(memory_limit: usize, spill: SpillTarget) -> Self {
        Self {
            storage: Storage::InMemory {
                bytes: Vec::with_capacity(memory_limit.min(64 * 1024)),
            },
            phase: Phase::Filling,
            memory_limit,
            spill,
            written: 0,
        }
    }

    pub fn from_config(config: &FtpConfig) -> Self {
        Self::new(
            config.file_copy_memory_buffer_size,
            SpillTarget {
                directory: config.temporary_file_directory.clone(),
                prefix: config.temporary_file_prefix.clone(),
                suffix: config.temporary_file_suffix.clone(),
            },
        )
    }

    /// Total bytes accepted so far.
    pub fn len(&self) -> u64 {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.storage, Storage::SpilledToDisk { .. })
    }

    /// Path of the spill file while one exists.
    pub fn spill_path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::SpilledToDisk { path, .. } => Some(path),
            _ => None,
        }
    }

    /// End the write phase and rewind for reading.
    pub async fn finish_writing(&mut self) -> FtpResult<()> {
        if self.phase != Phase::Filling {
            return Err(FtpError::stream_state("staging buffer is not being written"));
        }
        if let Storage::SpilledToDisk { file, .. } = &mut self.storage {
            file.flush().await?;
            file.seek(SeekFrom::Start(0)).await?;
        }
        self.phase = Phase::Draining { memory_pos: 0 };
        Ok(())
    }

    /// Free the memory region and delete the spill file. Idempotent;
    /// deletion failures are logged, never raised.
    pub async fn dispose(&mut self) {
        if self.phase == Phase::Disposed {
            return;
        }
        self.phase = Phase::Disposed;
        if let Storage::SpilledToDisk { file, path, .. } =
            std::mem::replace(&mut self.storage, Storage::Released)
        {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                log::warn!("failed to remove copy staging file {}: {}", path.display(), e);
            }
        }
    }

    fn spill_to_disk(&mut self) -> io::Result<()> {
        let path = self.spill.fresh_path();
        let std_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        log::debug!(
            "copy staging exceeded {} bytes, spilling to {}",
            self.memory_limit,
            path.display()
        );
        let bytes = match std::mem::replace(&mut self.storage, Storage::Released) {
            Storage::InMemory { bytes } => bytes,
            other => {
                self.storage = other;
                return Ok(());
            }
        };
        self.storage = Storage::SpilledToDisk {
            bytes,
            path,
            file: File::from_std(std_file),
        };
        Ok(())
    }
}

fn wrong_phase(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("staging buffer is not {}", what))
}

impl AsyncWrite for HybridBuffer {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.phase != Phase::Filling {
            return Poll::Ready(Err(wrong_phase("writable")));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if let Storage::InMemory { bytes } = &mut this.storage {
            let room = this.memory_limit.saturating_sub(bytes.len());
            if room > 0 {
                let n = room.min(buf.len());
                bytes.extend_from_slice(&buf[..n]);
                this.written += n as u64;
                return Poll::Ready(Ok(n));
            }
            if let Err(e) = this.spill_to_disk() {
                return Poll::Ready(Err(e));
            }
        }
        match &mut this.storage {
            Storage::SpilledToDisk { file, .. } => match Pin::new(file).poll_write(cx, buf) {
                Poll::Ready(Ok(n)) => {
                    this.written += n as u64;
                    Poll::Ready(Ok(n))
                }
                other => other,
            },
            _ => Poll::Ready(Err(wrong_phase("writable"))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.storage {
            Storage::SpilledToDisk { file, .. } => Pin::new(file).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl AsyncRead for HybridBuffer {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let memory_pos = match this.phase {
            Phase::Draining { memory_pos } => memory_pos,
            _ => return Poll::Ready(Err(wrong_phase("readable"))),
        };
        let (bytes, file) = match &mut this.storage {
            Storage::InMemory { bytes } => (bytes, None),
            Storage::SpilledToDisk { bytes, file, .. } => (bytes, Some(file)),
            Storage::Released => return Poll::Ready(Err(wrong_phase("readable"))),
        };
        if memory_pos < bytes.len() {
            let n = (bytes.len() - memory_pos).min(buf.remaining());
            buf.put_slice(&bytes[memory_pos..memory_pos + n]);
            this.phase = Phase::Draining { memory_pos: memory_pos + n };
            return Poll::Ready(Ok(()));
        }
        match file {
            Some(file) => Pin::new(file).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

fn remove_spill_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("failed to remove copy staging file {}: {}", path.display(), e);
    }
}

/// Only reached when `dispose()` was skipped. Inside a runtime the unlink
/// goes to the blocking pool; outside one it runs inline.
impl Drop for HybridBuffer {
    fn drop(&mut self) {
        if let Storage::SpilledToDisk { file, path, .. } =
            std::mem::replace(&mut self.storage, Storage::Released)
        {
            drop(file);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(move || remove_spill_file(&path));
                }
                Err(_) => remove_spill_file(&path),
            }
        }
    }
}
