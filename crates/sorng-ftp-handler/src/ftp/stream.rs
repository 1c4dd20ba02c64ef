//! Streams over a single in-flight transfer.
//!
//! A stream owns the gate for its whole lifetime: no other operation can
//! touch the connection until [`FtpInputStream::close`] /
//! [`FtpOutputStream::close`] has drained the transfer's final reply.
//! Closing is a two-step handshake (close the data channel, then read the
//! pending completion reply) and releases the gate exactly once, whether
//! or not either step succeeds.
//!
//! Dropping a stream without closing it still releases the gate, but the
//! session is then flagged for a reconnect before its next use.

use crate::ftp::client::{BoxedReader, BoxedWriter};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::session::Session;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "FTP stream is closed")
}

fn release(mut session: OwnedMutexGuard<Session>) {
    session.end_streaming();
}

/// Reads a remote file. Obtained from `FtpHandler::open_input_stream`.
pub struct FtpInputStream {
    inner: Option<BoxedReader>,
    session: Option<OwnedMutexGuard<Session>>,
    state: StreamState,
    path: String,
}

impl FtpInputStream {
    pub(crate) fn new(inner: BoxedReader, mut session: OwnedMutexGuard<Session>, path: String) -> Self {
        session.begin_streaming();
        Self {
            inner: Some(inner),
            session: Some(session),
            state: StreamState::Open,
            path,
        }
    }

    /// Absolute remote path being read.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Close the data channel, then complete the pending RETR.
    ///
    /// The gate stays inside the stream until the reply is in. A close that
    /// is cancelled midway leaves it to `Drop`, which flags a reconnect.
    pub async fn close(&mut self) -> FtpResult<()> {
        if self.state == StreamState::Closed {
            return Err(FtpError::stream_state(format!("input stream on {} already closed", self.path)));
        }
        self.state = StreamState::Closed;
        drop(self.inner.take());
        let Some(session) = self.session.as_mut() else {
            return Err(FtpError::stream_state("input stream lost its session"));
        };
        let result = session.complete_transfer(&self.path).await;
        if let Some(session) = self.session.take() {
            release(session);
        }
        if result.is_ok() {
            log::debug!("FTP input stream on {} completed", self.path);
        }
        result
    }
}

impl AsyncRead for FtpInputStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.inner.as_mut() {
            Some(inner) if this.state == StreamState::Open => Pin::new(inner).poll_read(cx, buf),
            _ => Poll::Ready(Err(closed_error())),
        }
    }
}

impl Drop for FtpInputStream {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            log::warn!("FTP input stream on {} dropped without close", self.path);
            session.abandon_transfer();
        }
    }
}

/// Writes a remote file. Obtained from `FtpHandler::open_output_stream`.
pub struct FtpOutputStream {
    inner: Option<BoxedWriter>,
    session: Option<OwnedMutexGuard<Session>>,
    state: StreamState,
    path: String,
}

impl FtpOutputStream {
    pub(crate) fn new(inner: BoxedWriter, mut session: OwnedMutexGuard<Session>, path: String) -> Self {
        session.begin_streaming();
        Self {
            inner: Some(inner),
            session: Some(session),
            state: StreamState::Open,
            path,
        }
    }

    /// Absolute remote path being written.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Flush and close the data channel, then complete the pending STOR.
    ///
    /// As with the input side, the gate is only handed back once both steps
    /// have finished.
    pub async fn close(&mut self) -> FtpResult<()> {
        if self.state == StreamState::Closed {
            return Err(FtpError::stream_state(format!("output stream on {} already closed", self.path)));
        }
        self.state = StreamState::Closed;
        if self.session.is_none() {
            return Err(FtpError::stream_state("output stream lost its session"));
        }

        let shutdown = match self.inner.as_mut() {
            Some(inner) => inner.shutdown().await,
            None => Ok(()),
        };
        drop(self.inner.take());

        let result = match (shutdown, self.session.as_mut()) {
            (Ok(()), Some(session)) => session.complete_transfer(&self.path).await,
            (Err(e), Some(session)) => {
                session.force_disconnect().await;
                Err(FtpError::io_error(format!("failed to close data channel of {}", self.path))
                    .with_path(self.path.clone())
                    .with_cause(e.into()))
            }
            (_, None) => Err(FtpError::stream_state("output stream lost its session")),
        };
        if let Some(session) = self.session.take() {
            release(session);
        }
        if result.is_ok() {
            log::debug!("FTP output stream on {} completed", self.path);
        }
        result
    }
}

impl AsyncWrite for FtpOutputStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match this.inner.as_mut() {
            Some(inner) if this.state == StreamState::Open => Pin::new(inner).poll_write(cx, buf),
            _ => Poll::Ready(Err(closed_error())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.inner.as_mut() {
            Some(inner) if this.state == StreamState::Open => Pin::new(inner).poll_flush(cx),
            _ => Poll::Ready(Err(closed_error())),
        }
    }

    /// Half-closes the data channel only; `close()` still has to collect
    /// the server's final reply.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.inner.as_mut() {
            Some(inner) if this.state == StreamState::Open => Pin::new(inner).poll_shutdown(cx),
            _ => Poll::Ready(Err(closed_error())),
        }
    }
}

impl Drop for FtpOutputStream {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            log::warn!("FTP output stream on {} dropped without close", self.path);
            session.abandon_transfer();
        }
    }
}
