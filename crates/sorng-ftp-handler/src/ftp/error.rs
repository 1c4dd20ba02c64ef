//! FTP handler error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised handler error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// Absolute remote path the failing operation addressed.
    pub path: Option<String>,
    /// Underlying failure, surfaced through `std::error::Error::source`.
    pub cause: Option<Box<FtpError>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// TCP connect / DNS failure while (re)connecting.
    Connect,
    /// Server rejected the credentials or the post-login reply.
    Login,
    /// Operation invoked while the handler is stopped.
    HandlerStopped,
    FileNotFound,
    FileStore,
    FileRetrieve,
    /// Delete of a file or directory was refused.
    FileDelete,
    /// Opening an input/output stream failed; `cause` holds the reason.
    StreamOpen,
    /// Stream used in the wrong state (e.g. closed twice).
    StreamState,
    /// Transport failure or an unexpected reply code.
    Io,
    /// Reply without a valid three digit code.
    Protocol,
    Timeout,
    /// Control connection dropped.
    Disconnected,
    InvalidConfig,
    InvalidArgument,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ─── Builders ────────────────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            path: None,
            cause: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_cause(mut self, cause: FtpError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    // ─── Per-kind shorthands ─────────────────────────────────────

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Connect, message)
    }

    pub fn login(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Login, message)
    }

    pub fn handler_stopped() -> Self {
        Self::new(FtpErrorKind::HandlerStopped, "FTP handler is not started")
    }

    pub fn file_not_found(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::FileNotFound, format!("remote file {} does not exist", path)).with_path(path)
    }

    pub fn file_store(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::FileStore, format!("failed to store {}", path)).with_path(path)
    }

    pub fn file_retrieve(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::FileRetrieve, format!("failed to retrieve {}", path)).with_path(path)
    }

    pub fn file_delete(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::FileDelete, format!("failed to delete {}", path)).with_path(path)
    }

    pub fn stream_open(path: impl Into<String>, cause: FtpError) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::StreamOpen, format!("failed to open stream on {}", path))
            .with_path(path)
            .with_cause(cause)
    }

    pub fn stream_state(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::StreamState, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Io, message)
    }

    /// The server answered with a reply class the caller did not expect.
    pub fn unexpected_reply(code: u16) -> Self {
        Self::io_error(format!("FTP server returned unexpected reply code {}", code)).with_code(code)
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Protocol, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidArgument, message)
    }

    /// Map a negative reply to an error kind. 450/550 texts that mention a
    /// missing file become `FileNotFound`.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::Disconnected,
            430 | 530 => FtpErrorKind::Login,
            450 | 550 => {
                let lower = text.to_lowercase();
                if lower.contains("not found") || lower.contains("no such") {
                    FtpErrorKind::FileNotFound
                } else {
                    FtpErrorKind::Io
                }
            }
            _ => FtpErrorKind::Io,
        };
        Self::new(kind, text).with_code(code)
    }

    /// Whether this failure came from the transport rather than from the
    /// handler's own classification.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::Io | FtpErrorKind::Protocol | FtpErrorKind::Timeout | FtpErrorKind::Disconnected
        )
    }

    /// Attach the operation's path. Transport failures are folded into a
    /// single `Io` error that keeps the original as its cause.
    pub(crate) fn at(self, path: &str) -> Self {
        let mut err = if self.is_transport() && self.kind != FtpErrorKind::Io {
            let code = self.code;
            let mut wrapped = FtpError::io_error(format!("I/O failure on {}: {}", path, self.message));
            wrapped.code = code;
            wrapped.with_cause(self)
        } else {
            self
        };
        if err.path.is_none() {
            err.path = Some(path.to_string());
        }
        err
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)?,
            None => write!(f, "[FTP {:?}] {}", self.kind, self.message)?,
        }
        if let Some(ref path) = self.path {
            if !self.message.contains(path.as_str()) {
                write!(f, " ({})", path)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for FtpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::disconnected(e.to_string()),
            _ => Self::io_error(e.to_string()),
        }
    }
}

impl From<FtpError> for std::io::Error {
    fn from(e: FtpError) -> Self {
        let kind = match e.kind {
            FtpErrorKind::Timeout => std::io::ErrorKind::TimedOut,
            FtpErrorKind::Disconnected => std::io::ErrorKind::ConnectionAborted,
            FtpErrorKind::FileNotFound => std::io::ErrorKind::NotFound,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.to_string()
    }
}
