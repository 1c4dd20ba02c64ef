//! Shared types for the FTP handler crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ─── Configuration ───────────────────────────────────────────────────

/// How the data connection of a transfer is established.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DataConnectionMode {
    /// `PORT` with a listener bound to the control socket's local address.
    ActiveLocal,
    /// `PORT` advertising `activeRemoteHost:activeRemotePort`.
    ActiveRemote,
    /// `PASV`, connecting to the address the server returns.
    PassiveLocal,
    /// `PASV`, connecting to the control host on the returned port.
    /// Works around servers behind NAT that advertise a private address.
    PassiveRemote,
}

impl Default for DataConnectionMode {
    fn default() -> Self {
        Self::PassiveLocal
    }
}

/// Configuration of one [`FtpHandler`](crate::ftp::FtpHandler).
///
/// Validated once by [`FtpConfig::validate`] and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Encoding of the control channel ("UTF-8", "ISO-8859-1", "US-ASCII").
    #[serde(default = "default_charset")]
    pub server_charset: String,
    /// Connect timeout in milliseconds. Must exceed one second.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Keepalive period in milliseconds. Must be below the connect timeout.
    #[serde(default = "default_noop_interval")]
    pub noop_interval_ms: u64,
    /// Chunk size for data-channel copies (0 = 64 KiB).
    #[serde(default)]
    pub buffer_size: usize,
    /// Where copy operations spill their staging file.
    #[serde(default = "default_temp_dir")]
    pub temporary_file_directory: PathBuf,
    #[serde(default = "default_temp_prefix")]
    pub temporary_file_prefix: String,
    #[serde(default = "default_temp_suffix")]
    pub temporary_file_suffix: String,
    /// Bytes a copy keeps in memory before spilling to disk.
    #[serde(default = "default_copy_memory")]
    pub file_copy_memory_buffer_size: usize,
    #[serde(default)]
    pub data_connection_mode: DataConnectionMode,
    /// Data-channel timeout in milliseconds (0 = wait forever).
    #[serde(default)]
    pub data_timeout_ms: u64,
    /// Advertised host for [`DataConnectionMode::ActiveRemote`].
    #[serde(default)]
    pub active_remote_host: Option<String>,
    /// Advertised (and bound) port for [`DataConnectionMode::ActiveRemote`].
    #[serde(default)]
    pub active_remote_port: Option<u16>,
}

pub(crate) const DEFAULT_BUFFER_SIZE: usize = 65_536;

fn default_port() -> u16 {
    21
}
fn default_charset() -> String {
    "UTF-8".into()
}
fn default_connect_timeout() -> u64 {
    5_000
}
fn default_noop_interval() -> u64 {
    4_000
}
fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}
fn default_temp_prefix() -> String {
    "sorng-ftp-copy-".into()
}
fn default_temp_suffix() -> String {
    ".tmp".into()
}
fn default_copy_memory() -> usize {
    1_048_576
}

impl FtpConfig {
    /// Configuration for `host` with every optional field at its default.
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: password.into(),
            server_charset: default_charset(),
            connect_timeout_ms: default_connect_timeout(),
            noop_interval_ms: default_noop_interval(),
            buffer_size: 0,
            temporary_file_directory: default_temp_dir(),
            temporary_file_prefix: default_temp_prefix(),
            temporary_file_suffix: default_temp_suffix(),
            file_copy_memory_buffer_size: default_copy_memory(),
            data_connection_mode: DataConnectionMode::default(),
            data_timeout_ms: 0,
            active_remote_host: None,
            active_remote_port: None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn noop_interval(&self) -> Duration {
        Duration::from_millis(self.noop_interval_ms)
    }

    pub fn data_timeout(&self) -> Option<Duration> {
        match self.data_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Effective chunk size for data-channel copies.
    pub fn effective_buffer_size(&self) -> usize {
        match self.buffer_size {
            0 => DEFAULT_BUFFER_SIZE,
            n => n,
        }
    }
}

// ─── Control channel charset ─────────────────────────────────────────

/// Encoding used for commands, replies and listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCharset {
    Utf8,
    Latin1,
    Ascii,
}

impl ServerCharset {
    /// Resolve a charset label, case-insensitively.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "UTF-8" | "UTF8" => Some(Self::Utf8),
            "ISO-8859-1" | "ISO8859-1" | "LATIN1" | "LATIN-1" => Some(Self::Latin1),
            "US-ASCII" | "ASCII" => Some(Self::Ascii),
            _ => None,
        }
    }

    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Latin1 => text
                .chars()
                .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
                .collect(),
            Self::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Self::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
                .collect(),
        }
    }
}

// ─── Addressing ──────────────────────────────────────────────────────

const ROOT_PATH: &str = "/";
const PATH_SEPARATOR: char = '/';

/// A remote location: directory segments from the root plus an optional
/// leaf name. Without a name the location denotes the directory itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLocation {
    pub paths: Vec<String>,
    pub name: Option<String>,
}

impl FileLocation {
    pub fn file<I, S>(paths: I, name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            name: Some(name.into()),
        }
    }

    pub fn directory<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            name: None,
        }
    }

    /// The location with the leaf name dropped.
    pub fn parent(&self) -> FileLocation {
        Self {
            paths: self.paths.clone(),
            name: None,
        }
    }

    /// `/seg1/seg2/name`; directory locations end with `/`.
    pub fn absolute_path(&self) -> String {
        render_path(&self.paths, self.name.as_deref())
    }
}

impl std::fmt::Display for FileLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.absolute_path())
    }
}

pub(crate) fn render_path<S: AsRef<str>>(paths: &[S], name: Option<&str>) -> String {
    let mut out = String::from(ROOT_PATH);
    for segment in paths {
        out.push_str(segment.as_ref());
        out.push(PATH_SEPARATOR);
    }
    if let Some(name) = name {
        out.push_str(name);
    }
    out
}

// ─── Listing ─────────────────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpFileKind {
    File,
    Directory,
    SymbolicLink,
    Unknown,
}

/// One entry from a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpFile {
    pub name: String,
    pub kind: FtpFileKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl FtpFile {
    pub fn new(name: impl Into<String>, kind: FtpFileKind, size: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
            modified: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FtpFileKind::Directory
    }
}

// ─── FTP Response ────────────────────────────────────────────────────

/// A single FTP response (may be multi-line).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpResponse {
    /// Full response text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn is_preliminary(&self) -> bool {
        is_positive_preliminary(self.code)
    }

    pub fn is_completion(&self) -> bool {
        is_positive_completion(self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

/// 1xx reply.
pub fn is_positive_preliminary(code: u16) -> bool {
    (100..200).contains(&code)
}

/// 2xx reply.
pub fn is_positive_completion(code: u16) -> bool {
    (200..300).contains(&code)
}

// ─── Handler state ───────────────────────────────────────────────────

/// Observable lifecycle state of a handler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Stopped,
    StartedIdle,
    /// An operation currently holds the gate.
    StartedBusy,
    /// A stream returned by `open_input_stream` / `open_output_stream`
    /// holds the gate until it is closed.
    StartedStreaming,
}
