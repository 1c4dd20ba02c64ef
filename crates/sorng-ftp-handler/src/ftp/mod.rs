//! # sorng-ftp-handler: single-connection FTP session handler
//!
//! One logical FTP session shared by any number of callers. Operations run
//! one at a time behind a single gate, and an open stream keeps the gate
//! until it is closed. A lost connection is rebuilt lazily by whichever
//! operation or keepalive tick touches it next.
//!
//! Modules:
//! - `types`: config, addressing, listing entries, reply classes
//! - `error`: categorised error carrying reply code and path
//! - `config`: validation, JSON and URL loading
//! - `protocol`: control-channel command/response codec
//! - `connection`: TCP connect with timeout and banner
//! - `transfer`: data channel setup (PASV / PORT, local and remote)
//! - `parser`: listing decoder for ls, DOS and MLSD style lines
//! - `client`: `TransferClient` seam and its TCP implementation
//! - `navigator`: working-directory positioning with auto-mkdir
//! - `session`: connection health, reconnect, lifecycle
//! - `keepalive`: periodic NOOP task
//! - `buffer`: memory-then-disk staging for copies
//! - `stream`: gate-holding input/output streams
//! - `clear`: iterative recursive delete
//! - `handler`: public façade (`FtpHandler`)

pub mod types;
pub mod error;
pub mod config;
pub mod protocol;
pub mod connection;
pub mod transfer;
pub mod parser;
pub mod client;
pub mod navigator;
pub mod buffer;
pub mod stream;
pub(crate) mod session;
pub mod keepalive;
pub mod clear;
pub mod handler;

pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use client::{default_client_factory, BoxedReader, BoxedWriter, ClientFactory, FtpClient, TransferClient};
pub use buffer::{HybridBuffer, SpillTarget};
pub use stream::{FtpInputStream, FtpOutputStream, StreamState};
pub use clear::ClearStats;
pub use handler::FtpHandler;
