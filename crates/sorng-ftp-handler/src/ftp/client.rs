//! FTP client seam and its TCP implementation.
//!
//! [`TransferClient`] is the narrow, reply-code oriented surface the
//! session layer drives: every command records the server's last reply
//! code and reports plain success as `bool`, while transport failures
//! surface as errors. [`FtpClient`] implements it over tokio TCP.

use crate::ftp::connection::{self, ControlConnection};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser;
use crate::ftp::transfer::{self, DataChannelSettings};
use crate::ftp::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Builds a fresh, unconnected client each time the handler starts.
pub type ClientFactory = Arc<dyn Fn(&FtpConfig) -> Box<dyn TransferClient> + Send + Sync>;

/// Command surface of one FTP control connection.
///
/// Methods returning `bool` report whether the server accepted the
/// command; `reply_code()` then holds the code it answered with.
#[async_trait]
pub trait TransferClient: Send {
    async fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> FtpResult<()>;
    async fn login(&mut self, username: &str, password: &str) -> FtpResult<bool>;
    async fn set_binary_mode(&mut self) -> FtpResult<bool>;
    async fn change_working_directory(&mut self, path: &str) -> FtpResult<bool>;
    async fn make_directory(&mut self, name: &str) -> FtpResult<bool>;
    /// LIST the current directory, or `path` relative to it. A refused
    /// listing yields an empty vector with the refusal in `reply_code()`.
    async fn list(&mut self, path: Option<&str>) -> FtpResult<Vec<FtpFile>>;
    async fn store(&mut self, name: &str, source: &mut (dyn AsyncRead + Send + Unpin)) -> FtpResult<bool>;
    async fn retrieve(&mut self, name: &str, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> FtpResult<bool>;
    /// Start a STOR and hand back the data channel; the final reply is
    /// left pending for [`TransferClient::complete_pending_command`].
    async fn open_store_stream(&mut self, name: &str) -> FtpResult<Option<BoxedWriter>>;
    /// Start a RETR; see [`TransferClient::open_store_stream`].
    async fn open_retrieve_stream(&mut self, name: &str) -> FtpResult<Option<BoxedReader>>;
    async fn delete(&mut self, name: &str) -> FtpResult<bool>;
    async fn remove_directory(&mut self, name: &str) -> FtpResult<bool>;
    async fn rename(&mut self, from: &str, to: &str) -> FtpResult<bool>;
    /// NOOP; any failure, including a non-2xx reply, is an error.
    async fn noop(&mut self) -> FtpResult<()>;
    /// Read the final reply of a transfer started by an `open_*_stream` call.
    async fn complete_pending_command(&mut self) -> FtpResult<bool>;
    fn reply_code(&self) -> u16;
    async fn logout(&mut self) -> FtpResult<bool>;
    async fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
}

/// Factory producing [`FtpClient`]s.
pub fn default_client_factory() -> ClientFactory {
    Arc::new(|config: &FtpConfig| Box::new(FtpClient::new(config)) as Box<dyn TransferClient>)
}

/// TCP implementation of [`TransferClient`].
pub struct FtpClient {
    config: FtpConfig,
    charset: ServerCharset,
    control: Option<ControlConnection>,
    reply_code: u16,
}

impl FtpClient {
    pub fn new(config: &FtpConfig) -> Self {
        Self {
            charset: ServerCharset::from_label(&config.server_charset).unwrap_or(ServerCharset::Utf8),
            config: config.clone(),
            control: None,
            reply_code: 0,
        }
    }

    /// Banner of the current connection, if any.
    pub fn banner(&self) -> Option<String> {
        self.control.as_ref().map(|c| c.banner.text())
    }

    // ─── Control channel ─────────────────────────────────────────

    async fn command(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        let result = match self.control.as_mut() {
            Some(control) => control.codec.execute(cmd).await,
            None => return Err(not_connected()),
        };
        self.record(result)
    }

    async fn read_reply(&mut self) -> FtpResult<FtpResponse> {
        let result = match self.control.as_mut() {
            Some(control) => control.codec.read_response().await,
            None => return Err(not_connected()),
        };
        self.record(result)
    }

    /// Track the reply code; a broken control channel is dropped so the
    /// session sees `is_connected() == false` and reconnects.
    fn record(&mut self, result: FtpResult<FtpResponse>) -> FtpResult<FtpResponse> {
        match result {
            Ok(resp) => {
                self.reply_code = resp.code;
                if resp.code == 421 {
                    log::warn!("FTP server closed the control connection: {}", resp.text());
                    self.control = None;
                }
                Ok(resp)
            }
            Err(e) => {
                self.absorb(&e);
                Err(e)
            }
        }
    }

    fn absorb(&mut self, e: &FtpError) {
        match e.code {
            Some(code) => self.reply_code = code,
            None => {
                log::debug!("dropping FTP control connection after: {}", e);
                self.control = None;
            }
        }
    }

    async fn simple(&mut self, cmd: &str) -> FtpResult<bool> {
        Ok(self.command(cmd).await?.is_completion())
    }

    // ─── Data channel ────────────────────────────────────────────

    fn data_settings(&self) -> FtpResult<DataChannelSettings> {
        let control = self.control.as_ref().ok_or_else(not_connected)?;
        Ok(DataChannelSettings {
            mode: self.config.data_connection_mode,
            control_peer: control.peer_addr.ip(),
            control_local: control.local_addr.ip(),
            active_remote_host: self.config.active_remote_host.clone(),
            active_remote_port: self.config.active_remote_port,
            timeout: self.config.data_timeout(),
        })
    }

    /// Negotiate a data channel and issue `cmd`. `None` means the server
    /// refused the transfer; its reply code is recorded.
    async fn open_transfer(&mut self, cmd: &str) -> FtpResult<Option<TcpStream>> {
        let settings = self.data_settings()?;
        let prepared = match self.control.as_mut() {
            Some(control) => transfer::prepare_data_channel(&mut control.codec, &settings).await,
            None => return Err(not_connected()),
        };
        let pending = match prepared {
            Ok(p) => p,
            Err(e) => {
                self.absorb(&e);
                return match e.code {
                    Some(_) => Ok(None),
                    None => Err(e),
                };
            }
        };

        let resp = self.command(cmd).await?;
        if !resp.is_preliminary() {
            return Ok(None);
        }

        match pending.establish(settings.timeout).await {
            Ok(tcp) => Ok(Some(tcp)),
            Err(e) => {
                // The server is mid-transfer; the control channel is out of step.
                self.control = None;
                Err(e)
            }
        }
    }

    async fn finish_transfer(&mut self, copied: std::io::Result<u64>) -> FtpResult<bool> {
        let done = self.read_reply().await;
        let bytes = copied?;
        let done = done?;
        log::trace!("transfer finished after {} bytes with {}", bytes, done.code);
        Ok(done.is_completion())
    }
}

#[async_trait]
impl TransferClient for FtpClient {
    async fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> FtpResult<()> {
        self.control = None;
        let control = connection::connect(host, port, timeout, self.charset).await?;
        self.reply_code = control.banner.code;
        log::debug!("FTP banner from {}:{}: {}", host, port, control.banner.text());
        self.control = Some(control);
        Ok(())
    }

    async fn login(&mut self, username: &str, password: &str) -> FtpResult<bool> {
        let user = self.command(&format!("USER {}", username)).await?;
        let accepted = if user.is_intermediate() {
            self.command(&format!("PASS {}", password)).await?.is_completion()
        } else {
            user.is_completion()
        };
        if accepted && self.charset == ServerCharset::Utf8 {
            let code = self.reply_code;
            let _ = self.command("OPTS UTF8 ON").await;
            self.reply_code = code;
        }
        Ok(accepted)
    }

    async fn set_binary_mode(&mut self) -> FtpResult<bool> {
        self.simple("TYPE I").await
    }

    async fn change_working_directory(&mut self, path: &str) -> FtpResult<bool> {
        self.simple(&format!("CWD {}", path)).await
    }

    async fn make_directory(&mut self, name: &str) -> FtpResult<bool> {
        self.simple(&format!("MKD {}", name)).await
    }

    async fn list(&mut self, path: Option<&str>) -> FtpResult<Vec<FtpFile>> {
        let cmd = match path {
            Some(p) => format!("LIST {}", p),
            None => "LIST".to_string(),
        };
        let Some(mut data) = self.open_transfer(&cmd).await? else {
            return Ok(Vec::new());
        };
        let mut raw = Vec::new();
        let copied = pump(&mut data, &mut raw, self.config.effective_buffer_size(), self.config.data_timeout()).await;
        drop(data);
        self.finish_transfer(copied).await?;
        Ok(parser::parse_listing(&self.charset.decode(&raw)))
    }

    async fn store(&mut self, name: &str, source: &mut (dyn AsyncRead + Send + Unpin)) -> FtpResult<bool> {
        let Some(mut data) = self.open_transfer(&format!("STOR {}", name)).await? else {
            return Ok(false);
        };
        let mut copied = pump(source, &mut data, self.config.effective_buffer_size(), self.config.data_timeout()).await;
        if let Err(e) = data.shutdown().await {
            copied = copied.and(Err(e));
        }
        drop(data);
        self.finish_transfer(copied).await
    }

    async fn retrieve(&mut self, name: &str, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> FtpResult<bool> {
        let Some(mut data) = self.open_transfer(&format!("RETR {}", name)).await? else {
            return Ok(false);
        };
        let mut copied = pump(&mut data, sink, self.config.effective_buffer_size(), self.config.data_timeout()).await;
        if let Err(e) = sink.flush().await {
            copied = copied.and(Err(e));
        }
        drop(data);
        self.finish_transfer(copied).await
    }

    async fn open_store_stream(&mut self, name: &str) -> FtpResult<Option<BoxedWriter>> {
        Ok(self
            .open_transfer(&format!("STOR {}", name))
            .await?
            .map(|tcp| Box::new(tcp) as BoxedWriter))
    }

    async fn open_retrieve_stream(&mut self, name: &str) -> FtpResult<Option<BoxedReader>> {
        Ok(self
            .open_transfer(&format!("RETR {}", name))
            .await?
            .map(|tcp| Box::new(tcp) as BoxedReader))
    }

    async fn delete(&mut self, name: &str) -> FtpResult<bool> {
        self.simple(&format!("DELE {}", name)).await
    }

    async fn remove_directory(&mut self, name: &str) -> FtpResult<bool> {
        self.simple(&format!("RMD {}", name)).await
    }

    async fn rename(&mut self, from: &str, to: &str) -> FtpResult<bool> {
        if !self.command(&format!("RNFR {}", from)).await?.is_intermediate() {
            return Ok(false);
        }
        self.simple(&format!("RNTO {}", to)).await
    }

    async fn noop(&mut self) -> FtpResult<()> {
        let resp = self.command("NOOP").await?;
        if !resp.is_completion() {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        Ok(())
    }

    async fn complete_pending_command(&mut self) -> FtpResult<bool> {
        Ok(self.read_reply().await?.is_completion())
    }

    fn reply_code(&self) -> u16 {
        self.reply_code
    }

    async fn logout(&mut self) -> FtpResult<bool> {
        self.simple("QUIT").await
    }

    async fn disconnect(&mut self) {
        if self.control.take().is_some() {
            log::debug!("FTP control connection to {}:{} closed", self.config.host, self.config.port);
        }
    }

    fn is_connected(&self) -> bool {
        self.control.is_some()
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn not_connected() -> FtpError {
    FtpError::disconnected("FTP client is not connected")
}

/// Copy `reader` into `writer` in `chunk`-sized reads, each bounded by
/// `read_timeout` when set.
pub(crate) async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk: usize,
    read_timeout: Option<Duration>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; chunk.max(1)];
    let mut total = 0u64;
    loop {
        let n = match read_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.read(&mut buf))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "data channel read timed out"))??,
            None => reader.read(&mut buf).await?,
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_copies_in_chunks() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut reader = &data[..];
        let mut out = Vec::new();
        let n = pump(&mut reader, &mut out, 7, None).await.unwrap();
        assert_eq!(n, 10_000);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_unconnected_client_reports_disconnected() {
        let mut client = FtpClient::new(&FtpConfig::new("localhost", "u", "p"));
        assert!(!client.is_connected());
        let err = client.noop().await.unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::Disconnected);
    }
}
