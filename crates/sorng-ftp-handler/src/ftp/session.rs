//! Connection session: the single client behind the gate.
//!
//! Owns the physical connection and the logical `started` flag. A dropped
//! connection is never fatal by itself; the next operation (or keepalive
//! tick) notices it and reconnects once.

use crate::ftp::client::{ClientFactory, TransferClient};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::keepalive::KeepaliveHandle;
use crate::ftp::types::{is_positive_completion, is_positive_preliminary, FtpConfig};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lock-free view of the session, readable without taking the gate.
#[derive(Debug, Default)]
pub(crate) struct SessionFlags {
    started: AtomicBool,
    streaming: AtomicBool,
}

impl SessionFlags {
    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }
}

pub(crate) struct Session {
    config: Arc<FtpConfig>,
    factory: ClientFactory,
    client: Option<Box<dyn TransferClient>>,
    started: bool,
    /// Set when a stream was dropped mid-transfer: the control channel
    /// still has a reply pending and must be rebuilt before reuse.
    needs_reset: bool,
    keepalive: Option<KeepaliveHandle>,
    flags: Arc<SessionFlags>,
}

impl Session {
    pub(crate) fn new(config: Arc<FtpConfig>, factory: ClientFactory, flags: Arc<SessionFlags>) -> Self {
        Self {
            config,
            factory,
            client: None,
            started: false,
            needs_reset: false,
            keepalive: None,
            flags,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn make_sure_started(&self) -> FtpResult<()> {
        if self.started && self.client.is_some() {
            Ok(())
        } else {
            Err(FtpError::handler_stopped())
        }
    }

    pub(crate) fn client_mut(&mut self) -> FtpResult<&mut (dyn TransferClient + 'static)> {
        match self.client.as_deref_mut() {
            Some(client) => Ok(client),
            None => Err(FtpError::handler_stopped()),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Build a fresh client and try to connect. A failed first connect is
    /// logged and left to the lazy reconnect of the first operation.
    pub(crate) async fn open(&mut self) {
        info!("FTP handler starting for {}:{}", self.config.host, self.config.port);
        self.client = Some((self.factory)(&self.config));
        if let Err(e) = self.connect_and_login().await {
            warn!("FTP connect on start failed, will reconnect on demand: {}", e);
        }
        self.started = true;
        self.flags.started.store(true, Ordering::Release);
    }

    pub(crate) fn attach_keepalive(&mut self, handle: KeepaliveHandle) {
        if let Some(old) = self.keepalive.replace(handle) {
            old.cancel();
        }
    }

    /// Cancel keepalive, log out best-effort, release the client.
    pub(crate) async fn close(&mut self) {
        info!("FTP handler stopping for {}:{}", self.config.host, self.config.port);
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.cancel();
        }
        if let Some(mut client) = self.client.take() {
            if client.is_connected() {
                match client.logout().await {
                    Ok(true) => {}
                    Ok(false) => error!("FTP logout refused with reply {}", client.reply_code()),
                    Err(e) => error!("FTP logout failed: {}", e),
                }
            }
            client.disconnect().await;
        }
        self.needs_reset = false;
        self.started = false;
        self.flags.started.store(false, Ordering::Release);
        self.flags.streaming.store(false, Ordering::Release);
    }

    // ─── Health ──────────────────────────────────────────────────

    /// Make sure the connection is usable before an operation: NOOP, and
    /// on failure reconnect once. A failed reconnect is returned as is.
    pub(crate) async fn ensure_status(&mut self) -> FtpResult<()> {
        if self.needs_reset {
            warn!("FTP control channel left mid-transfer by an unclosed stream, reconnecting");
            self.needs_reset = false;
            return self.reconnect().await;
        }
        let client = self.client_mut()?;
        if client.is_connected() {
            match client.noop().await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("FTP NOOP failed: {}", e),
            }
        }
        warn!("FTP connection to {}:{} lost, reconnecting", self.config.host, self.config.port);
        self.reconnect().await
    }

    async fn reconnect(&mut self) -> FtpResult<()> {
        self.connect_and_login().await.map_err(|e| {
            warn!("FTP reconnect failed: {}", e);
            e
        })
    }

    /// One keepalive round: NOOP, then a single inline reconnect attempt.
    /// Failures are logged and swallowed.
    pub(crate) async fn keepalive_tick(&mut self) {
        if !self.started {
            return;
        }
        if self.needs_reset {
            if let Err(e) = self.reconnect().await {
                warn!("FTP keepalive reconnect failed: {}", e);
            }
            return;
        }
        let healthy = match self.client.as_deref_mut() {
            Some(client) if client.is_connected() => match client.noop().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("FTP keepalive NOOP failed: {}", e);
                    false
                }
            },
            Some(_) => false,
            None => return,
        };
        if healthy {
            debug!("FTP keepalive NOOP ok");
            return;
        }
        if let Err(e) = self.connect_and_login().await {
            warn!("FTP keepalive reconnect failed: {}", e);
        }
    }

    /// Disconnect a stale connection, connect, log in, switch to binary.
    pub(crate) async fn connect_and_login(&mut self) -> FtpResult<()> {
        let config = Arc::clone(&self.config);
        let client = self.client_mut()?;
        if client.is_connected() {
            client.disconnect().await;
        }

        client
            .connect(&config.host, config.port, config.connect_timeout())
            .await
            .map_err(|e| {
                FtpError::connect(format!("cannot connect to {}:{}", config.host, config.port)).with_cause(e)
            })?;

        let refused = match client.login(&config.username, &config.password).await {
            Ok(true) => None,
            Ok(false) => Some(FtpError::login(format!("login as '{}' refused", config.username))),
            Err(e) => Some(FtpError::login(format!("login as '{}' failed", config.username)).with_cause(e)),
        };
        if let Some(err) = refused {
            let code = client.reply_code();
            client.disconnect().await;
            return Err(err.with_code(code));
        }

        let binary = client.set_binary_mode().await;
        let code = client.reply_code();
        if !matches!(binary, Ok(true)) || !is_positive_completion(code) {
            client.disconnect().await;
            let err = FtpError::login(format!("server rejected session setup with reply {}", code)).with_code(code);
            return Err(match binary {
                Err(cause) => err.with_cause(cause),
                Ok(_) => err,
            });
        }

        self.needs_reset = false;
        info!("FTP connected to {}:{} as {}", config.host, config.port, config.username);
        Ok(())
    }

    /// Best-effort logout and disconnect after a transfer went wrong.
    pub(crate) async fn force_disconnect(&mut self) {
        let Some(client) = self.client.as_deref_mut() else {
            return;
        };
        if client.is_connected() {
            if let Err(e) = client.logout().await {
                debug!("FTP logout during forced disconnect failed: {}", e);
            }
        }
        client.disconnect().await;
        warn!("FTP connection to {}:{} force-closed", self.config.host, self.config.port);
    }

    // ─── Reply checks ────────────────────────────────────────────

    pub(crate) fn check_positive_preliminary(&self) -> FtpResult<()> {
        match self.client.as_deref() {
            Some(client) => require_preliminary(client),
            None => Err(FtpError::handler_stopped()),
        }
    }

    // ─── Streaming ───────────────────────────────────────────────

    pub(crate) fn begin_streaming(&mut self) {
        self.flags.streaming.store(true, Ordering::Release);
    }

    pub(crate) fn end_streaming(&mut self) {
        self.flags.streaming.store(false, Ordering::Release);
    }

    /// A stream went away without completing its transfer.
    pub(crate) fn abandon_transfer(&mut self) {
        self.needs_reset = true;
        self.end_streaming();
    }

    /// Read the final reply of the transfer a stream carried. Any failure
    /// tears the connection down so the next operation starts clean.
    pub(crate) async fn complete_transfer(&mut self, path: &str) -> FtpResult<()> {
        let client = self.client_mut()?;
        let failure = match client.complete_pending_command().await {
            Ok(true) => return Ok(()),
            Ok(false) => FtpError::unexpected_reply(client.reply_code()).with_path(path),
            Err(e) => FtpError::io_error(format!("failed to complete transfer of {}", path))
                .with_path(path)
                .with_cause(e),
        };
        self.force_disconnect().await;
        Err(failure)
    }
}

pub(crate) fn require_completion(client: &dyn TransferClient) -> FtpResult<()> {
    let code = client.reply_code();
    if is_positive_completion(code) {
        Ok(())
    } else {
        Err(FtpError::unexpected_reply(code))
    }
}

pub(crate) fn require_preliminary(client: &dyn TransferClient) -> FtpResult<()> {
    let code = client.reply_code();
    if is_positive_preliminary(code) {
        Ok(())
    } else {
        Err(FtpError::unexpected_reply(code))
    }
}
