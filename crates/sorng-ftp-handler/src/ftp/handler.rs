//! Handler façade: the public operation surface over one shared session.
//!
//! Every operation takes the session gate, asserts the handler is
//! started, health-checks the connection (reconnecting once if needed),
//! positions the working directory and issues its primitive. Failures
//! leave the façade with the addressed absolute path attached.

use crate::ftp::buffer::HybridBuffer;
use crate::ftp::clear::{self, ClearStats};
use crate::ftp::client::{default_client_factory, BoxedReader, BoxedWriter, ClientFactory, TransferClient};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::keepalive::spawn_keepalive;
use crate::ftp::navigator;
use crate::ftp::session::{require_completion, Session, SessionFlags};
use crate::ftp::stream::{FtpInputStream, FtpOutputStream};
use crate::ftp::types::*;
use log::{debug, info};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

/// Cloneable handle to one FTP session. Clones share the connection and
/// its gate, so operations from all clones are serialised.
#[derive(Clone)]
pub struct FtpHandler {
    config: Arc<FtpConfig>,
    session: Arc<Mutex<Session>>,
    flags: Arc<SessionFlags>,
}

impl FtpHandler {
    /// Validate `config` and build a handler over real TCP connections.
    pub fn new(config: FtpConfig) -> FtpResult<Self> {
        Self::with_client_factory(config, default_client_factory())
    }

    /// Like [`FtpHandler::new`] with a custom client implementation.
    pub fn with_client_factory(config: FtpConfig, factory: ClientFactory) -> FtpResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let flags = Arc::new(SessionFlags::default());
        let session = Session::new(Arc::clone(&config), factory, Arc::clone(&flags));
        Ok(Self {
            config,
            session: Arc::new(Mutex::new(session)),
            flags,
        })
    }

    pub fn config(&self) -> &FtpConfig {
        &self.config
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Connect and schedule keepalive. Idempotent. A server that cannot
    /// be reached yet does not fail the start; the first operation
    /// retries the connection.
    pub async fn start(&self) -> FtpResult<()> {
        let mut session = self.session.lock().await;
        if session.is_started() {
            debug!("FTP handler already started");
            return Ok(());
        }
        session.open().await;
        let keepalive = spawn_keepalive(Arc::downgrade(&self.session), self.config.noop_interval());
        session.attach_keepalive(keepalive);
        Ok(())
    }

    /// Cancel keepalive, log out and disconnect. Idempotent. Waits for
    /// any open stream to be closed first.
    pub async fn stop(&self) -> FtpResult<()> {
        let mut session = self.session.lock().await;
        if !session.is_started() {
            debug!("FTP handler already stopped");
            return Ok(());
        }
        session.close().await;
        info!("FTP handler for {}:{} stopped", self.config.host, self.config.port);
        Ok(())
    }

    /// Logical state only; stays `true` across dropped connections.
    pub fn is_started(&self) -> bool {
        self.flags.is_started()
    }

    pub fn state(&self) -> SessionState {
        if !self.flags.is_started() {
            SessionState::Stopped
        } else if self.flags.is_streaming() {
            SessionState::StartedStreaming
        } else if self.session.try_lock().is_ok() {
            SessionState::StartedIdle
        } else {
            SessionState::StartedBusy
        }
    }

    async fn lock_started(&self) -> FtpResult<MutexGuard<'_, Session>> {
        let session = self.session.lock().await;
        session.make_sure_started()?;
        Ok(session)
    }

    async fn lock_owned_started(&self) -> FtpResult<OwnedMutexGuard<Session>> {
        let session = Arc::clone(&self.session).lock_owned().await;
        session.make_sure_started()?;
        Ok(session)
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub async fn exists_file(&self, location: &FileLocation) -> FtpResult<bool> {
        let name = leaf_name(location)?;
        let path = location.absolute_path();
        let mut session = self.lock_started().await.map_err(|e| e.at(&path))?;
        let result = async {
            session.ensure_status().await?;
            probe(session.client_mut()?, &location.paths, name).await
        }
        .await;
        result.map_err(|e| e.at(&path))
    }

    /// Entries of the directory `location.paths`; the name is ignored.
    pub async fn list_files(&self, location: &FileLocation) -> FtpResult<Vec<FtpFile>> {
        let path = location.parent().absolute_path();
        let mut session = self.lock_started().await.map_err(|e| e.at(&path))?;
        list_in(&mut session, &location.paths).await.map_err(|e| e.at(&path))
    }

    pub async fn list_file_names(&self, location: &FileLocation) -> FtpResult<Vec<String>> {
        let files = self.list_files(location).await?;
        Ok(files.into_iter().map(|f| f.name).collect())
    }

    /// Entries whose name matches a shell glob such as `*.csv`.
    pub async fn list_files_matching(&self, location: &FileLocation, pattern: &str) -> FtpResult<Vec<FtpFile>> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| FtpError::invalid_argument(format!("invalid file pattern '{}': {}", pattern, e)))?;
        let files = self.list_files(location).await?;
        Ok(files.into_iter().filter(|f| pattern.matches(&f.name)).collect())
    }

    /// Listing entry describing the named file.
    pub async fn desc_file(&self, location: &FileLocation) -> FtpResult<FtpFile> {
        let name = leaf_name(location)?;
        let path = location.absolute_path();
        let mut session = self.lock_started().await.map_err(|e| e.at(&path))?;
        let result = async {
            let client = position(&mut session, &location.paths).await?;
            let files = client.list(None).await?;
            let Some(file) = files.into_iter().find(|f| f.name == name) else {
                return Err(FtpError::file_not_found(path.as_str()));
            };
            require_completion(&*client)?;
            Ok(file)
        }
        .await;
        result.map_err(|e| e.at(&path))
    }

    // ─── Transfers ───────────────────────────────────────────────

    pub async fn store_file(&self, location: &FileLocation, data: &[u8]) -> FtpResult<()> {
        let mut source = data;
        self.store_file_by_stream(location, &mut source).await
    }

    /// Upload everything `source` yields, creating missing directories.
    pub async fn store_file_by_stream<R>(&self, location: &FileLocation, source: &mut R) -> FtpResult<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let name = leaf_name(location)?;
        let path = location.absolute_path();
        let mut session = self.lock_started().await.map_err(|e| e.at(&path))?;
        store_from(&mut session, &location.paths, name, &path, source)
            .await
            .map_err(|e| e.at(&path))
    }

    pub async fn retrieve_file(&self, location: &FileLocation) -> FtpResult<Vec<u8>> {
        let mut sink = Vec::new();
        self.retrieve_file_by_stream(location, &mut sink).await?;
        Ok(sink)
    }

    /// Download into `sink`. The sink is not flushed or shut down.
    pub async fn retrieve_file_by_stream<W>(&self, location: &FileLocation, sink: &mut W) -> FtpResult<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let name = leaf_name(location)?;
        let path = location.absolute_path();
        let mut session = self.lock_started().await.map_err(|e| e.at(&path))?;
        retrieve_into(&mut session, &location.paths, name, &path, sink)
            .await
            .map_err(|e| e.at(&path))
    }

    /// Open a download that keeps the session until the stream is closed.
    pub async fn open_input_stream(&self, location: &FileLocation) -> FtpResult<FtpInputStream> {
        let name = leaf_name(location)?;
        let path = location.absolute_path();
        let mut session = self.lock_owned_started().await.map_err(|e| e.at(&path))?;
        match open_retrieve(&mut session, &location.paths, name).await {
            Ok(reader) => {
                debug!("FTP input stream opened on {}", path);
                Ok(FtpInputStream::new(reader, session, path))
            }
            Err(e) => {
                drop(session);
                Err(FtpError::stream_open(path, e))
            }
        }
    }

    /// Open an upload that keeps the session until the stream is closed.
    pub async fn open_output_stream(&self, location: &FileLocation) -> FtpResult<FtpOutputStream> {
        let name = leaf_name(location)?;
        let path = location.absolute_path();
        let mut session = self.lock_owned_started().await.map_err(|e| e.at(&path))?;
        match open_store(&mut session, &location.paths, name).await {
            Ok(writer) => {
                debug!("FTP output stream opened on {}", path);
                Ok(FtpOutputStream::new(writer, session, path))
            }
            Err(e) => {
                drop(session);
                Err(FtpError::stream_open(path, e))
            }
        }
    }

    /// Server-side copy through a local staging buffer. Retrieval and
    /// store each take the gate on their own; the staging buffer is
    /// disposed whatever the outcome.
    pub async fn copy_file(&self, from: &FileLocation, to: &FileLocation) -> FtpResult<()> {
        let from_name = leaf_name(from)?;
        let to_name = leaf_name(to)?;
        let mut staging = HybridBuffer::from_config(&self.config);
        let result = self.copy_through(&mut staging, from, from_name, to, to_name).await;
        staging.dispose().await;
        result
    }

    async fn copy_through(
        &self,
        staging: &mut HybridBuffer,
        from: &FileLocation,
        from_name: &str,
        to: &FileLocation,
        to_name: &str,
    ) -> FtpResult<()> {
        let from_path = from.absolute_path();
        let to_path = to.absolute_path();
        {
            let mut session = self.lock_started().await.map_err(|e| e.at(&from_path))?;
            retrieve_into(&mut session, &from.paths, from_name, &from_path, staging)
                .await
                .map_err(|e| e.at(&from_path))?;
        }
        staging.finish_writing().await.map_err(|e| e.at(&from_path))?;
        debug!(
            "staged {} bytes of {}{}",
            staging.len(),
            from_path,
            if staging.is_spilled() { " on disk" } else { "" }
        );
        let mut session = self.lock_started().await.map_err(|e| e.at(&to_path))?;
        store_from(&mut session, &to.paths, to_name, &to_path, staging)
            .await
            .map_err(|e| e.at(&to_path))
    }

    // ─── Mutations ───────────────────────────────────────────────

    pub async fn delete_file(&self, location: &FileLocation) -> FtpResult<()> {
        let name = leaf_name(location)?;
        let path = location.absolute_path();
        let mut session = self.lock_started().await.map_err(|e| e.at(&path))?;
        let result = async {
            let client = position(&mut session, &location.paths).await?;
            delete_here(client, name, &path).await
        }
        .await;
        result.map_err(|e| e.at(&path))
    }

    /// Remove the (empty) directory `location.paths`; the name is ignored.
    pub async fn remove_directory(&self, location: &FileLocation) -> FtpResult<()> {
        let path = location.parent().absolute_path();
        let Some((last, parents)) = location.paths.split_last() else {
            return Err(FtpError::file_delete(path));
        };
        let mut session = self.lock_started().await.map_err(|e| e.at(&path))?;
        let result = async {
            let client = position(&mut session, parents).await?;
            if !client.remove_directory(last).await? {
                return Err(FtpError::file_delete(path.as_str()).with_code(client.reply_code()));
            }
            require_completion(&*client)
        }
        .await;
        result.map_err(|e| e.at(&path))
    }

    /// Rename `from` to `to`, replacing an existing `to`.
    pub async fn rename_file(&self, from: &FileLocation, to: &FileLocation) -> FtpResult<()> {
        let from_name = leaf_name(from)?;
        let to_name = leaf_name(to)?;
        let from_path = from.absolute_path();
        let to_path = to.absolute_path();
        let mut session = self.lock_started().await.map_err(|e| e.at(&from_path))?;
        let result = async {
            session.ensure_status().await?;
            let client = session.client_mut()?;
            if !probe(&mut *client, &from.paths, from_name).await? {
                return Err(FtpError::file_not_found(from_path.as_str()));
            }
            if from_path == to_path {
                return Ok(());
            }
            if probe(&mut *client, &to.paths, to_name).await? {
                debug!("replacing existing {}", to_path);
                delete_here(&mut *client, to_name, &to_path).await?;
            }
            if !client.rename(&from_path, &to_path).await? {
                return Err(FtpError::io_error(format!("failed to rename {} to {}", from_path, to_path))
                    .with_code(client.reply_code()));
            }
            require_completion(&*client)
        }
        .await;
        result.map_err(|e| e.at(&from_path))
    }

    /// Same as [`FtpHandler::rename_file`].
    pub async fn move_file(&self, from: &FileLocation, to: &FileLocation) -> FtpResult<()> {
        self.rename_file(from, to).await
    }

    /// Delete everything below the directory `location.paths`, keeping the
    /// directory itself. Holds the gate for the whole traversal.
    pub async fn clear_directory(&self, location: &FileLocation) -> FtpResult<ClearStats> {
        let path = location.parent().absolute_path();
        let mut session = self.lock_started().await.map_err(|e| e.at(&path))?;
        let result = async {
            session.ensure_status().await?;
            clear::clear_directory(session.client_mut()?, &location.paths).await
        }
        .await;
        result.map_err(|e| e.at(&path))
    }
}

// ─── Operation bodies (run with the gate held) ───────────────────────

fn leaf_name(location: &FileLocation) -> FtpResult<&str> {
    match location.name.as_deref() {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(FtpError::invalid_argument(format!(
            "{} does not name a file",
            location.absolute_path()
        ))),
    }
}

/// Health-check, then make `paths` the working directory.
async fn position<'s>(session: &'s mut Session, paths: &[String]) -> FtpResult<&'s mut (dyn TransferClient + 'static)> {
    session.ensure_status().await?;
    let client = session.client_mut()?;
    navigator::enter_directory(&mut *client, paths).await?;
    require_completion(&*client)?;
    Ok(client)
}

/// Whether `name` shows up when listed from inside `paths`. The reply
/// code is only checked once a match was found.
async fn probe(client: &mut dyn TransferClient, paths: &[String], name: &str) -> FtpResult<bool> {
    navigator::enter_directory(&mut *client, paths).await?;
    require_completion(&*client)?;
    let found = client.list(Some(name)).await?;
    if found.is_empty() {
        return Ok(false);
    }
    require_completion(&*client)?;
    Ok(true)
}

async fn delete_here(client: &mut dyn TransferClient, name: &str, path: &str) -> FtpResult<()> {
    if !client.delete(name).await? {
        return Err(FtpError::file_delete(path).with_code(client.reply_code()));
    }
    require_completion(&*client)
}

async fn list_in(session: &mut Session, paths: &[String]) -> FtpResult<Vec<FtpFile>> {
    let client = position(session, paths).await?;
    let files = client.list(None).await?;
    require_completion(&*client)?;
    Ok(files)
}

async fn store_from(
    session: &mut Session,
    paths: &[String],
    name: &str,
    path: &str,
    source: &mut (dyn AsyncRead + Send + Unpin),
) -> FtpResult<()> {
    let client = position(session, paths).await?;
    if !client.store(name, source).await? {
        return Err(FtpError::file_store(path).with_code(client.reply_code()));
    }
    require_completion(&*client)
}

async fn retrieve_into(
    session: &mut Session,
    paths: &[String],
    name: &str,
    path: &str,
    sink: &mut (dyn AsyncWrite + Send + Unpin),
) -> FtpResult<()> {
    let client = position(session, paths).await?;
    if !client.retrieve(name, sink).await? {
        return Err(FtpError::file_retrieve(path).with_code(client.reply_code()));
    }
    require_completion(&*client)
}

async fn open_retrieve(session: &mut Session, paths: &[String], name: &str) -> FtpResult<BoxedReader> {
    let client = position(session, paths).await?;
    let Some(reader) = client.open_retrieve_stream(name).await? else {
        return Err(FtpError::unexpected_reply(client.reply_code()));
    };
    if let Err(e) = session.check_positive_preliminary() {
        session.abandon_transfer();
        return Err(e);
    }
    Ok(reader)
}

async fn open_store(session: &mut Session, paths: &[String], name: &str) -> FtpResult<BoxedWriter> {
    let client = position(session, paths).await?;
    let Some(writer) = client.open_store_stream(name).await? else {
        return Err(FtpError::unexpected_reply(client.reply_code()));
    };
    if let Err(e) = session.check_positive_preliminary() {
        session.abandon_transfer();
        return Err(e);
    }
    Ok(writer)
}
