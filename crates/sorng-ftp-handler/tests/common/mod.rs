//! In-memory FTP server fake shared by the integration tests.
//!
//! `MemoryServer` owns a directory tree; every `MemoryClient` built by its
//! factory is one control connection into it. Connections can be cut or
//! refused, and command counters plus an overlap detector let tests check
//! what the handler actually sent.

#![allow(dead_code)]

use async_trait::async_trait;
use sorng_ftp_handler::*;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const USER: &str = "demo";
pub const PASSWORD: &str = "secret";
const ROOT: usize = 0;

/// How the data channel of an upload stream behaves when it is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkClose {
    Normal,
    Fail,
    /// Never completes.
    Hang,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub connects: usize,
    pub listings: usize,
    pub deletes: usize,
    pub rmdirs: usize,
    pub mkdirs: usize,
    pub cwds: usize,
    pub noops: usize,
    pub stores: usize,
    pub retrieves: usize,
    pub renames: usize,
}

enum NodeKind {
    File(Vec<u8>),
    Dir(BTreeMap<String, usize>),
}

struct Node {
    parent: usize,
    kind: NodeKind,
}

struct ServerState {
    nodes: Vec<Node>,
    /// Bumped to cut every open connection.
    generation: u64,
    down: bool,
    fail_stores: bool,
    fail_retrieves: bool,
    fail_completion: bool,
    /// Abort retrieves with 426 after this many bytes were sent.
    abort_retrieves_after: Option<usize>,
    sink_close: SinkClose,
    counters: Counters,
    active: usize,
    overlaps: usize,
}

impl ServerState {
    fn children(&self, dir: usize) -> Option<&BTreeMap<String, usize>> {
        match &self.nodes[dir].kind {
            NodeKind::Dir(children) => Some(children),
            NodeKind::File(_) => None,
        }
    }

    fn child(&self, dir: usize, name: &str) -> Option<usize> {
        self.children(dir).and_then(|c| c.get(name).copied())
    }

    fn is_dir(&self, node: usize) -> bool {
        matches!(self.nodes[node].kind, NodeKind::Dir(_))
    }

    fn add(&mut self, dir: usize, name: &str, kind: NodeKind) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node { parent: dir, kind });
        if let NodeKind::Dir(children) = &mut self.nodes[dir].kind {
            children.insert(name.to_string(), id);
        }
        id
    }

    fn unlink(&mut self, dir: usize, name: &str) -> Option<usize> {
        match &mut self.nodes[dir].kind {
            NodeKind::Dir(children) => children.remove(name),
            NodeKind::File(_) => None,
        }
    }

    /// Resolve a path: absolute from the root, otherwise from `cwd`.
    fn resolve(&self, cwd: usize, path: &str) -> Option<usize> {
        let mut node = if path.starts_with('/') { ROOT } else { cwd };
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = match part {
                "." => node,
                ".." => self.nodes[node].parent,
                name => self.child(node, name)?,
            };
        }
        Some(node)
    }

    fn split_parent(&self, cwd: usize, path: &str) -> Option<(usize, String)> {
        let trimmed = path.trim_end_matches('/');
        let (dir, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
            None => (".", trimmed),
        };
        let parent = self.resolve(cwd, dir)?;
        self.is_dir(parent).then(|| (parent, name.to_string()))
    }

    fn mkdirs(&mut self, path: &str) -> usize {
        let mut node = ROOT;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = match self.child(node, part) {
                Some(existing) => existing,
                None => self.add(node, part, NodeKind::Dir(BTreeMap::new())),
            };
        }
        node
    }

    fn entry(&self, name: &str, node: usize) -> FtpFile {
        match &self.nodes[node].kind {
            NodeKind::File(data) => FtpFile::new(name, FtpFileKind::File, data.len() as u64),
            NodeKind::Dir(_) => FtpFile::new(name, FtpFileKind::Directory, 0),
        }
    }
}

/// A scriptable in-memory FTP server.
#[derive(Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                nodes: vec![Node {
                    parent: ROOT,
                    kind: NodeKind::Dir(BTreeMap::new()),
                }],
                generation: 0,
                down: false,
                fail_stores: false,
                fail_retrieves: false,
                fail_completion: false,
                abort_retrieves_after: None,
                sink_close: SinkClose::Normal,
                counters: Counters::default(),
                active: 0,
                overlaps: 0,
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut ServerState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut *state)
    }

    pub fn factory(&self) -> ClientFactory {
        let state = Arc::clone(&self.state);
        Arc::new(move |_config: &FtpConfig| {
            Box::new(MemoryClient {
                state: Arc::clone(&state),
                connection: None,
                cwd: ROOT,
                reply: 0,
                pending: None,
            }) as Box<dyn TransferClient>
        })
    }

    // ─── Tree setup and inspection ───────────────────────────────

    pub fn mkdirs(&self, path: &str) {
        self.with(|s| {
            s.mkdirs(path);
        });
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.with(|s| {
            let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
            let parent = s.mkdirs(dir);
            s.unlink(parent, name);
            s.add(parent, name, NodeKind::File(data.to_vec()));
        });
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.with(|s| {
            let node = s.resolve(ROOT, path)?;
            match &s.nodes[node].kind {
                NodeKind::File(data) => Some(data.clone()),
                NodeKind::Dir(_) => None,
            }
        })
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.with(|s| s.resolve(ROOT, path).map(|n| s.is_dir(n)).unwrap_or(false))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.with(|s| s.resolve(ROOT, path).is_some())
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.with(|s| {
            s.resolve(ROOT, path)
                .and_then(|n| s.children(n))
                .map(|c| c.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// `depth` nested directories `d` below `path`, one file in each.
    /// Returns the number of files created.
    pub fn deep_chain(&self, path: &str, depth: usize) -> usize {
        self.with(|s| {
            let mut dir = s.mkdirs(path);
            for _ in 0..depth {
                dir = s.add(dir, "d", NodeKind::Dir(BTreeMap::new()));
                s.add(dir, "f.txt", NodeKind::File(b"x".to_vec()));
            }
        });
        depth
    }

    // ─── Failure injection ───────────────────────────────────────

    /// Refuse new connections while `down`; going down also cuts the
    /// connections that are open.
    pub fn set_down(&self, down: bool) {
        self.with(|s| {
            s.down = down;
            if down {
                s.generation += 1;
            }
        });
    }

    /// Cut every open connection; new ones are accepted.
    pub fn drop_connections(&self) {
        self.with(|s| s.generation += 1);
    }

    pub fn set_fail_stores(&self, fail: bool) {
        self.with(|s| s.fail_stores = fail);
    }

    pub fn set_fail_retrieves(&self, fail: bool) {
        self.with(|s| s.fail_retrieves = fail);
    }

    pub fn set_fail_completion(&self, fail: bool) {
        self.with(|s| s.fail_completion = fail);
    }

    pub fn set_abort_retrieves_after(&self, bytes: Option<usize>) {
        self.with(|s| s.abort_retrieves_after = bytes);
    }

    /// Applies to upload streams opened after the call.
    pub fn set_sink_close(&self, close: SinkClose) {
        self.with(|s| s.sink_close = close);
    }

    // ─── Observation ─────────────────────────────────────────────

    pub fn counters(&self) -> Counters {
        self.with(|s| s.counters.clone())
    }

    pub fn reset_counters(&self) {
        self.with(|s| s.counters = Counters::default());
    }

    /// Commands that started while another command or transfer was in
    /// flight on the server.
    pub fn overlaps(&self) -> usize {
        self.with(|s| s.overlaps)
    }
}

/// Handler config pointing at the fake, with copy staging under `temp`.
pub fn config(temp: &Path) -> FtpConfig {
    let mut config = FtpConfig::new("ftp.test", USER, PASSWORD);
    config.temporary_file_directory = temp.to_path_buf();
    config.connect_timeout_ms = 2_000;
    config.noop_interval_ms = 1_000;
    config
}

pub async fn started_handler(server: &MemoryServer, temp: &Path) -> FtpHandler {
    started_handler_with(server, config(temp)).await
}

pub async fn started_handler_with(server: &MemoryServer, config: FtpConfig) -> FtpHandler {
    let handler = FtpHandler::with_client_factory(config, server.factory()).unwrap();
    handler.start().await.unwrap();
    handler
}

pub fn loc(paths: &[&str], name: &str) -> FileLocation {
    FileLocation::file(paths.iter().copied(), name)
}

pub fn dir(paths: &[&str]) -> FileLocation {
    FileLocation::directory(paths.iter().copied())
}

pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 31 % 251) as u8).collect()
}

// ─── Client side ─────────────────────────────────────────────────────

enum Pending {
    Store {
        dir: usize,
        name: String,
        data: Arc<Mutex<Vec<u8>>>,
    },
    Retrieve,
}

pub struct MemoryClient {
    state: Arc<Mutex<ServerState>>,
    /// Generation the connection was opened in.
    connection: Option<u64>,
    cwd: usize,
    reply: u16,
    pending: Option<Pending>,
}

/// Marks a command as in flight on the server for its whole duration.
struct InFlight {
    state: Arc<Mutex<ServerState>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.lock().unwrap().active -= 1;
    }
}

impl MemoryClient {
    /// Start a command: check the connection is still alive and record
    /// any overlap with another in-flight command or open transfer.
    async fn begin(&mut self) -> FtpResult<InFlight> {
        {
            let mut s = self.state.lock().unwrap();
            if self.connection != Some(s.generation) {
                self.connection = None;
                self.pending = None;
                return Err(FtpError::disconnected("connection reset by peer"));
            }
            if s.active > 0 || self.pending.is_some() {
                s.overlaps += 1;
            }
            s.active += 1;
        }
        let guard = InFlight {
            state: Arc::clone(&self.state),
        };
        tokio::task::yield_now().await;
        Ok(guard)
    }

    fn reply(&mut self, code: u16, ok: bool) -> FtpResult<bool> {
        self.reply = code;
        Ok(ok)
    }
}

#[async_trait]
impl TransferClient for MemoryClient {
    async fn connect(&mut self, _host: &str, _port: u16, _timeout: Duration) -> FtpResult<()> {
        let mut s = self.state.lock().unwrap();
        if s.down {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused").into());
        }
        s.counters.connects += 1;
        self.connection = Some(s.generation);
        self.cwd = ROOT;
        self.pending = None;
        self.reply = 220;
        Ok(())
    }

    async fn login(&mut self, username: &str, password: &str) -> FtpResult<bool> {
        let _op = self.begin().await?;
        let accepted = username == USER && password == PASSWORD;
        self.reply(if accepted { 230 } else { 530 }, accepted)
    }

    async fn set_binary_mode(&mut self) -> FtpResult<bool> {
        let _op = self.begin().await?;
        self.reply(200, true)
    }

    async fn change_working_directory(&mut self, path: &str) -> FtpResult<bool> {
        let _op = self.begin().await?;
        let target = {
            let mut s = self.state.lock().unwrap();
            s.counters.cwds += 1;
            s.resolve(self.cwd, path).filter(|n| s.is_dir(*n))
        };
        match target {
            Some(node) => {
                self.cwd = node;
                self.reply(250, true)
            }
            None => self.reply(550, false),
        }
    }

    async fn make_directory(&mut self, name: &str) -> FtpResult<bool> {
        let _op = self.begin().await?;
        let created = {
            let mut s = self.state.lock().unwrap();
            s.counters.mkdirs += 1;
            match s.split_parent(self.cwd, name) {
                Some((parent, leaf)) if s.child(parent, &leaf).is_none() => {
                    s.add(parent, &leaf, NodeKind::Dir(BTreeMap::new()));
                    true
                }
                _ => false,
            }
        };
        self.reply(if created { 257 } else { 550 }, created)
    }

    async fn list(&mut self, path: Option<&str>) -> FtpResult<Vec<FtpFile>> {
        let _op = self.begin().await?;
        let (code, files) = {
            let mut s = self.state.lock().unwrap();
            s.counters.listings += 1;
            let node = match path {
                Some(p) => s.resolve(self.cwd, p),
                None => Some(self.cwd),
            };
            match node {
                Some(n) => match s.children(n) {
                    Some(children) => (226, children.iter().map(|(name, id)| s.entry(name, *id)).collect()),
                    None => {
                        let name = path.unwrap_or_default().rsplit('/').next().unwrap_or_default();
                        (226, vec![s.entry(name, n)])
                    }
                },
                None => (450, Vec::new()),
            }
        };
        self.reply = code;
        Ok(files)
    }

    async fn store(&mut self, name: &str, source: &mut (dyn AsyncRead + Send + Unpin)) -> FtpResult<bool> {
        let _op = self.begin().await?;
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        let mut s = self.state.lock().unwrap();
        s.counters.stores += 1;
        if s.fail_stores {
            drop(s);
            return self.reply(552, false);
        }
        let cwd = self.cwd;
        s.unlink(cwd, name);
        s.add(cwd, name, NodeKind::File(data));
        drop(s);
        self.reply(226, true)
    }

    async fn retrieve(&mut self, name: &str, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> FtpResult<bool> {
        let _op = self.begin().await?;
        let (data, abort_after) = {
            let mut s = self.state.lock().unwrap();
            s.counters.retrieves += 1;
            let data = if s.fail_retrieves {
                None
            } else {
                s.child(self.cwd, name).and_then(|n| match &s.nodes[n].kind {
                    NodeKind::File(data) => Some(data.clone()),
                    NodeKind::Dir(_) => None,
                })
            };
            (data, s.abort_retrieves_after)
        };
        let Some(data) = data else {
            return self.reply(550, false);
        };
        let sent = abort_after.map_or(data.len(), |limit| limit.min(data.len()));
        // Deliver in a few pieces, like a data channel would.
        for chunk in data[..sent].chunks(4096) {
            sink.write_all(chunk).await?;
        }
        sink.flush().await?;
        if abort_after.is_some() {
            return self.reply(426, false);
        }
        self.reply(226, true)
    }

    async fn open_store_stream(&mut self, name: &str) -> FtpResult<Option<BoxedWriter>> {
        let _op = self.begin().await?;
        let data = Arc::new(Mutex::new(Vec::new()));
        let close = self.state.lock().unwrap().sink_close;
        self.pending = Some(Pending::Store {
            dir: self.cwd,
            name: name.to_string(),
            data: Arc::clone(&data),
        });
        self.reply = 150;
        Ok(Some(Box::new(SharedSink { data, close }) as BoxedWriter))
    }

    async fn open_retrieve_stream(&mut self, name: &str) -> FtpResult<Option<BoxedReader>> {
        let _op = self.begin().await?;
        let data = {
            let mut s = self.state.lock().unwrap();
            s.counters.retrieves += 1;
            s.child(self.cwd, name).and_then(|n| match &s.nodes[n].kind {
                NodeKind::File(data) => Some(data.clone()),
                NodeKind::Dir(_) => None,
            })
        };
        match data {
            Some(data) => {
                self.pending = Some(Pending::Retrieve);
                self.reply = 150;
                Ok(Some(Box::new(io::Cursor::new(data)) as BoxedReader))
            }
            None => {
                self.reply = 550;
                Ok(None)
            }
        }
    }

    async fn delete(&mut self, name: &str) -> FtpResult<bool> {
        let _op = self.begin().await?;
        let deleted = {
            let mut s = self.state.lock().unwrap();
            match s.child(self.cwd, name) {
                Some(n) if !s.is_dir(n) => {
                    let cwd = self.cwd;
                    s.unlink(cwd, name);
                    s.counters.deletes += 1;
                    true
                }
                _ => false,
            }
        };
        self.reply(if deleted { 250 } else { 550 }, deleted)
    }

    async fn remove_directory(&mut self, name: &str) -> FtpResult<bool> {
        let _op = self.begin().await?;
        let removed = {
            let mut s = self.state.lock().unwrap();
            let empty = s
                .child(self.cwd, name)
                .and_then(|n| s.children(n))
                .map(|c| c.is_empty())
                .unwrap_or(false);
            if empty {
                let cwd = self.cwd;
                s.unlink(cwd, name);
                s.counters.rmdirs += 1;
            }
            empty
        };
        self.reply(if removed { 250 } else { 550 }, removed)
    }

    async fn rename(&mut self, from: &str, to: &str) -> FtpResult<bool> {
        let _op = self.begin().await?;
        let renamed = {
            let mut s = self.state.lock().unwrap();
            s.counters.renames += 1;
            let source = s.split_parent(self.cwd, from).filter(|(p, n)| s.child(*p, n).is_some());
            let target = s.split_parent(self.cwd, to).filter(|(p, n)| s.child(*p, n).is_none());
            match (source, target) {
                (Some((from_dir, from_name)), Some((to_dir, to_name))) => {
                    if let Some(node) = s.unlink(from_dir, &from_name) {
                        s.nodes[node].parent = to_dir;
                        if let NodeKind::Dir(children) = &mut s.nodes[to_dir].kind {
                            children.insert(to_name, node);
                        }
                    }
                    true
                }
                _ => false,
            }
        };
        self.reply(if renamed { 250 } else { 553 }, renamed)
    }

    async fn noop(&mut self) -> FtpResult<()> {
        let _op = self.begin().await?;
        self.state.lock().unwrap().counters.noops += 1;
        self.reply = 200;
        Ok(())
    }

    async fn complete_pending_command(&mut self) -> FtpResult<bool> {
        let Some(pending) = self.pending.take() else {
            self.reply = 503;
            return Ok(false);
        };
        if self.connection.is_none() {
            return Err(FtpError::disconnected("connection reset by peer"));
        }
        let mut s = self.state.lock().unwrap();
        if s.fail_completion {
            drop(s);
            return self.reply(451, false);
        }
        if let Pending::Store { dir, name, data } = pending {
            let bytes = data.lock().unwrap().clone();
            s.counters.stores += 1;
            s.unlink(dir, &name);
            s.add(dir, &name, NodeKind::File(bytes));
        }
        drop(s);
        self.reply(226, true)
    }

    fn reply_code(&self) -> u16 {
        self.reply
    }

    async fn logout(&mut self) -> FtpResult<bool> {
        let _op = self.begin().await?;
        self.connection = None;
        self.reply(221, true)
    }

    async fn disconnect(&mut self) {
        self.connection = None;
        self.pending = None;
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Data channel of an upload stream.
struct SharedSink {
    data: Arc<Mutex<Vec<u8>>>,
    close: SinkClose,
}

impl AsyncWrite for SharedSink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.close {
            SinkClose::Normal => Poll::Ready(Ok(())),
            SinkClose::Fail => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "data channel reset"))),
            SinkClose::Hang => Poll::Pending,
        }
    }
}
