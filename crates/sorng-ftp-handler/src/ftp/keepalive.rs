//! Periodic NOOP task that keeps an idle control connection alive.

use crate::ftp::session::Session;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Cancellable handle to a running keepalive task.
#[derive(Debug)]
pub struct KeepaliveHandle {
    task: JoinHandle<()>,
}

impl KeepaliveHandle {
    pub fn cancel(self) {
        self.task.abort();
    }
}

/// Spawn a fixed-delay keepalive: the first tick fires one `interval`
/// after spawning, each following tick one `interval` after the previous
/// tick finished. Every tick competes for the gate like any operation.
/// The task ends on its own once the session is gone.
pub(crate) fn spawn_keepalive(session: Weak<Mutex<Session>>, interval: Duration) -> KeepaliveHandle {
    let task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(session) = session.upgrade() else {
                log::debug!("FTP keepalive stopping, session dropped");
                break;
            };
            let mut guard = session.lock().await;
            guard.keepalive_tick().await;
        }
    });
    KeepaliveHandle { task }
}
