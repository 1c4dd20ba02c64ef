//! TCP transport: establishes the FTP control connection.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::FtpCodec;
use crate::ftp::types::{FtpResponse, ServerCharset};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// An established control connection.
pub struct ControlConnection {
    pub codec: FtpCodec,
    pub banner: FtpResponse,
    /// Local end of the control socket; active-local mode listens here.
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// Connect within `connect_timeout` and read the server banner.
pub async fn connect(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    charset: ServerCharset,
) -> FtpResult<ControlConnection> {
    let addr = format!("{}:{}", host, port);

    let tcp = timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::timeout(format!("TCP connect to {} timed out", addr)))?
        .map_err(|e| FtpError::connect(format!("TCP connect to {}: {}", addr, e)))?;

    tcp.set_nodelay(true).ok();
    let local_addr = tcp.local_addr()?;
    let peer_addr = tcp.peer_addr()?;

    let mut codec = FtpCodec::from_tcp(tcp, charset);
    let banner = timeout(connect_timeout, codec.read_response())
        .await
        .map_err(|_| FtpError::timeout(format!("no banner from {} within timeout", addr)))??;
    if !banner.is_completion() {
        return Err(FtpError::connect(format!(
            "server {} refused the connection: {}",
            addr,
            banner.text()
        ))
        .with_code(banner.code));
    }

    Ok(ControlConnection {
        codec,
        banner,
        local_addr,
        peer_addr,
    })
}
