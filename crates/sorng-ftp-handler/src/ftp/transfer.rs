//! Data-channel management for FTP transfers.
//!
//! Supports the four connection modes of [`DataConnectionMode`]:
//! - **PassiveLocal**: `PASV`, connect to the returned address
//! - **PassiveRemote**: `PASV`, connect to the control host on the returned port
//! - **ActiveLocal**: listen on the control socket's local address, send `PORT`
//! - **ActiveRemote**: listen on the configured port, advertise the configured host
//!
//! Active modes only accept the inbound connection after the transfer
//! command has been answered with a 1xx reply, so the server is never
//! waiting on a command the client has not sent yet.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::FtpCodec;
use crate::ftp::types::DataConnectionMode;
use lazy_static::lazy_static;
use regex::Regex;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};

lazy_static! {
    static ref PASV_RE: Regex =
        Regex::new(r"(\d+),(\d+),(\d+),(\d+),(\d+),(\d+)").expect("static PASV pattern");
}

/// Everything the data channel needs to know about the session.
#[derive(Debug, Clone)]
pub struct DataChannelSettings {
    pub mode: DataConnectionMode,
    /// Peer address of the control connection.
    pub control_peer: IpAddr,
    /// Local address of the control connection.
    pub control_local: IpAddr,
    pub active_remote_host: Option<String>,
    pub active_remote_port: Option<u16>,
    pub timeout: Option<Duration>,
}

/// A data channel negotiated on the control connection but not yet usable.
pub enum PendingDataChannel {
    /// Passive modes connect before the transfer command.
    Connected(TcpStream),
    /// Active modes accept once the transfer command was acknowledged.
    Listening(TcpListener),
}

impl PendingDataChannel {
    /// Finish establishing the channel.
    pub async fn establish(self, data_timeout: Option<Duration>) -> FtpResult<TcpStream> {
        match self {
            PendingDataChannel::Connected(tcp) => Ok(tcp),
            PendingDataChannel::Listening(listener) => {
                let (tcp, peer) = with_timeout(data_timeout, listener.accept(), "PORT accept")
                    .await?
                    .map_err(|e| FtpError::io_error(format!("PORT accept: {}", e)))?;
                log::trace!("data connection accepted from {}", peer);
                Ok(tcp)
            }
        }
    }
}

/// Negotiate a data channel according to the configured mode.
pub async fn prepare_data_channel(
    codec: &mut FtpCodec,
    settings: &DataChannelSettings,
) -> FtpResult<PendingDataChannel> {
    match settings.mode {
        DataConnectionMode::PassiveLocal => {
            let addr = request_pasv(codec).await?;
            Ok(PendingDataChannel::Connected(connect_data(addr, settings.timeout).await?))
        }
        DataConnectionMode::PassiveRemote => {
            let advertised = request_pasv(codec).await?;
            let addr = SocketAddr::new(settings.control_peer, advertised.port());
            Ok(PendingDataChannel::Connected(connect_data(addr, settings.timeout).await?))
        }
        DataConnectionMode::ActiveLocal => {
            let listener = TcpListener::bind(SocketAddr::new(settings.control_local, 0))
                .await
                .map_err(|e| FtpError::io_error(format!("PORT bind: {}", e)))?;
            let local = listener.local_addr()?;
            let ip = ipv4_of(local.ip())?;
            send_port(codec, ip, local.port()).await?;
            Ok(PendingDataChannel::Listening(listener))
        }
        DataConnectionMode::ActiveRemote => {
            let (host, port) = match (&settings.active_remote_host, settings.active_remote_port) {
                (Some(h), Some(p)) => (h.as_str(), p),
                _ => {
                    return Err(FtpError::invalid_config(
                        "activeRemote mode requires activeRemoteHost and activeRemotePort",
                    ))
                }
            };
            let listener = TcpListener::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))
                .await
                .map_err(|e| FtpError::io_error(format!("PORT bind on {}: {}", port, e)))?;
            let advertised = resolve_ipv4(host).await?;
            send_port(codec, advertised, port).await?;
            Ok(PendingDataChannel::Listening(listener))
        }
    }
}

// ─── PASV ────────────────────────────────────────────────────────────

/// Issue `PASV` and parse `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
async fn request_pasv(codec: &mut FtpCodec) -> FtpResult<SocketAddr> {
    let resp = codec.expect_ok("PASV").await?;
    parse_pasv_response(&resp.text())
}

pub(crate) fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV: {}", text)))?;

    let mut nums = [0u8; 6];
    for (i, slot) in nums.iter_mut().enumerate() {
        *slot = caps[i + 1]
            .parse::<u8>()
            .map_err(|_| FtpError::protocol_error("PASV number out of range"))?;
    }

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Ok(SocketAddr::new(ip, port))
}

async fn connect_data(addr: SocketAddr, data_timeout: Option<Duration>) -> FtpResult<TcpStream> {
    with_timeout(data_timeout, TcpStream::connect(addr), "PASV data connect")
        .await?
        .map_err(|e| FtpError::io_error(format!("PASV data connect to {}: {}", addr, e)))
}

// ─── PORT ────────────────────────────────────────────────────────────

pub(crate) fn format_port_command(ip: Ipv4Addr, port: u16) -> String {
    let o = ip.octets();
    format!(
        "PORT {},{},{},{},{},{}",
        o[0],
        o[1],
        o[2],
        o[3],
        port / 256,
        port % 256
    )
}

async fn send_port(codec: &mut FtpCodec, ip: Ipv4Addr, port: u16) -> FtpResult<()> {
    codec.expect_ok(&format_port_command(ip, port)).await?;
    Ok(())
}

fn ipv4_of(ip: IpAddr) -> FtpResult<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .ok_or_else(|| FtpError::io_error("PORT requires an IPv4 control connection")),
    }
}

async fn resolve_ipv4(host: &str) -> FtpResult<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = lookup_host((host, 0))
        .await
        .map_err(|e| FtpError::io_error(format!("resolve {}: {}", host, e)))?;
    addrs
        .filter_map(|a| match a.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| FtpError::io_error(format!("{} has no IPv4 address", host)))
}

// ─── Helpers ─────────────────────────────────────────────────────────

async fn with_timeout<F, T>(limit: Option<Duration>, fut: F, what: &str) -> FtpResult<T>
where
    F: Future<Output = T>,
{
    match limit {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| FtpError::timeout(format!("{} timed out", what))),
        None => Ok(fut.await),
    }
}
