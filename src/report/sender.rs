/// Best-effort datagram delivery of report lines
use std::net::SocketAddr;

use log::{debug, error};
use tokio::net::UdpSocket;
use url::Url;

use crate::error::{Error, Result};

const DEFAULT_PORT: u16 = 8089;

/// Resolve a `udp://host[:port]` report URL to a socket address.
pub fn resolve_endpoint(report_url: &str) -> Result<SocketAddr> {
    let url = Url::parse(report_url)
        .map_err(|e| Error::Config(format!("invalid report URL '{}': {}", report_url, e)))?;
    if url.scheme() != "udp" {
        return Err(Error::Config(format!(
            "unsupported report URL scheme '{}'",
            url.scheme()
        )));
    }

    url.socket_addrs(|| Some(DEFAULT_PORT))
        .map_err(|e| Error::Config(format!("cannot resolve '{}': {}", report_url, e)))?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Config(format!("no address for '{}'", report_url)))
}

/// Sends report lines as single UDP datagrams.
pub struct ReportSender {
    socket: UdpSocket,
    target: SocketAddr,
}

impl ReportSender {
    pub async fn bind(target: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| Error::Report(format!("unable to create socket: {}", e)))?;
        Ok(ReportSender { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send one line. Failures are logged and dropped; the next cycle
    /// reports fresh values anyway.
    pub async fn send(&self, line: &str) {
        debug!("Send: [{}]", line);
        if let Err(e) = self.socket.send_to(line.as_bytes(), self.target).await {
            error!("Unable to send report to {}: {}", self.target, e);
        }
    }
}
