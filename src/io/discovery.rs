//! UDP discovery responder
//!
//! Cameras broadcast `brain address?` and get back
//! `brain address:<ip>` at their source address. Independent of the
//! registry; anything other than the exact request text is ignored.

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Requests are short text; anything longer is not a request
const MAX_DATAGRAM: usize = 512;

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub request: String,
    pub response_prefix: String,
    /// Fixed address to advertise instead of the detected one
    pub advertise_address: Option<String>,
}

impl DiscoverySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request: config.discovery_request().to_string(),
            response_prefix: config.discovery_response_prefix().to_string(),
            advertise_address: config.advertise_address().map(str::to_string),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Address of the interface that routes outward.
///
/// Connecting a UDP socket only selects a route; nothing is sent. Falls
/// back to loopback on hosts without a route.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!(error = %e, "local_ip_probe_failed");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Reply for a datagram, or `None` if it is not a discovery request
pub fn response_for(payload: &[u8], settings: &DiscoverySettings, ip: &str) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?;
    (text == settings.request).then(|| format!("{}{}", settings.response_prefix, ip))
}

pub async fn run_discovery_responder(
    socket: UdpSocket,
    settings: DiscoverySettings,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = socket.local_addr().ok();
    info!(addr = ?local, "discovery_responder_started");

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => handle_datagram(&socket, &buf[..n], from, &settings, &metrics).await,
                    Err(e) => warn!(error = %e, "discovery_recv_failed"),
                }
            }
        }
    }

    info!(addr = ?local, "discovery_responder_stopped");
}

async fn handle_datagram(
    socket: &UdpSocket,
    payload: &[u8],
    from: SocketAddr,
    settings: &DiscoverySettings,
    metrics: &Metrics,
) {
    // Resolved per request so a changed DHCP lease is picked up
    let ip = match &settings.advertise_address {
        Some(address) => address.clone(),
        None => local_ip().to_string(),
    };
    let Some(reply) = response_for(payload, settings, &ip) else {
        debug!(from = %from, bytes = %payload.len(), "discovery_datagram_ignored");
        return;
    };

    match socket.send_to(reply.as_bytes(), from).await {
        Ok(_) => {
            metrics.record_discovery_reply();
            debug!(to = %from, address = %ip, "discovery_reply_sent");
        }
        Err(e) => warn!(to = %from, error = %e, "discovery_reply_failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_response_for_exact_match_only() {
        let settings = DiscoverySettings::default();
        assert_eq!(
            response_for(b"brain address?", &settings, "192.168.1.20").as_deref(),
            Some("brain address:192.168.1.20")
        );
        assert_eq!(response_for(b"brain address? ", &settings, "x"), None);
        assert_eq!(response_for(b"BRAIN ADDRESS?", &settings, "x"), None);
        assert_eq!(response_for(&[0xFF, 0xFE], &settings, "x"), None);
    }

    #[tokio::test]
    async fn test_responder_replies_to_sender() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let settings = DiscoverySettings {
            advertise_address: Some("10.0.0.7".to_string()),
            ..DiscoverySettings::default()
        };
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_discovery_responder(server, settings, metrics.clone(), rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello?", server_addr).await.unwrap();
        client.send_to(b"brain address?", server_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, server_addr);
        assert_eq!(&buf[..n], b"brain address:10.0.0.7");

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(metrics.report(0, 0).discovery_replies, 1);
    }
}
