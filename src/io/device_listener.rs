//! Camera registration listener
//!
//! Protocol: the camera connects and sends its identifier as raw UTF-8 in
//! a single write. No acknowledgement is sent. The first read is the whole
//! identity, so it must arrive in one segment.

use crate::domain::types::DeviceId;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::registry::{Registration, Registry};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no identity within {0:?}")]
    Timeout(Duration),
    #[error("connection closed before identity")]
    Closed,
    #[error("identity is not valid UTF-8")]
    NotUtf8,
    #[error("identity is empty")]
    Empty,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub handshake_timeout: Duration,
    pub max_identity_bytes: usize,
}

impl ListenerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            max_identity_bytes: config.max_identity_bytes(),
        }
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Turn the handshake payload into an identifier.
/// Surrounding whitespace (e.g. a trailing newline) is not part of it.
pub fn parse_identity(payload: &[u8]) -> Result<DeviceId, HandshakeError> {
    let text = std::str::from_utf8(payload).map_err(|_| HandshakeError::NotUtf8)?;
    let id = text.trim();
    if id.is_empty() {
        return Err(HandshakeError::Empty);
    }
    Ok(DeviceId::new(id))
}

/// Read the identity message: exactly one receive, bounded by the timeout
pub async fn read_identity(
    stream: &mut TcpStream,
    settings: &ListenerSettings,
) -> Result<DeviceId, HandshakeError> {
    let mut buf = vec![0u8; settings.max_identity_bytes.max(1)];
    let n = timeout(settings.handshake_timeout, stream.read(&mut buf))
        .await
        .map_err(|_| HandshakeError::Timeout(settings.handshake_timeout))??;
    if n == 0 {
        return Err(HandshakeError::Closed);
    }
    parse_identity(&buf[..n])
}

/// Accept cameras until shutdown. Dropping out of this function closes
/// the listening socket; pending handshakes are aborted.
pub async fn run_device_listener(
    listener: TcpListener,
    registry: Arc<Registry>,
    settings: ListenerSettings,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = listener.local_addr().ok();
    info!(addr = ?local, "device_listener_started");

    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let registry = registry.clone();
                        let settings = settings.clone();
                        let metrics = metrics.clone();
                        handshakes.spawn(async move {
                            handle_connection(stream, peer, &registry, &settings, &metrics).await;
                        });
                    }
                    Err(e) => {
                        // Transient (e.g. fd exhaustion); keep accepting
                        error!(error = %e, "device_listener_accept_failed");
                    }
                }
            }
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }

    handshakes.shutdown().await;
    drop(listener);
    info!(addr = ?local, "device_listener_stopped");
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: &Registry,
    settings: &ListenerSettings,
    metrics: &Metrics,
) {
    debug!(peer = %peer, "device_connection_accepted");

    let device_id = match read_identity(&mut stream, settings).await {
        Ok(id) => id,
        Err(e) => {
            metrics.record_handshake_failure();
            warn!(peer = %peer, error = %e, "device_handshake_failed");
            // Dropping the stream closes it
            return;
        }
    };

    match registry.register(device_id, stream, peer).0 {
        Registration::New => metrics.record_device_registered(),
        Registration::Reconnected => metrics.record_device_reconnected(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity() {
        assert_eq!(parse_identity(b"24:0a:c4:00:00:01").unwrap(), DeviceId::from("24:0a:c4:00:00:01"));
        assert_eq!(parse_identity(b"mac1\r\n").unwrap(), DeviceId::from("mac1"));
        assert!(matches!(parse_identity(b"  \n"), Err(HandshakeError::Empty)));
        assert!(matches!(parse_identity(&[0xC3, 0x28]), Err(HandshakeError::NotUtf8)));
    }
}
