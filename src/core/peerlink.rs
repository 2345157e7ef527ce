use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::warn;
use rustls::{ClientConfig, ServerConfig, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use uuid::Uuid;

use crate::core::error::Kind;
use crate::core::registry::PeerRecord;
use crate::core::security::thumbprint_of_der;
use crate::core::utils;

pub trait DataStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> DataStream for T {}

/// A bidirectional, already-TLS-wrapped byte stream between local and
/// remote, tagged with the transport that produced it (§4.6).
pub struct PeerLink {
    pub connection_id: Uuid,
    pub transport_name: &'static str,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// SHA-256 thumbprint of the peer's TLS certificate, when the transport
    /// surfaces one. Used to correlate `/Ask` and `/Upload` by connection
    /// identity (§4.8).
    pub peer_cert_thumbprint: Option<String>,
    pub stream: Box<dyn DataStream>,
}

impl PeerLink {
    pub async fn close(mut self) -> Result<(), Kind> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| Kind::TransportFailure(e.to_string()))
    }
}

/// A transport a `PeerLinkManager` can try, in priority order (§4.6).
#[async_trait]
pub trait PeerLinkProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Whether this provider is currently usable (radio/interface present).
    fn available(&self) -> bool;
    async fn connect(&self, peer: &PeerRecord) -> Result<PeerLink, Kind>;
}

/// Standard same-subnet TCP provider, wrapped in mutual TLS (§4.6).
pub struct TcpPeerLinkProvider {
    tls_connector: TlsConnector,
}

impl TcpPeerLinkProvider {
    pub fn new(client_config: Arc<ClientConfig>) -> Self {
        Self {
            tls_connector: TlsConnector::from(client_config),
        }
    }
}

#[async_trait]
impl PeerLinkProvider for TcpPeerLinkProvider {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn available(&self) -> bool {
        true
    }

    async fn connect(&self, peer: &PeerRecord) -> Result<PeerLink, Kind> {
        let ip = peer
            .ip
            .ok_or_else(|| Kind::TransportFailure(format!("peer {} has no IP address", peer.peer_id)))?;
        let port = peer
            .port
            .ok_or_else(|| Kind::TransportFailure(format!("peer {} has no port", peer.peer_id)))?;

        let tcp = TcpStream::connect((ip, port))
            .await
            .map_err(|e| Kind::TransportFailure(format!("tcp connect to {}:{} failed: {}", ip, port, e)))?;
        utils::apply_wifi_tuning(&tcp).map_err(|e| Kind::TransportFailure(e.to_string()))?;

        let local_addr = tcp
            .local_addr()
            .map_err(|e| Kind::TransportFailure(e.to_string()))?;
        let remote_addr = tcp
            .peer_addr()
            .map_err(|e| Kind::TransportFailure(e.to_string()))?;

        let server_name = ServerName::IpAddress(ip);
        let tls = self
            .tls_connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Kind::TlsHandshakeFailure(e.to_string()))?;

        Ok(PeerLink {
            connection_id: Uuid::new_v4(),
            transport_name: self.name(),
            local_addr,
            remote_addr,
            peer_cert_thumbprint: None,
            stream: Box::new(tls),
        })
    }
}

/// Listen side of the same-subnet TCP provider: bound to the configured
/// port, formalizing an accept loop that yields each accepted `PeerLink` to
/// the server (resolves the open question in §9 about listener completion).
pub struct TcpPeerLinkListener {
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
}

impl TcpPeerLinkListener {
    pub async fn bind(addr: SocketAddr, server_config: Arc<ServerConfig>) -> Result<Self, Kind> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Kind::TransportFailure(format!("bind {} failed: {}", addr, e)))?;
        Ok(Self {
            listener,
            tls_acceptor: TlsAcceptor::from(server_config),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Accepts one connection, applies TLS, and returns the resulting link.
    /// Callers loop this to drive the server's listen side.
    pub async fn accept(&self) -> Result<PeerLink, Kind> {
        let (tcp, remote_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| Kind::TransportFailure(format!("accept failed: {}", e)))?;
        utils::apply_wifi_tuning(&tcp).map_err(|e| Kind::TransportFailure(e.to_string()))?;
        let local_addr = tcp
            .local_addr()
            .map_err(|e| Kind::TransportFailure(e.to_string()))?;

        let tls = self
            .tls_acceptor
            .accept(tcp)
            .await
            .map_err(|e| Kind::TlsHandshakeFailure(e.to_string()))?;

        let peer_cert_thumbprint = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| thumbprint_of_der(&cert.0));

        Ok(PeerLink {
            connection_id: Uuid::new_v4(),
            transport_name: "tcp",
            local_addr,
            remote_addr,
            peer_cert_thumbprint,
            stream: Box::new(tls),
        })
    }
}

/// Tries providers in priority order (Wi-Fi Direct first if configured,
/// same-subnet TCP fallback), registers the winning link by a fresh
/// `connection_id` (§4.6). Links are not pooled for reuse across transfers.
pub struct PeerLinkManager {
    providers: Vec<Arc<dyn PeerLinkProvider>>,
    open: Mutex<HashMap<Uuid, &'static str>>,
}

impl PeerLinkManager {
    pub fn new(providers: Vec<Arc<dyn PeerLinkProvider>>) -> Self {
        Self {
            providers,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(&self, peer: &PeerRecord) -> Result<PeerLink, Kind> {
        for provider in &self.providers {
            if !provider.available() {
                continue;
            }
            match provider.connect(peer).await {
                Ok(link) => {
                    self.open.lock().unwrap().insert(link.connection_id, provider.name());
                    return Ok(link);
                }
                Err(e) => {
                    warn!("peer-link provider {} failed for {}: {}", provider.name(), peer.peer_id, e);
                }
            }
        }
        Err(Kind::TransportFailure(format!("no transport succeeded for peer {}", peer.peer_id)))
    }

    pub fn forget(&self, connection_id: &Uuid) {
        self.open.lock().unwrap().remove(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::DeviceClass;

    struct AlwaysUnavailable;
    #[async_trait]
    impl PeerLinkProvider for AlwaysUnavailable {
        fn name(&self) -> &'static str {
            "wifi-direct"
        }
        fn available(&self) -> bool {
            false
        }
        async fn connect(&self, _peer: &PeerRecord) -> Result<PeerLink, Kind> {
            unreachable!("should never be called when unavailable")
        }
    }

    fn peer_without_reachability() -> PeerRecord {
        PeerRecord {
            peer_id: "peer-1".to_string(),
            display_name: "Peer".to_string(),
            device_class: DeviceClass::Mac,
            ip: None,
            port: None,
            metadata: Default::default(),
            first_seen: 0,
            last_seen: 0,
        }
    }

    #[tokio::test]
    async fn unavailable_providers_are_skipped_entirely() {
        let manager = PeerLinkManager::new(vec![Arc::new(AlwaysUnavailable)]);
        let err = manager.connect(&peer_without_reachability()).await.unwrap_err();
        assert!(matches!(err, Kind::TransportFailure(_)));
    }
}
