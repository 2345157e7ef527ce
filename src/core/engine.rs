use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::core::ble::BtleplugRadio;
use crate::core::client::{AirDropClient, ProgressCallback};
use crate::core::config::AppConfig;
use crate::core::discovery::DiscoveryCoordinator;
use crate::core::error::Kind;
use crate::core::events::EventSink;
use crate::core::identity::{build_local_identity, LocalIdentity};
use crate::core::notification::{ApprovalCallback, Decision};
use crate::core::peerlink::{PeerLinkManager, TcpPeerLinkListener, TcpPeerLinkProvider};
use crate::core::registry::{DeviceClass, PeerRecord};
use crate::core::security::build_tls_configs;
use crate::core::server::AirDropServer;
use crate::core::transfer::{FileDescriptor, TransferTable};

/// Resolves an in-flight `/Ask`'s decision via a one-shot channel the caller
/// fulfills later through `OpenDropCore::resolve_request`. Mirrors the
/// teacher's `pending_transfers`/`resolve_request` pattern, keyed by
/// `transfer_id` instead of a string task id.
struct PendingApprovals {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Decision>>>,
}

impl PendingApprovals {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ApprovalCallback for PendingApprovals {
    async fn ask(&self, request: &crate::core::transfer::TransferRecord) -> Decision {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request.transfer_id, tx);
        match rx.await {
            Ok(decision) => decision,
            Err(_) => Decision::Reject { reason: Some("approval channel closed".into()) },
        }
    }
}

/// Bridges `TransferTable`/`DeviceRegistry` event channels onto an
/// `EventSink`, running for the lifetime of the core (teacher's
/// `EventHandlerAdapter` dispatch tasks).
fn spawn_event_forwarders(
    sink: Arc<dyn EventSink>,
    mut discovery_rx: tokio::sync::mpsc::UnboundedReceiver<crate::core::events::DiscoveryEvent>,
    mut transfer_rx: tokio::sync::mpsc::UnboundedReceiver<crate::core::events::TransferEvent>,
) {
    let discovery_sink = sink.clone();
    tokio::spawn(async move {
        while let Some(event) = discovery_rx.recv().await {
            discovery_sink.on_discovery_event(event);
        }
    });
    tokio::spawn(async move {
        while let Some(event) = transfer_rx.recv().await {
            sink.on_transfer_event(event);
        }
    });
}

/// Top-level facade wiring identity, discovery, peer links, the server and
/// client, and the shared transfer table into one start/send/resolve
/// surface (§4, §8).
pub struct OpenDropCore {
    identity: Arc<LocalIdentity>,
    config: AppConfig,
    transfers: Arc<TransferTable>,
    discovery: Arc<DiscoveryCoordinator>,
    #[allow(dead_code)]
    peerlink: Arc<PeerLinkManager>,
    server: Arc<AirDropServer>,
    client: AirDropClient,
    approvals: Arc<PendingApprovals>,
    server_tls: Arc<rustls::ServerConfig>,
}

impl OpenDropCore {
    pub fn new_with_config(config: AppConfig, event_sink: Arc<dyn EventSink>) -> anyhow::Result<Self> {
        let save_dir = config.save_dir();
        let node_name = crate::core::utils::get_system_name();

        let identity = Arc::new(build_local_identity(
            &config.identity,
            save_dir.join(".identity_store"),
            save_dir.clone(),
            &node_name,
            config.transfer.cert_validity_days,
            config.transfer.cert_renewal_threshold_days,
        )?);

        let (server_tls, client_tls) = build_tls_configs(&identity.certificate)?;
        let server_tls = Arc::new(server_tls);
        let client_tls = Arc::new(client_tls);

        let (registry, discovery_rx) = crate::core::registry::DeviceRegistry::new(config.storage.peer_expiration_s);
        let registry = Arc::new(registry);

        let discovery = Arc::new(DiscoveryCoordinator::new(
            registry,
            Arc::new(BtleplugRadio::new()),
            identity.visibility,
            identity.identity_hash.clone(),
            identity.display_name.clone(),
            DeviceClass::WindowsPc,
            config.server.port,
        )?);

        let peerlink = Arc::new(PeerLinkManager::new(vec![Arc::new(TcpPeerLinkProvider::new(client_tls))]));

        let (transfers, transfer_rx) = TransferTable::new();
        let transfers = Arc::new(transfers);

        let approvals = Arc::new(PendingApprovals::new());
        let approval_callback: Arc<dyn ApprovalCallback> = approvals.clone();

        let server = AirDropServer::new(
            identity.clone(),
            save_dir,
            transfers.clone(),
            approval_callback,
            &config.server,
            config.storage.preserve_timestamps,
            config.transfer.max_concurrent_transfers,
        );

        let client = AirDropClient::new(identity.clone(), peerlink.clone(), transfers.clone());

        spawn_event_forwarders(event_sink, discovery_rx, transfer_rx);

        Ok(Self {
            identity,
            config,
            transfers,
            discovery,
            peerlink,
            server,
            client,
            approvals,
            server_tls,
        })
    }

    /// Brings up the `/Discover` `/Ask` `/Upload` listener and discovery
    /// (BLE scan + mDNS browse/publish), mirroring the teacher's
    /// `start_service` two-task layout.
    pub async fn start_service(&self) -> Result<(), Kind> {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.config.server.port));
        let listener = TcpPeerLinkListener::bind(addr, self.server_tls.clone()).await?;
        info!("AirDrop server listening on port {}", listener.local_port());

        let server = self.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!("server loop ended: {}", e);
            }
        });

        self.discovery.start().await
    }

    pub fn stop_service(&self) {
        self.discovery.stop();
    }

    /// Snapshot of currently reachable peers (§4.4/§4.5).
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.discovery.snapshot()
    }

    pub async fn rescan(&self) -> Result<(), Kind> {
        self.discovery.rescan().await
    }

    /// Starts sending `files` to `peer`; returns immediately with the new
    /// transfer's id while the exchange runs in the background (§4.9).
    pub fn send_file(&self, peer: PeerRecord, files: Vec<FileDescriptor>, progress: Arc<dyn ProgressCallback>) -> Uuid {
        self.client.send(peer, files, progress)
    }

    /// Fulfills a pending `/Ask` prompt raised through the `EventSink`'s
    /// `TransferEvent::Requested` (teacher's `resolve_request`).
    pub fn resolve_request(&self, transfer_id: Uuid, decision: Decision) {
        if let Some(tx) = self.approvals.pending.lock().unwrap().remove(&transfer_id) {
            let _ = tx.send(decision);
        }
    }

    /// Cancels an in-flight transfer by id (§4.10, §5).
    pub fn cancel_transfer(&self, transfer_id: &Uuid) -> Result<(), Kind> {
        self.transfers.update(transfer_id, |r| r.cancel())
    }

    pub fn identity(&self) -> Arc<LocalIdentity> {
        self.identity.clone()
    }

    pub fn save_dir(&self) -> PathBuf {
        self.config.save_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{DiscoveryEvent, TransferEvent};

    struct NullSink;
    impl EventSink for NullSink {
        fn on_discovery_event(&self, _event: DiscoveryEvent) {}
        fn on_transfer_event(&self, _event: TransferEvent) {}
    }

    #[tokio::test]
    async fn resolve_request_delivers_decision_to_waiting_ask() {
        let approvals = Arc::new(PendingApprovals::new());
        let peer = PeerRecord {
            peer_id: "peer-1".to_string(),
            display_name: "Peer".to_string(),
            device_class: DeviceClass::Mac,
            ip: None,
            port: None,
            metadata: Default::default(),
            first_seen: 0,
            last_seen: 0,
        };
        let record = crate::core::transfer::TransferRecord::new_receive(peer.clone(), peer, vec![]);
        let transfer_id = record.transfer_id;

        let approvals_for_ask = approvals.clone();
        let handle = tokio::spawn(async move { approvals_for_ask.ask(&record).await });

        tokio::task::yield_now().await;
        let mut attempts = 0;
        while approvals.pending.lock().unwrap().get(&transfer_id).is_none() && attempts < 100 {
            tokio::task::yield_now().await;
            attempts += 1;
        }

        if let Some(tx) = approvals.pending.lock().unwrap().remove(&transfer_id) {
            let _ = tx.send(Decision::Approve { save_path: None });
        }

        let decision = handle.await.unwrap();
        assert!(matches!(decision, Decision::Approve { .. }));
    }

    #[test]
    fn null_sink_compiles_as_event_sink() {
        let _sink: Arc<dyn EventSink> = Arc::new(NullSink);
    }
}
