use std::path::PathBuf;

use async_trait::async_trait;
use tokio::time::Duration;

use crate::core::error::Kind;
use crate::core::transfer::TransferRecord;

/// The user's answer to an incoming transfer request (§6).
#[derive(Debug, Clone)]
pub enum Decision {
    Approve { save_path: Option<PathBuf> },
    Reject { reason: Option<String> },
}

/// The approval surface the core consumes; the actual prompt UI is out of
/// scope (§1) and lives on the other side of this trait.
#[async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn ask(&self, request: &TransferRecord) -> Decision;
}

/// Bypasses the prompt entirely, used when `auto_accept` is set (§4.8).
pub struct AutoAccept {
    pub save_path: Option<PathBuf>,
}

#[async_trait]
impl ApprovalCallback for AutoAccept {
    async fn ask(&self, _request: &TransferRecord) -> Decision {
        Decision::Approve {
            save_path: self.save_path.clone(),
        }
    }
}

/// Invokes the callback bounded by `timeout` (default 60 s, §5). A callback
/// that never resolves yields `ApprovalTimeout` rather than hanging the
/// `/Ask` handler indefinitely.
pub async fn request_approval(
    callback: &dyn ApprovalCallback,
    request: &TransferRecord,
    timeout: Duration,
) -> Result<Decision, Kind> {
    tokio::time::timeout(timeout, callback.ask(request))
        .await
        .map_err(|_| Kind::ApprovalTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{DeviceClass, PeerRecord};

    fn record() -> TransferRecord {
        let peer = PeerRecord {
            peer_id: "peer-1".to_string(),
            display_name: "Peer".to_string(),
            device_class: DeviceClass::IPhone,
            ip: None,
            port: None,
            metadata: Default::default(),
            first_seen: 0,
            last_seen: 0,
        };
        TransferRecord::new_receive(peer.clone(), peer, vec![])
    }

    struct NeverResponds;
    #[async_trait]
    impl ApprovalCallback for NeverResponds {
        async fn ask(&self, _request: &TransferRecord) -> Decision {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn auto_accept_approves_immediately() {
        let cb = AutoAccept { save_path: None };
        let decision = request_approval(&cb, &record(), Duration::from_secs(1)).await.unwrap();
        assert!(matches!(decision, Decision::Approve { .. }));
    }

    #[tokio::test]
    async fn unresponsive_callback_times_out() {
        let cb = NeverResponds;
        let result = request_approval(&cb, &record(), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Kind::ApprovalTimeout)));
    }
}
