use serde::{Deserialize, Serialize};

use crate::core::registry::PeerRecord;
use crate::core::transfer::{TransferProgress, TransferRecord};

/// Discovery-side events, emitted strictly ordered per `peer_id`
/// (`added → updated* → removed`, §4.4 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiscoveryEvent {
    PeerFound(PeerRecord),
    PeerUpdated(PeerRecord),
    PeerLost { peer_id: String },
}

/// Transfer-side events, one terminal event per `TransferRecord` at most
/// (§4.10, §8 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferEvent {
    Requested(TransferRecord),
    ProgressUpdated(TransferProgress),
    Completed(TransferRecord),
    Failed(TransferRecord),
    Rejected(TransferRecord),
    Cancelled(TransferRecord),
}

/// Top-level fan-out sink a caller implements to receive both event
/// families. Mirrors the teacher's `TransferEventHandler` shape, split into
/// the two channels the spec actually names.
pub trait EventSink: Send + Sync {
    fn on_discovery_event(&self, event: DiscoveryEvent);
    fn on_transfer_event(&self, event: TransferEvent);
}
