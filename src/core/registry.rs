use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use crate::core::events::DiscoveryEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    IPhone,
    IPad,
    Mac,
    WindowsPc,
    Unknown,
}

impl Default for DeviceClass {
    fn default() -> Self {
        DeviceClass::Unknown
    }
}

/// The unified view of a remote device (§3 `PeerRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub metadata: HashMap<String, String>,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl PeerRecord {
    pub fn available(&self, expiration_window_s: u64) -> bool {
        now_unix().saturating_sub(self.last_seen) <= expiration_window_s
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A single sighting from either discovery channel, merged into the
/// registry's canonical `PeerRecord` for that `peer_id`.
#[derive(Debug, Clone, Default)]
pub struct PeerSighting {
    pub peer_id: String,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub metadata: HashMap<String, String>,
}

/// Maintains `peer_id -> PeerRecord` under concurrent access, ages entries
/// out on a timer, and emits strictly per-peer-ordered events (§4.4, §5).
pub struct DeviceRegistry {
    peers: Arc<DashMap<String, Arc<Mutex<PeerRecord>>>>,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    expiration_window_s: u64,
}

impl DeviceRegistry {
    pub fn new(expiration_window_s: u64) -> (Self, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: Arc::new(DashMap::new()),
                events_tx: tx,
                expiration_window_s,
            },
            rx,
        )
    }

    /// Inserts or merges a sighting in place. Overwrite rules from §4.4:
    /// incoming scalar fields win only if non-empty/non-Unknown/non-zero;
    /// metadata keys union with incoming values winning on conflict.
    pub fn add_or_update(&self, sighting: PeerSighting) {
        let now = now_unix();
        let entry = self.peers.entry(sighting.peer_id.clone());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let slot = existing.get().clone();
                let mut record = slot.lock().unwrap();
                if !sighting.display_name.is_empty() {
                    record.display_name = sighting.display_name;
                }
                if sighting.device_class != DeviceClass::Unknown {
                    record.device_class = sighting.device_class;
                }
                if sighting.ip.is_some() {
                    record.ip = sighting.ip;
                }
                if sighting.port.is_some() {
                    record.port = sighting.port;
                }
                for (k, v) in sighting.metadata {
                    record.metadata.insert(k, v);
                }
                record.last_seen = now;
                let snapshot = record.clone();
                drop(record);
                let _ = self.events_tx.send(DiscoveryEvent::PeerUpdated(snapshot));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let record = PeerRecord {
                    peer_id: sighting.peer_id.clone(),
                    display_name: if sighting.display_name.is_empty() {
                        sighting.peer_id.clone()
                    } else {
                        sighting.display_name
                    },
                    device_class: sighting.device_class,
                    ip: sighting.ip,
                    port: sighting.port,
                    metadata: sighting.metadata,
                    first_seen: now,
                    last_seen: now,
                };
                vacant.insert(Arc::new(Mutex::new(record.clone())));
                let _ = self.events_tx.send(DiscoveryEvent::PeerFound(record));
            }
        }
    }

    /// Snapshot accessor returning only records with `available = true`.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers
            .iter()
            .filter_map(|kv| {
                let record = kv.value().lock().unwrap();
                if record.available(self.expiration_window_s) {
                    Some(record.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Forces immediate removal of one peer (e.g. an mDNS goodbye packet),
    /// independent of the timed sweep.
    pub fn remove(&self, peer_id: &str) {
        if self.peers.remove(peer_id).is_some() {
            let _ = self.events_tx.send(DiscoveryEvent::PeerLost {
                peer_id: peer_id.to_string(),
            });
        }
    }

    fn sweep_once(&self) {
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter_map(|kv| {
                let record = kv.value().lock().unwrap();
                if record.available(self.expiration_window_s) {
                    None
                } else {
                    Some(kv.key().clone())
                }
            })
            .collect();

        for peer_id in expired {
            if self.peers.remove(&peer_id).is_some() {
                debug!("registry sweep: expiring peer {}", peer_id);
                let _ = self.events_tx.send(DiscoveryEvent::PeerLost { peer_id });
            }
        }
    }

    /// Fires every 10 s (§5 timeout table), removing and emitting `removed`
    /// for any record whose `last_seen` exceeds the expiration window.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(10));
            loop {
                tick.tick().await;
                self.sweep_once();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(id: &str, name: &str) -> PeerSighting {
        PeerSighting {
            peer_id: id.to_string(),
            display_name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn insert_then_merge_emits_found_then_updated() {
        let (registry, mut rx) = DeviceRegistry::new(60);
        registry.add_or_update(sighting("peer-1", "iPhone"));
        registry.add_or_update(sighting("peer-1", "Alice's iPhone"));

        match rx.try_recv().unwrap() {
            DiscoveryEvent::PeerFound(r) => assert_eq!(r.display_name, "iPhone"),
            other => panic!("expected PeerFound, got {:?}", other),
        }
        match rx.try_recv().unwrap() {
            DiscoveryEvent::PeerUpdated(r) => assert_eq!(r.display_name, "Alice's iPhone"),
            other => panic!("expected PeerUpdated, got {:?}", other),
        }
    }

    #[test]
    fn empty_display_name_never_overwrites_existing() {
        let (registry, _rx) = DeviceRegistry::new(60);
        registry.add_or_update(sighting("peer-1", "iPhone"));
        registry.add_or_update(PeerSighting {
            peer_id: "peer-1".to_string(),
            ..Default::default()
        });
        let snap = registry.snapshot();
        assert_eq!(snap[0].display_name, "iPhone");
    }

    #[test]
    fn sweep_removes_stale_peer_and_emits_lost() {
        let (registry, mut rx) = DeviceRegistry::new(0);
        registry.add_or_update(sighting("peer-1", "iPhone"));
        let _ = rx.try_recv(); // drain PeerFound
        registry.sweep_once();
        match rx.try_recv().unwrap() {
            DiscoveryEvent::PeerLost { peer_id } => assert_eq!(peer_id, "peer-1"),
            other => panic!("expected PeerLost, got {:?}", other),
        }
        assert!(registry.snapshot().is_empty());
    }
}
