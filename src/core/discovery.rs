use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::ble::{BleRadio, BleSighting};
use crate::core::config::Visibility;
use crate::core::error::Kind;
use crate::core::mdns::{MdnsBrowser, MdnsEvent, MdnsPublisher};
use crate::core::registry::{DeviceClass, DeviceRegistry, PeerRecord, PeerSighting};

/// Composes the BLE Beacon, mDNS Responder, and Device Registry into one
/// start/stop/rescan surface (§4.5). `start()` brings up the BLE scanner and
/// mDNS browser unconditionally; the publisher/responder only come up when
/// `visibility != Off`. `stop()` tears down in reverse order.
pub struct DiscoveryCoordinator {
    registry: Arc<DeviceRegistry>,
    ble_radio: Arc<dyn BleRadio>,
    mdns_browser: Arc<MdnsBrowser>,
    publisher: Mutex<Option<MdnsPublisher>>,
    visibility: Visibility,
    identity_hash: String,
    display_name: String,
    device_class: DeviceClass,
    port: u16,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryCoordinator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        ble_radio: Arc<dyn BleRadio>,
        visibility: Visibility,
        identity_hash: String,
        display_name: String,
        device_class: DeviceClass,
        port: u16,
    ) -> Result<Self, Kind> {
        Ok(Self {
            registry,
            ble_radio,
            mdns_browser: Arc::new(MdnsBrowser::new()?),
            publisher: Mutex::new(None),
            visibility,
            identity_hash,
            display_name,
            device_class,
            port,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), Kind> {
        info!("discovery coordinator starting, visibility={:?}", self.visibility);

        let (ble_tx, mut ble_rx) = mpsc::channel::<BleSighting>(32);
        let radio = self.ble_radio.clone();
        let scan_handle = tokio::spawn(async move {
            if let Err(e) = radio.scan(ble_tx).await {
                warn!("BLE scan stopped: {}", e);
            }
        });

        let registry = self.registry.clone();
        let forward_handle = tokio::spawn(async move {
            while let Some(sighting) = ble_rx.recv().await {
                registry.add_or_update(PeerSighting {
                    peer_id: sighting.peer_id,
                    display_name: sighting.display_name,
                    device_class: DeviceClass::Unknown,
                    ip: None,
                    port: None,
                    metadata: Default::default(),
                });
            }
        });

        let (mdns_tx, mut mdns_rx) = mpsc::channel::<MdnsEvent>(32);
        self.mdns_browser.spawn(mdns_tx.clone())?;
        let registry2 = self.registry.clone();
        let mdns_forward_handle = tokio::spawn(async move {
            while let Some(event) = mdns_rx.recv().await {
                match event {
                    MdnsEvent::Resolved(sighting) => registry2.add_or_update(sighting),
                    MdnsEvent::Removed { peer_id } => registry2.remove(&peer_id),
                }
            }
        });

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(scan_handle);
            tasks.push(forward_handle);
            tasks.push(mdns_forward_handle);
        }

        if self.visibility != Visibility::Off {
            self.bring_up_publisher()?;
        }

        Ok(())
    }

    fn bring_up_publisher(&self) -> Result<(), Kind> {
        let mut publisher = MdnsPublisher::new()?;
        publisher.publish(&self.display_name, &self.identity_hash, self.port, self.device_class)?;
        *self.publisher.lock().unwrap() = Some(publisher);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(mut publisher) = self.publisher.lock().unwrap().take() {
            let _ = publisher.unpublish();
        }
        let mut tasks = self.tasks.lock().unwrap();
        while let Some(handle) = tasks.pop() {
            handle.abort();
        }
        info!("discovery coordinator stopped");
    }

    /// Restarts the mDNS browser with a 500 ms gap to force peers to
    /// re-announce (§4.5).
    pub async fn rescan(self: &Arc<Self>) -> Result<(), Kind> {
        let (mdns_tx, mut mdns_rx) = mpsc::channel::<MdnsEvent>(32);
        self.mdns_browser.rescan(mdns_tx).await?;
        let registry = self.registry.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = mdns_rx.recv().await {
                match event {
                    MdnsEvent::Resolved(sighting) => registry.add_or_update(sighting),
                    MdnsEvent::Removed { peer_id } => registry.remove(&peer_id),
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    /// Records with `available = true` only (§4.5).
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.registry.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullRadio;
    #[async_trait]
    impl BleRadio for NullRadio {
        async fn advertise(&self, _payload: Vec<u8>) -> Result<(), Kind> {
            Ok(())
        }
        async fn stop_advertising(&self) -> Result<(), Kind> {
            Ok(())
        }
        async fn scan(&self, _tx: mpsc::Sender<BleSighting>) -> Result<(), Kind> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_with_visibility_off_never_publishes() {
        let (registry, _rx) = DeviceRegistry::new(60);
        let coordinator = Arc::new(
            DiscoveryCoordinator::new(
                Arc::new(registry),
                Arc::new(NullRadio),
                Visibility::Off,
                "abc123".to_string(),
                "Test Device".to_string(),
                DeviceClass::Mac,
                8771,
            )
            .unwrap(),
        );
        coordinator.start().await.unwrap();
        assert!(coordinator.publisher.lock().unwrap().is_none());
        coordinator.stop();
    }
}
