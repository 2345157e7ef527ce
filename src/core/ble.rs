use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::StreamExt;
use log::{info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::error::Kind;

/// 128-bit service UUID that identifies AirDrop peers over BLE (§6).
pub const AIRDROP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000af0a_0000_1000_8000_00805f9b34fb);
/// Apple's Bluetooth SIG company identifier.
pub const APPLE_COMPANY_ID: u16 = 0x004C;
const IN_RANGE_RSSI_DBM: i16 = -70;
const OUT_OF_RANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// One classified BLE sighting of a peer, emitted by a `BleRadio` scanner.
#[derive(Debug, Clone)]
pub struct BleSighting {
    pub peer_id: String,
    pub display_name: String,
    pub rssi: i16,
    pub seen_at: Instant,
}

/// `[type=0x05][flags=0x01][first 8 bytes of identity hash]` (§4.2/§6).
pub fn build_manufacturer_payload(identity_hash_hex: &str) -> Vec<u8> {
    let hash_bytes = hex::decode(identity_hash_hex).unwrap_or_default();
    let mut payload = vec![0x05u8, 0x01u8];
    payload.extend(hash_bytes.iter().take(8));
    while payload.len() < 10 {
        payload.push(0);
    }
    payload
}

fn matches_airdrop(service_uuids: &[Uuid], manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool {
    service_uuids.contains(&AIRDROP_SERVICE_UUID) || manufacturer_data.contains_key(&APPLE_COMPANY_ID)
}

/// Abstract platform radio: advertising (publisher) and scanning (scanner)
/// are both out-of-scope platform wrappers per §1; the crate consumes this
/// trait rather than owning GATT peripheral code.
#[async_trait]
pub trait BleRadio: Send + Sync {
    /// Begins advertising the fixed manufacturer-data payload. The
    /// advertisement is immutable; identity changes require restart.
    async fn advertise(&self, payload: Vec<u8>) -> Result<(), Kind>;
    async fn stop_advertising(&self) -> Result<(), Kind>;
    /// Runs a continuous active scan, pushing classified sightings to `tx`
    /// until the radio is unavailable or the task is dropped.
    async fn scan(&self, tx: mpsc::Sender<BleSighting>) -> Result<(), Kind>;
}

/// Concrete scanning adapter over `btleplug`. Peripheral/advertising mode is
/// not supported uniformly across btleplug's backends, so only the scanner
/// half is implemented here; `advertise`/`stop_advertising` are left for a
/// platform-specific `BleRadio` to provide.
pub struct BtleplugRadio;

impl BtleplugRadio {
    pub fn new() -> Self {
        Self
    }

    fn format_mac(addr: &btleplug::api::BDAddr) -> String {
        format!("ble-{}", addr.to_string().replace(':', "").to_lowercase())
    }
}

impl Default for BtleplugRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleRadio for BtleplugRadio {
    async fn advertise(&self, _payload: Vec<u8>) -> Result<(), Kind> {
        Err(Kind::RadioUnavailable(
            "BLE peripheral/advertising mode requires a platform-specific BleRadio".into(),
        ))
    }

    async fn stop_advertising(&self) -> Result<(), Kind> {
        Ok(())
    }

    async fn scan(&self, tx: mpsc::Sender<BleSighting>) -> Result<(), Kind> {
        use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral, ScanFilter};
        use btleplug::platform::Manager;

        let manager = Manager::new()
            .await
            .map_err(|e| Kind::RadioUnavailable(format!("BLE manager init failed: {}", e)))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| Kind::RadioUnavailable(format!("BLE adapter enumeration failed: {}", e)))?;
        let central = adapters
            .into_iter()
            .next()
            .ok_or_else(|| Kind::RadioUnavailable("no BLE adapter present".into()))?;

        let mut events = central
            .events()
            .await
            .map_err(|e| Kind::RadioUnavailable(format!("BLE event subscription failed: {}", e)))?;

        central
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Kind::RadioUnavailable(format!("BLE start_scan failed: {}", e)))?;

        info!("BLE scanner running");
        let mut last_seen: HashMap<String, Instant> = HashMap::new();

        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    let peripheral = match central.peripheral(&id).await {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    let props = match peripheral.properties().await {
                        Ok(Some(p)) => p,
                        _ => continue,
                    };

                    if !matches_airdrop(&props.services, &props.manufacturer_data) {
                        continue;
                    }
                    let rssi = props.rssi.unwrap_or(i16::MIN);
                    if rssi < IN_RANGE_RSSI_DBM {
                        continue;
                    }

                    let mac = Self::format_mac(&peripheral.address());
                    let now = Instant::now();
                    if let Some(prev) = last_seen.get(&mac) {
                        if now.duration_since(*prev) < Duration::from_millis(500) {
                            continue; // de-dup rapid re-advertisements
                        }
                    }
                    last_seen.insert(mac.clone(), now);

                    let display_name = props
                        .local_name
                        .clone()
                        .unwrap_or_else(|| mac[mac.len().saturating_sub(6)..].to_string());

                    let sighting = BleSighting {
                        peer_id: mac,
                        display_name,
                        rssi,
                        seen_at: now,
                    };
                    if tx.send(sighting).await.is_err() {
                        break;
                    }

                    last_seen.retain(|_, t| now.duration_since(*t) < OUT_OF_RANGE_TIMEOUT);
                }
                _ => {}
            }
        }
        warn!("BLE scanner stream ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_has_fixed_prefix_and_eight_hash_bytes() {
        let hash = "a1b2c3d4e5f60708090a0b0c0d0e0f10";
        let payload = build_manufacturer_payload(hash);
        assert_eq!(payload.len(), 10);
        assert_eq!(payload[0], 0x05);
        assert_eq!(payload[1], 0x01);
        assert_eq!(&payload[2..10], &hex::decode(&hash[..16]).unwrap()[..]);
    }

    #[test]
    fn classification_matches_on_either_uuid_or_company_id() {
        let mut md = HashMap::new();
        md.insert(APPLE_COMPANY_ID, vec![0x05, 0x01]);
        assert!(matches_airdrop(&[], &md));
        assert!(matches_airdrop(&[AIRDROP_SERVICE_UUID], &HashMap::new()));
        assert!(!matches_airdrop(&[], &HashMap::new()));
    }
}
