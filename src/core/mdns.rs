use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use log::{info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;

use crate::core::error::Kind;
use crate::core::registry::{DeviceClass, PeerSighting};

pub const SERVICE_TYPE: &str = "_airdrop._tcp.local.";
const MAX_INSTANCE_NAME_LEN: usize = 63;
const DEFAULT_FALLBACK_NAME: &str = "Windows-Device";

/// Keeps only letters/digits/`-`/`_`, truncates to 63 chars, defaults to
/// `Windows-Device` when the result would be empty (§4.3).
pub fn sanitize_service_name(display_name: &str) -> String {
    let cleaned: String = display_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_INSTANCE_NAME_LEN)
        .collect();
    if cleaned.is_empty() {
        DEFAULT_FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// Picks the address to publish on: a `Wi-Fi|Wireless|WLAN` interface first,
/// else the first non-loopback up interface, else unspecified (§4.3).
pub fn select_publish_address() -> IpAddr {
    let interfaces = if_addrs::get_if_addrs().unwrap_or_default();

    let wifi_like = interfaces.iter().find(|i| {
        let name = i.name.to_lowercase();
        !i.is_loopback() && (name.contains("wi-fi") || name.contains("wifi") || name.contains("wireless") || name.contains("wlan"))
    });
    if let Some(iface) = wifi_like {
        return iface.ip();
    }

    let first_up = interfaces.iter().find(|i| !i.is_loopback());
    if let Some(iface) = first_up {
        return iface.ip();
    }

    IpAddr::from([0, 0, 0, 0])
}

fn device_type_txt(device_class: DeviceClass) -> &'static str {
    match device_class {
        DeviceClass::IPhone => "iPhone",
        DeviceClass::IPad => "iPad",
        DeviceClass::Mac => "Mac",
        DeviceClass::WindowsPc => "Windows-PC",
        DeviceClass::Unknown => "Unknown",
    }
}

/// Publishes the local device's single SRV+TXT+A/AAAA tuple (§4.3 Publisher).
pub struct MdnsPublisher {
    daemon: ServiceDaemon,
    fullname: Option<String>,
}

impl MdnsPublisher {
    pub fn new() -> Result<Self, Kind> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Kind::RadioUnavailable(format!("mDNS daemon init failed: {}", e)))?;
        Ok(Self { daemon, fullname: None })
    }

    pub fn publish(
        &mut self,
        display_name: &str,
        identity_hash: &str,
        port: u16,
        device_class: DeviceClass,
    ) -> Result<(), Kind> {
        let instance_name = sanitize_service_name(display_name);
        let host_name = format!("{}.local.", instance_name);
        let address = select_publish_address().to_string();

        let mut txt = HashMap::new();
        txt.insert("name".to_string(), display_name.to_string());
        txt.insert("deviceType".to_string(), device_type_txt(device_class).to_string());
        txt.insert("transport".to_string(), "wifidirect,wifi".to_string());
        txt.insert("capabilities".to_string(), "send,receive".to_string());
        txt.insert("version".to_string(), "1.0".to_string());
        txt.insert("id".to_string(), identity_hash.chars().take(32).collect());

        let info = ServiceInfo::new(SERVICE_TYPE, &instance_name, &host_name, &address, port, txt)
            .map_err(|e| Kind::ProtocolViolation(format!("mDNS service info invalid: {}", e)))?;

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| Kind::RadioUnavailable(format!("mDNS register failed: {}", e)))?;
        self.fullname = Some(fullname);
        info!("mDNS publisher advertising {} on {}", instance_name, port);
        Ok(())
    }

    pub fn unpublish(&mut self) -> Result<(), Kind> {
        if let Some(fullname) = self.fullname.take() {
            self.daemon
                .unregister(&fullname)
                .map_err(|e| Kind::RadioUnavailable(format!("mDNS unregister failed: {}", e)))?;
        }
        Ok(())
    }
}

/// Browses `_airdrop._tcp` and emits sightings/removals as `PeerSighting`s
/// paired with a removal signal (§4.3 Browser).
pub enum MdnsEvent {
    Resolved(PeerSighting),
    Removed { peer_id: String },
}

pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self, Kind> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Kind::RadioUnavailable(format!("mDNS daemon init failed: {}", e)))?;
        Ok(Self { daemon })
    }

    /// Spawns a blocking listener thread (the `mdns-sd` receiver is
    /// synchronous) that forwards classified events to `tx`.
    pub fn spawn(&self, tx: mpsc::Sender<MdnsEvent>) -> Result<(), Kind> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Kind::RadioUnavailable(format!("mDNS browse failed: {}", e)))?;

        std::thread::spawn(move || {
            while let Ok(event) = receiver.recv() {
                match event {
                    ServiceEvent::ServiceResolved(resolved) => {
                        let peer_id = resolved
                            .get_fullname()
                            .split('.')
                            .next()
                            .unwrap_or_else(|| resolved.get_fullname())
                            .to_string();
                        let port = resolved.get_port();
                        let ip = resolved
                            .get_addresses()
                            .iter()
                            .find(|a| a.is_ipv4())
                            .or_else(|| resolved.get_addresses().iter().next())
                            .copied();

                        let props = resolved.get_properties();
                        let display_name = props
                            .get("name")
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "Unknown".to_string());
                        let device_class = match props.get("deviceType").map(|v| v.to_string()) {
                            Some(ref s) if s == "iPhone" => DeviceClass::IPhone,
                            Some(ref s) if s == "iPad" => DeviceClass::IPad,
                            Some(ref s) if s == "Mac" => DeviceClass::Mac,
                            Some(ref s) if s == "Windows-PC" => DeviceClass::WindowsPc,
                            _ => DeviceClass::Unknown,
                        };

                        let mut metadata = HashMap::new();
                        if let Some(v) = props.get("transport") {
                            metadata.insert("transport".to_string(), v.to_string());
                        }
                        if let Some(v) = props.get("capabilities") {
                            metadata.insert("capabilities".to_string(), v.to_string());
                        }
                        if let Some(v) = props.get("version") {
                            metadata.insert("version".to_string(), v.to_string());
                        }
                        if let Some(v) = props.get("id") {
                            metadata.insert("id".to_string(), v.to_string());
                        }

                        let sighting = PeerSighting {
                            peer_id,
                            display_name,
                            device_class,
                            ip,
                            port: Some(port),
                            metadata,
                        };
                        if tx.blocking_send(MdnsEvent::Resolved(sighting)).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_service_type, fullname) => {
                        let peer_id = fullname.split('.').next().unwrap_or(&fullname).to_string();
                        if tx.blocking_send(MdnsEvent::Removed { peer_id }).is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            warn!("mDNS browser receiver channel closed");
        });
        Ok(())
    }

    /// Restarts the browse query after a short gap to force peers to
    /// re-announce (`rescan`, §4.5).
    pub async fn rescan(&self, tx: mpsc::Sender<MdnsEvent>) -> Result<(), Kind> {
        self.daemon
            .stop_browse(SERVICE_TYPE)
            .map_err(|e| Kind::RadioUnavailable(format!("mDNS stop_browse failed: {}", e)))?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.spawn(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_only_allowed_characters() {
        assert_eq!(sanitize_service_name("Alice's iPhone!"), "AlicesiPhone");
    }

    #[test]
    fn sanitize_truncates_to_63_chars() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_service_name(&long).len(), 63);
    }

    #[test]
    fn sanitize_empty_result_falls_back() {
        assert_eq!(sanitize_service_name("!!! ***"), "Windows-Device");
    }
}
