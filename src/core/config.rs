use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Visibility {
    Off,
    ContactsOnly,
    Everyone,
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::ContactsOnly
    }
}

/// Mirrors the enumerated option list of the external-interfaces section:
/// everything the core consumes to behave, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub visibility: Visibility,
}

fn default_port() -> u16 {
    8771
}
fn default_connect_timeout_s() -> u64 {
    30
}
fn default_approval_timeout_s() -> u64 {
    60
}
fn default_transfer_timeout_min() -> u64 {
    30
}
fn default_buffer_size() -> usize {
    81920
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auto_accept: bool,
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
    #[serde(default = "default_approval_timeout_s")]
    pub approval_timeout_s: u64,
    #[serde(default = "default_transfer_timeout_min")]
    pub transfer_timeout_min: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            auto_accept: false,
            connect_timeout_s: default_connect_timeout_s(),
            approval_timeout_s: default_approval_timeout_s(),
            transfer_timeout_min: default_transfer_timeout_min(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_peer_expiration_s() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub save_path: String,
    #[serde(default)]
    pub preserve_timestamps: bool,
    #[serde(default = "default_peer_expiration_s")]
    pub peer_expiration_s: u64,
}

fn default_cert_validity_days() -> u32 {
    365
}
fn default_cert_renewal_threshold_days() -> u32 {
    30
}
fn default_max_concurrent_transfers() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_cert_validity_days")]
    pub cert_validity_days: u32,
    #[serde(default = "default_cert_renewal_threshold_days")]
    pub cert_renewal_threshold_days: u32,
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            cert_validity_days: default_cert_validity_days(),
            cert_renewal_threshold_days: default_cert_renewal_threshold_days(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.save_path)
    }
}
