use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use rand::RngCore;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::config::Visibility;
use crate::core::error::Kind;

const IDENTITY_DIR: &str = "identity";
const CERT_FILE: &str = "device.cert.der";
const KEY_FILE: &str = "device.key.der";
const META_FILE: &str = "device.meta.json";
const DAY_SECS: u64 = 86_400;

/// Persistent per-installation identity (§3 `LocalIdentity`).
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub device_id: uuid::Uuid,
    pub display_name: String,
    pub visibility: Visibility,
    pub save_dir: PathBuf,
    pub email: String,
    pub phone: String,
    pub identity_hash: String,
    pub certificate: Certificate,
}

/// The active X.509 certificate plus its private key, held in DER form.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub thumbprint: String,
    pub not_before: u64,
    pub not_after: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CertMeta {
    not_before: u64,
    not_after: u64,
    thumbprint: String,
}

/// `compute_identity_hash(email, phone) == hex(SHA256(utf8(email) || utf8(phone)))`.
pub fn compute_identity_hash(email: &str, phone: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    hasher.update(phone.as_bytes());
    hex::encode(hasher.finalize())
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn thumbprint_of(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Generates a fresh RSA-2048 self-signed X.509 v3 certificate, signed with
/// SHA-256-WITH-RSA, valid for `validity_days`. rcgen cannot generate RSA
/// keys itself (ring has no RSA keygen), so the key pair comes from the
/// `rsa` crate and is handed to rcgen as PKCS#8 DER for signing.
fn generate_certificate(node_name: &str, validity_days: u32) -> Result<Certificate, Kind> {
    let mut osrng = rsa::rand_core::OsRng;
    let private_key = rsa::RsaPrivateKey::new(&mut osrng, 2048)
        .map_err(|e| Kind::CryptoError(format!("RSA keygen failed: {}", e)))?;
    let pkcs8_der = rsa::pkcs8::EncodePrivateKey::to_pkcs8_der(&private_key)
        .map_err(|e| Kind::CryptoError(format!("PKCS8 encode failed: {}", e)))?;

    let key_pair = KeyPair::from_der_and_sign_algo(pkcs8_der.as_bytes(), &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| Kind::CryptoError(format!("rcgen key pair: {}", e)))?;

    let mut params = CertificateParams::new(vec![node_name.to_string()])
        .map_err(|e| Kind::CryptoError(format!("cert params: {}", e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("AirDrop-{}", node_name));
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::DnsName(
        node_name
            .try_into()
            .unwrap_or_else(|_| "airdrop-device".try_into().unwrap()),
    )];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::days(validity_days as i64);

    let mut serial = [0u8; 15]; // 120 bits
    rand::thread_rng().fill_bytes(&mut serial);
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial));

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Kind::CryptoError(format!("self-signing failed: {}", e)))?;

    let cert_der = cert.der().to_vec();
    let key_der = pkcs8_der.as_bytes().to_vec();
    let thumbprint = thumbprint_of(&cert_der);

    Ok(Certificate {
        cert_der,
        key_der,
        thumbprint,
        not_before: now_unix(),
        not_after: now_unix() + validity_days as u64 * DAY_SECS,
    })
}

/// Owns the on-disk certificate/key pair for one installation. Single-writer
/// per §5: the store is the only component that ever writes these files.
pub struct IdentityStore {
    base_path: PathBuf,
    node_name: String,
    validity_days: u32,
    renewal_threshold_days: u32,
}

impl IdentityStore {
    pub fn new(
        storage_path: impl AsRef<Path>,
        node_name: impl Into<String>,
        validity_days: u32,
        renewal_threshold_days: u32,
    ) -> Self {
        Self {
            base_path: storage_path.as_ref().join(IDENTITY_DIR),
            node_name: node_name.into(),
            validity_days,
            renewal_threshold_days,
        }
    }

    fn cert_path(&self) -> PathBuf {
        self.base_path.join(CERT_FILE)
    }
    fn key_path(&self) -> PathBuf {
        self.base_path.join(KEY_FILE)
    }
    fn meta_path(&self) -> PathBuf {
        self.base_path.join(META_FILE)
    }

    fn load_from_disk(&self) -> Option<Certificate> {
        let cert_der = fs::read(self.cert_path()).ok()?;
        let key_der = fs::read(self.key_path()).ok()?;
        let meta_raw = fs::read_to_string(self.meta_path()).ok()?;
        let meta: CertMeta = serde_json::from_str(&meta_raw).ok()?;
        Some(Certificate {
            cert_der,
            key_der,
            thumbprint: meta.thumbprint,
            not_before: meta.not_before,
            not_after: meta.not_after,
        })
    }

    fn persist(&self, cert: &Certificate) -> Result<(), Kind> {
        fs::create_dir_all(&self.base_path)
            .map_err(|e| Kind::StoreUnavailable(e.to_string()))?;

        fs::write(self.cert_path(), &cert.cert_der).map_err(|e| Kind::StoreUnavailable(e.to_string()))?;

        {
            use std::io::Write;
            let mut f = fs::File::create(self.key_path())
                .map_err(|e| Kind::StoreUnavailable(e.to_string()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = f
                    .metadata()
                    .map_err(|e| Kind::StoreUnavailable(e.to_string()))?
                    .permissions();
                perms.set_mode(0o600);
                f.set_permissions(perms)
                    .map_err(|e| Kind::StoreUnavailable(e.to_string()))?;
            }
            f.write_all(&cert.key_der)
                .map_err(|e| Kind::StoreUnavailable(e.to_string()))?;
        }

        let meta = CertMeta {
            not_before: cert.not_before,
            not_after: cert.not_after,
            thumbprint: cert.thumbprint.clone(),
        };
        let meta_json =
            serde_json::to_string_pretty(&meta).map_err(|e| Kind::StoreUnavailable(e.to_string()))?;
        fs::write(self.meta_path(), meta_json).map_err(|e| Kind::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    fn needs_renewal(&self, cert: &Certificate) -> bool {
        let threshold = self.renewal_threshold_days as u64 * DAY_SECS;
        let now = now_unix();
        cert.not_after <= now || cert.not_after - now < threshold
    }

    /// Loads the newest matching cert; if absent, expired, or inside the
    /// renewal window, generates and persists a fresh one. Idempotent
    /// outside the renewal window.
    pub fn get_or_create_certificate(&self) -> Result<Certificate, Kind> {
        if let Some(existing) = self.load_from_disk() {
            if !self.needs_renewal(&existing) {
                return Ok(existing);
            }
            info!("certificate for {} is due for renewal, regenerating", self.node_name);
        }
        let fresh = generate_certificate(&self.node_name, self.validity_days)?;
        self.persist(&fresh)?;
        Ok(fresh)
    }

    /// Same logic as `get_or_create_certificate`, exposed separately since
    /// callers may want to force a renewal check without caring whether a
    /// cert already existed.
    pub fn renew_certificate(&self) -> Result<Certificate, Kind> {
        self.get_or_create_certificate()
    }
}

pub fn build_local_identity(
    cfg: &crate::core::config::IdentityConfig,
    store_path: impl AsRef<Path>,
    save_path: impl AsRef<Path>,
    node_name: &str,
    validity_days: u32,
    renewal_threshold_days: u32,
) -> Result<LocalIdentity, Kind> {
    let store = IdentityStore::new(store_path, node_name, validity_days, renewal_threshold_days);
    let certificate = store.get_or_create_certificate()?;
    let identity_hash = compute_identity_hash(&cfg.email, &cfg.phone);
    Ok(LocalIdentity {
        device_id: uuid::Uuid::new_v4(),
        display_name: cfg.display_name.clone().unwrap_or_else(|| node_name.to_string()),
        visibility: cfg.visibility,
        save_dir: save_path.as_ref().to_path_buf(),
        email: cfg.email.clone(),
        phone: cfg.phone.clone(),
        identity_hash,
        certificate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hash_matches_sha256_of_concatenation() {
        let h = compute_identity_hash("alice@example.com", "+15551234567");
        assert_eq!(h.len(), 64);
        let mut hasher = Sha256::new();
        hasher.update(b"alice@example.com");
        hasher.update(b"+15551234567");
        assert_eq!(h, hex::encode(hasher.finalize()));
    }

    #[test]
    fn identity_hash_handles_empty_strings() {
        let h = compute_identity_hash("", "");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hex::encode(Sha256::digest(b"")));
    }

    #[test]
    fn cert_renewal_triggers_within_threshold_window() {
        let dir = std::env::temp_dir().join(format!("opendrop-identity-test-{}", uuid::Uuid::new_v4()));
        let store = IdentityStore::new(&dir, "test-node", 365, 30);

        let first = store.get_or_create_certificate().unwrap();

        // Simulate a cert close to expiry by writing back meta with a near
        // expiry, then confirm the next call regenerates and changes the
        // thumbprint.
        let meta = CertMeta {
            not_before: first.not_before,
            not_after: now_unix() + 10 * DAY_SECS,
            thumbprint: first.thumbprint.clone(),
        };
        std::fs::write(
            store.meta_path(),
            serde_json::to_string_pretty(&meta).unwrap(),
        )
        .unwrap();

        let renewed = store.get_or_create_certificate().unwrap();
        assert!(renewed.not_after >= now_unix() + 365 * DAY_SECS - 3600);
        assert_ne!(renewed.thumbprint, first.thumbprint);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
