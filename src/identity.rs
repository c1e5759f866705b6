use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::fs;
use tracing::info;

use crate::storage::SettingsStore;

pub const DEVICE_ID_PREFIX: &str = "EV-";
pub const KEY_DEVICE_ID: &str = "vehicle_id";

/// Immutable hardware characteristics the device id is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCharacteristics {
    pub hardware_id: String,
    pub fingerprint: String,
    pub board: String,
    pub device: String,
    pub hardware: String,
}

impl DeviceCharacteristics {
    /// Reads the characteristics of the host, allowing env overrides so a
    /// simulated fleet can pin distinct identities.
    pub fn detect() -> Self {
        let hardware_id = env::var("DEVICE_HARDWARE_ID").unwrap_or_else(|_| {
            fs::read_to_string("/etc/machine-id")
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        });
        let hostname = fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        DeviceCharacteristics {
            hardware_id,
            fingerprint: env::var("DEVICE_FINGERPRINT")
                .unwrap_or_else(|_| format!("{}/{}", env::consts::OS, env::consts::ARCH)),
            board: env::var("DEVICE_BOARD").unwrap_or_default(),
            device: env::var("DEVICE_NAME").unwrap_or(hostname),
            hardware: env::var("DEVICE_HARDWARE").unwrap_or_else(|_| env::consts::ARCH.to_string()),
        }
    }
}

/// `EV-` + first 4 bytes of SHA-256 over the concatenated characteristics,
/// as uppercase hex.
pub fn derive_device_id(chars: &DeviceCharacteristics) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chars.hardware_id.as_bytes());
    hasher.update(chars.fingerprint.as_bytes());
    hasher.update(chars.board.as_bytes());
    hasher.update(chars.device.as_bytes());
    hasher.update(chars.hardware.as_bytes());
    let digest = hasher.finalize();
    format!("{}{}", DEVICE_ID_PREFIX, hex::encode_upper(&digest[..4]))
}

/// Makes sure the persisted id matches what this hardware derives to,
/// rewriting it when it drifted (cleared data, copied store, ...).
pub fn ensure_device_id(store: &SettingsStore, chars: &DeviceCharacteristics) -> Result<String> {
    let expected = derive_device_id(chars);
    let saved = store.get_string(KEY_DEVICE_ID)?;
    if saved != expected {
        store.set(KEY_DEVICE_ID, &expected)?;
        info!(device_id = %expected, previous = %saved, "Device id initialized");
    }
    Ok(expected)
}
