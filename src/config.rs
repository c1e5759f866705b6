use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::storage::SettingsStore;

const KEY_ENABLED: &str = "enabled";
const KEY_INTERVAL_SECONDS: &str = "interval_seconds";
const KEY_SERVER_URL: &str = "server_url";
const KEY_SECRET_KEY: &str = "secret_key";
const KEY_TARGET_SIZE_KB: &str = "target_size_kb";
const KEY_SCREEN_ON_PUSH: &str = "screen_on_push";
const KEY_SCREEN_OFF_PUSH: &str = "screen_off_push";
const KEY_AUTO_START: &str = "auto_start";

pub const TARGET_SIZE_100KB: i64 = 100;
pub const TARGET_SIZE_500KB: i64 = 500;
pub const TARGET_SIZE_1MB: i64 = 1024;
pub const TARGET_SIZE_NO_COMPRESS: i64 = 0;
const DEFAULT_TARGET_SIZE_KB: i64 = TARGET_SIZE_100KB;

/// Process-level settings for the agent binary, read from the environment on
/// every boot.
#[derive(Debug, Serialize, Clone)]
pub struct AgentConfig {
    pub db_path: PathBuf,
    pub simulated_cameras: u64,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Seeds written into the store on boot when present.
    pub endpoint: Option<String>,
    #[serde(skip)]
    pub secret: Option<String>,
    pub interval_secs: Option<u64>,
    pub target_size_kb: Option<i64>,
    pub auto_start: Option<bool>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let db_path = env::var("HEARTBEAT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("heartbeat.db"));

        Ok(AgentConfig {
            db_path,
            simulated_cameras: get_env_var_u64("SIMULATED_CAMERAS", 4),
            frame_width: get_env_var_u32("FRAME_WIDTH", 640),
            frame_height: get_env_var_u32("FRAME_HEIGHT", 360),
            endpoint: env::var("HEARTBEAT_ENDPOINT").ok(),
            secret: env::var("HEARTBEAT_SECRET").ok(),
            interval_secs: env::var("HEARTBEAT_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()),
            target_size_kb: env::var("HEARTBEAT_TARGET_KB").ok().and_then(|v| v.parse().ok()),
            auto_start: env::var("HEARTBEAT_AUTO_START").ok().map(|v| v == "1" || v == "true"),
        })
    }

    fn config_dir() -> PathBuf {
        PathBuf::from(env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string()))
    }

    pub fn file_path() -> PathBuf {
        Self::config_dir().join("agent_config.json")
    }

    /// Writes the effective settings to `path` for inspection. The secret is
    /// never written.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    /// Writes the env-provided seeds into the heartbeat settings.
    pub fn apply_seeds(&self, store: &SettingsStore) -> Result<()> {
        let mut hb = HeartbeatConfig::load(store)?;
        if let Some(endpoint) = &self.endpoint {
            hb.endpoint = endpoint.clone();
        }
        if let Some(secret) = &self.secret {
            hb.secret = secret.clone();
        }
        if let Some(secs) = self.interval_secs {
            hb.interval = PushInterval::from_secs(secs);
        }
        if let Some(kb) = self.target_size_kb {
            hb.target_size_kb = kb;
        }
        if let Some(auto_start) = self.auto_start {
            hb.auto_start = auto_start;
        }
        hb.save(store)
    }
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

fn get_env_var_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PushInterval {
    Secs30,
    #[default]
    Secs60,
    Secs120,
    Secs300,
}

impl PushInterval {
    /// Unknown values fall back to the one-minute default.
    pub fn from_secs(secs: u64) -> Self {
        match secs {
            30 => PushInterval::Secs30,
            60 => PushInterval::Secs60,
            120 => PushInterval::Secs120,
            300 => PushInterval::Secs300,
            _ => PushInterval::default(),
        }
    }

    pub fn as_secs(self) -> u64 {
        match self {
            PushInterval::Secs30 => 30,
            PushInterval::Secs60 => 60,
            PushInterval::Secs120 => 120,
            PushInterval::Secs300 => 300,
        }
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    pub fn display_name(self) -> &'static str {
        match self {
            PushInterval::Secs30 => "30 seconds",
            PushInterval::Secs60 => "1 minute (recommended)",
            PushInterval::Secs120 => "2 minutes",
            PushInterval::Secs300 => "5 minutes",
        }
    }
}

pub fn target_size_display_name(size_kb: i64) -> String {
    match size_kb {
        TARGET_SIZE_100KB => "100KB (data saver)".to_string(),
        TARGET_SIZE_500KB => "500KB".to_string(),
        TARGET_SIZE_1MB => "1MB".to_string(),
        kb if kb <= TARGET_SIZE_NO_COMPRESS => "no compression (original quality)".to_string(),
        kb => format!("{}KB", kb),
    }
}

/// Heartbeat settings as persisted in the [`SettingsStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval: PushInterval,
    pub endpoint: String,
    pub secret: String,
    pub target_size_kb: i64,
    pub screen_on_push: bool,
    pub screen_off_push: bool,
    pub auto_start: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            enabled: false,
            interval: PushInterval::default(),
            endpoint: String::new(),
            secret: String::new(),
            target_size_kb: DEFAULT_TARGET_SIZE_KB,
            screen_on_push: true,
            screen_off_push: false,
            auto_start: false,
        }
    }
}

impl HeartbeatConfig {
    pub fn load(store: &SettingsStore) -> Result<Self> {
        let defaults = HeartbeatConfig::default();
        let interval = store.get_i64(KEY_INTERVAL_SECONDS, defaults.interval.as_secs() as i64)?;
        Ok(HeartbeatConfig {
            enabled: store.get_bool(KEY_ENABLED, defaults.enabled)?,
            interval: PushInterval::from_secs(interval.max(0) as u64),
            endpoint: store.get_string(KEY_SERVER_URL)?,
            secret: store.get_string(KEY_SECRET_KEY)?,
            target_size_kb: store.get_i64(KEY_TARGET_SIZE_KB, defaults.target_size_kb)?,
            screen_on_push: store.get_bool(KEY_SCREEN_ON_PUSH, defaults.screen_on_push)?,
            screen_off_push: store.get_bool(KEY_SCREEN_OFF_PUSH, defaults.screen_off_push)?,
            auto_start: store.get_bool(KEY_AUTO_START, defaults.auto_start)?,
        })
    }

    pub fn save(&self, store: &SettingsStore) -> Result<()> {
        store.set_bool(KEY_ENABLED, self.enabled)?;
        store.set_i64(KEY_INTERVAL_SECONDS, self.interval.as_secs() as i64)?;
        store.set(KEY_SERVER_URL, &self.endpoint)?;
        store.set(KEY_SECRET_KEY, &self.secret)?;
        store.set_i64(KEY_TARGET_SIZE_KB, self.target_size_kb)?;
        store.set_bool(KEY_SCREEN_ON_PUSH, self.screen_on_push)?;
        store.set_bool(KEY_SCREEN_OFF_PUSH, self.screen_off_push)?;
        store.set_bool(KEY_AUTO_START, self.auto_start)?;
        debug!(
            enabled = self.enabled,
            interval = self.interval.as_secs(),
            target_size_kb = self.target_size_kb,
            "Heartbeat config saved"
        );
        Ok(())
    }

    /// Single-field write used when auto-start flips the service on.
    pub fn persist_enabled(store: &SettingsStore, enabled: bool) -> Result<()> {
        store.set_bool(KEY_ENABLED, enabled)
    }

    pub fn has_endpoint(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }

    pub fn has_secret(&self) -> bool {
        !self.secret.trim().is_empty()
    }

    pub fn is_configured(&self) -> bool {
        self.has_endpoint() && self.has_secret()
    }

    pub fn config_status(&self) -> &'static str {
        if !self.has_endpoint() {
            "server address not configured"
        } else if !self.has_secret() {
            "secret not configured"
        } else {
            "configured"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_store_is_empty() {
        let store = SettingsStore::open_in_memory().unwrap();
        let cfg = HeartbeatConfig::load(&store).unwrap();
        assert_eq!(cfg, HeartbeatConfig::default());
        assert!(!cfg.is_configured());
        assert_eq!(cfg.config_status(), "server address not configured");
    }

    #[test]
    fn save_then_load_keeps_every_field() {
        let store = SettingsStore::open_in_memory().unwrap();
        let cfg = HeartbeatConfig {
            enabled: true,
            interval: PushInterval::Secs300,
            endpoint: "https://hb.example.com/push".into(),
            secret: "s3cret".into(),
            target_size_kb: TARGET_SIZE_500KB,
            screen_on_push: false,
            screen_off_push: true,
            auto_start: true,
        };
        cfg.save(&store).unwrap();
        assert_eq!(HeartbeatConfig::load(&store).unwrap(), cfg);
    }

    #[test]
    fn blank_secret_is_not_configured() {
        let cfg = HeartbeatConfig {
            endpoint: "https://hb.example.com".into(),
            secret: "   ".into(),
            ..HeartbeatConfig::default()
        };
        assert!(!cfg.is_configured());
        assert_eq!(cfg.config_status(), "secret not configured");
    }

    #[test]
    fn agent_config_file_omits_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent_config.json");
        let config = AgentConfig {
            db_path: dir.path().join("heartbeat.db"),
            simulated_cameras: 2,
            frame_width: 640,
            frame_height: 360,
            endpoint: Some("https://hb.example.com/push".into()),
            secret: Some("s3cret".into()),
            interval_secs: Some(120),
            target_size_kb: None,
            auto_start: Some(true),
        };
        config.save_to_file(&path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(!written.contains("s3cret"));
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["endpoint"], "https://hb.example.com/push");
        assert_eq!(value["interval_secs"], 120);
        assert!(value.get("secret").is_none());
    }

    #[test]
    fn oversized_frame_dimension_falls_back_to_default() {
        // u32::MAX + 1 must not wrap to 0
        env::set_var("HEARTBEAT_TEST_FRAME_DIM", "4294967296");
        assert_eq!(get_env_var_u32("HEARTBEAT_TEST_FRAME_DIM", 640), 640);
        env::set_var("HEARTBEAT_TEST_FRAME_DIM", "1280");
        assert_eq!(get_env_var_u32("HEARTBEAT_TEST_FRAME_DIM", 640), 1280);
        env::remove_var("HEARTBEAT_TEST_FRAME_DIM");
    }

    #[test]
    fn unknown_interval_falls_back_to_default() {
        assert_eq!(PushInterval::from_secs(45), PushInterval::Secs60);
        assert_eq!(PushInterval::from_secs(120).as_secs(), 120);
        assert_eq!(target_size_display_name(0), "no compression (original quality)");
        assert_eq!(target_size_display_name(250), "250KB");
    }
}
