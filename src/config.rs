// Connection configuration
// Loaded once at boot through a fallback chain: compiled-in override (bring-up
// feature, loudly logged) > persisted JSON store > empty defaults. Read-only
// for the rest of the process lifetime.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BROKER_PORT: u16 = 8883;

/// Wi-Fi and broker credentials plus endpoint settings.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub link_name: String,
    pub link_secret: String,
    pub broker_host: String,
    pub broker_user: String,
    pub broker_secret: String,
    pub broker_port: u16,
    pub broker_use_tls: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            link_name: String::new(),
            link_secret: String::new(),
            broker_host: String::new(),
            broker_user: String::new(),
            broker_secret: String::new(),
            broker_port: DEFAULT_BROKER_PORT,
            broker_use_tls: false,
        }
    }
}

// Secrets must never leak through Debug formatting into a log sink.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("link_name", &self.link_name)
            .field("link_secret", &mask(&self.link_secret))
            .field("broker_host", &self.broker_host)
            .field("broker_user", &self.broker_user)
            .field("broker_secret", &mask(&self.broker_secret))
            .field("broker_port", &self.broker_port)
            .field("broker_use_tls", &self.broker_use_tls)
            .finish()
    }
}

/// Fixed mask for secret values in logs: presence only, never content.
pub fn mask(secret: &str) -> &'static str {
    if secret.is_empty() {
        "(empty)"
    } else {
        "******"
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config store unavailable: {0}")]
    ConfigUnavailable(String),
}

// Persisted document shape, kept field-compatible with the historical
// sensitiveData.json store.
#[derive(Serialize, Deserialize)]
struct StoredSettings {
    wifi: WifiSection,
    mqtt: MqttSection,
}

#[derive(Serialize, Deserialize)]
struct WifiSection {
    #[serde(rename = "wifiSSID")]
    ssid: String,
    #[serde(rename = "wifiPass")]
    pass: String,
}

#[derive(Serialize, Deserialize)]
struct MqttSection {
    #[serde(rename = "mqttUrl")]
    url: String,
    #[serde(rename = "mqttUser")]
    user: String,
    #[serde(rename = "mqttPass")]
    pass: String,
    #[serde(rename = "mqttPort")]
    port: u16,
    #[serde(rename = "mqttTls")]
    tls: bool,
}

impl From<StoredSettings> for ConnectionConfig {
    fn from(stored: StoredSettings) -> Self {
        Self {
            link_name: stored.wifi.ssid,
            link_secret: stored.wifi.pass,
            broker_host: stored.mqtt.url,
            broker_user: stored.mqtt.user,
            broker_secret: stored.mqtt.pass,
            broker_port: stored.mqtt.port,
            broker_use_tls: stored.mqtt.tls,
        }
    }
}

impl From<&ConnectionConfig> for StoredSettings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            wifi: WifiSection {
                ssid: config.link_name.clone(),
                pass: config.link_secret.clone(),
            },
            mqtt: MqttSection {
                url: config.broker_host.clone(),
                user: config.broker_user.clone(),
                pass: config.broker_secret.clone(),
                port: config.broker_port,
                tls: config.broker_use_tls,
            },
        }
    }
}

pub struct ConfigLoader {
    store_path: PathBuf,
    builtin_override: Option<ConnectionConfig>,
}

impl ConfigLoader {
    pub fn new(store_path: impl Into<PathBuf>, builtin_override: Option<ConnectionConfig>) -> Self {
        Self {
            store_path: store_path.into(),
            builtin_override,
        }
    }

    /// Resolve the effective configuration. Never fails: every problem short
    /// of an active override degrades to empty defaults with a warning.
    pub fn load(&self) -> ConnectionConfig {
        if let Some(builtin) = &self.builtin_override {
            // Bring-up bypass of the persisted store. This must be impossible
            // to miss in a log capture, hence warn on every single load.
            warn!("⚠️ INSECURE built-in credential override ACTIVE - persisted settings are bypassed");
            warn!("⚠️ built-in override link_name={} secret={}", builtin.link_name, mask(&builtin.link_secret));
            return builtin.clone();
        }

        match self.read_store() {
            Ok(config) => {
                info!(
                    "✅ connection config loaded. link_name={} broker_host={}:{} tls={}",
                    config.link_name, config.broker_host, config.broker_port, config.broker_use_tls
                );
                config
            }
            Err(e) => {
                warn!("⚠️ {e}, falling back to empty defaults");
                ConnectionConfig::default()
            }
        }
    }

    fn read_store(&self) -> Result<ConnectionConfig, ConfigError> {
        let raw = fs::read_to_string(&self.store_path).map_err(|e| {
            ConfigError::ConfigUnavailable(format!(
                "read {} failed: {e}",
                self.store_path.display()
            ))
        })?;
        let stored: StoredSettings = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::ConfigUnavailable(format!(
                "parse {} failed: {e}",
                self.store_path.display()
            ))
        })?;
        Ok(stored.into())
    }

    /// Seed the persisted store with an empty default document if missing,
    /// so later saves have a well-formed file to update.
    pub fn ensure_default_file(&self) -> Result<(), ConfigError> {
        if self.store_path.exists() {
            return Ok(());
        }
        write_store(&self.store_path, &ConnectionConfig::default())
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }
}

fn write_store(path: &Path, config: &ConnectionConfig) -> Result<(), ConfigError> {
    let document = StoredSettings::from(config);
    let raw = serde_json::to_string(&document)
        .map_err(|e| ConfigError::ConfigUnavailable(format!("serialize failed: {e}")))?;
    fs::write(path, raw).map_err(|e| {
        ConfigError::ConfigUnavailable(format!("write {} failed: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("esp32lab-config-{name}-{}", std::process::id()));
        path
    }

    #[test]
    fn missing_store_falls_back_to_empty_defaults() {
        let loader = ConfigLoader::new(temp_store("missing"), None);
        let config = loader.load();
        assert_eq!(config, ConnectionConfig::default());
        assert_eq!(config.broker_port, DEFAULT_BROKER_PORT);
        assert!(!config.broker_use_tls);
    }

    #[test]
    fn persisted_store_round_trips() {
        let path = temp_store("roundtrip");
        let expected = ConnectionConfig {
            link_name: "lab-ap".into(),
            link_secret: "hunter2".into(),
            broker_host: "10.0.0.5".into(),
            broker_user: "device".into(),
            broker_secret: "brokerpw".into(),
            broker_port: 1883,
            broker_use_tls: false,
        };
        write_store(&path, &expected).unwrap();

        let loader = ConfigLoader::new(&path, None);
        assert_eq!(loader.load(), expected);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn builtin_override_wins_over_persisted_store() {
        let path = temp_store("override");
        write_store(&path, &ConnectionConfig { link_name: "persisted".into(), ..Default::default() })
            .unwrap();

        let builtin = ConnectionConfig { link_name: "builtin".into(), ..Default::default() };
        let loader = ConfigLoader::new(&path, Some(builtin.clone()));
        assert_eq!(loader.load(), builtin);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn ensure_default_file_seeds_a_parsable_document() {
        let path = temp_store("seed");
        fs::remove_file(&path).ok();

        let loader = ConfigLoader::new(&path, None);
        loader.ensure_default_file().unwrap();
        assert_eq!(loader.load(), ConnectionConfig::default());

        // A second call must leave the existing file alone.
        loader.ensure_default_file().unwrap();
        fs::remove_file(&path).ok();
    }

    #[test]
    fn debug_formatting_masks_both_secrets() {
        let config = ConnectionConfig {
            link_secret: "wifi-secret".into(),
            broker_secret: "broker-secret".into(),
            ..Default::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("wifi-secret"));
        assert!(!rendered.contains("broker-secret"));
        assert!(rendered.contains("******"));
    }
}
