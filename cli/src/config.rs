// Configuration management for the wifiprov CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/wifiprov/config.json
// - Linux: ~/.config/wifiprov/config.json
// - Windows: %APPDATA%\wifiprov\config.json
//
// Secrets (proof of possession, Wi-Fi passphrase) are never stored here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wifiprov_core::{SecurityType, TransportKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport used when a command does not name one
    pub transport: String,

    /// Only devices whose advertised name starts with this are listed
    pub device_prefix: String,

    /// Security scheme used when a command does not name one
    pub security: String,

    /// Discovery length in seconds
    pub scan_timeout: u64,

    /// Per round-trip timeout in seconds
    pub request_timeout: u64,

    /// SoftAP settings
    pub softap: SoftApConfig,

    /// BLE settings
    pub ble: BleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftApConfig {
    /// Device HTTP server, host:port
    pub host: String,

    /// Name reported for the access point the host has joined
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BleConfig {
    /// Provisioning service UUID override
    pub service_uuid: Option<String>,

    /// Extra endpoint names registered after the standard ones
    pub custom_endpoints: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: "ble".to_string(),
            device_prefix: "PROV_".to_string(),
            security: "secure-v2".to_string(),
            scan_timeout: 5,
            request_timeout: 5,
            softap: SoftApConfig::default(),
            ble: BleConfig::default(),
        }
    }
}

impl Default for SoftApConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1:80".to_string(),
            device_name: "PROV_SOFTAP".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("wifiprov");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, or defaults if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        serde_json::from_str(&contents).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn transport_kind(&self) -> Result<TransportKind> {
        self.transport
            .parse()
            .with_context(|| format!("Invalid transport in config: {}", self.transport))
    }

    pub fn security_type(&self) -> Result<SecurityType> {
        self.security
            .parse()
            .with_context(|| format!("Invalid security scheme in config: {}", self.security))
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_timeout)
    }

    pub fn request_duration(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Set a config value. Values are checked before they are stored.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "transport" => {
                value
                    .parse::<TransportKind>()
                    .context("Invalid transport (ble or softap)")?;
                self.transport = value.to_ascii_lowercase();
            }
            "device_prefix" => self.device_prefix = value.to_string(),
            "security" => {
                value
                    .parse::<SecurityType>()
                    .context("Invalid security scheme (none, secure-v1, secure-v2)")?;
                self.security = value.to_ascii_lowercase();
            }
            "scan_timeout" => {
                self.scan_timeout = parse_seconds(value)?;
            }
            "request_timeout" => {
                self.request_timeout = parse_seconds(value)?;
            }
            "softap_host" => self.softap.host = value.to_string(),
            "softap_device_name" => self.softap.device_name = value.to_string(),
            "ble_service_uuid" => {
                self.ble.service_uuid = if value.is_empty() {
                    None
                } else {
                    uuid::Uuid::parse_str(value).context("Invalid UUID")?;
                    Some(value.to_string())
                };
            }
            "ble_custom_endpoints" => {
                self.ble.custom_endpoints = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "transport" => Some(self.transport.clone()),
            "device_prefix" => Some(self.device_prefix.clone()),
            "security" => Some(self.security.clone()),
            "scan_timeout" => Some(self.scan_timeout.to_string()),
            "request_timeout" => Some(self.request_timeout.to_string()),
            "softap_host" => Some(self.softap.host.clone()),
            "softap_device_name" => Some(self.softap.device_name.clone()),
            "ble_service_uuid" => self.ble.service_uuid.clone(),
            "ble_custom_endpoints" => Some(self.ble.custom_endpoints.join(",")),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("transport".to_string(), self.transport.clone()),
            ("device_prefix".to_string(), self.device_prefix.clone()),
            ("security".to_string(), self.security.clone()),
            ("scan_timeout".to_string(), format!("{}s", self.scan_timeout)),
            ("request_timeout".to_string(), format!("{}s", self.request_timeout)),
            ("softap_host".to_string(), self.softap.host.clone()),
            ("softap_device_name".to_string(), self.softap.device_name.clone()),
            (
                "ble_service_uuid".to_string(),
                self.ble
                    .service_uuid
                    .clone()
                    .unwrap_or_else(|| "(default)".to_string()),
            ),
            (
                "ble_custom_endpoints".to_string(),
                if self.ble.custom_endpoints.is_empty() {
                    "(none)".to_string()
                } else {
                    self.ble.custom_endpoints.join(",")
                },
            ),
        ]
    }
}

fn parse_seconds(value: &str) -> Result<u64> {
    let secs: u64 = value.parse().context("Invalid number of seconds")?;
    if secs == 0 {
        anyhow::bail!("Timeout must be at least one second");
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport_kind().unwrap(), TransportKind::Ble);
        assert_eq!(config.security_type().unwrap(), SecurityType::SecureV2);
        assert_eq!(config.device_prefix, "PROV_");
        assert_eq!(config.softap.host, "192.168.4.1:80");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.scan_timeout, 5);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.set("transport", "SoftAP").unwrap();
        config.set("ble_custom_endpoints", "custom-data, diag").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.transport_kind().unwrap(), TransportKind::SoftAp);
        assert_eq!(reloaded.ble.custom_endpoints, vec!["custom-data", "diag"]);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"device_prefix":"ESP_"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.device_prefix, "ESP_");
        assert_eq!(config.security, "secure-v2");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        assert!(config.set("transport", "zigbee").is_err());
        assert!(config.set("security", "sec9").is_err());
        assert!(config.set("scan_timeout", "0").is_err());
        assert!(config.set("ble_service_uuid", "not-a-uuid").is_err());
        assert!(config.set("pop", "abcd1234").is_err());
        assert_eq!(config.transport, "ble");
    }

    #[test]
    fn test_saved_file_holds_no_secrets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        Config::default().save_to(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("pop"));
        assert!(!contents.contains("passphrase"));
    }

    #[test]
    fn test_get_matches_list_keys() {
        let config = Config::default();
        for (key, _) in config.list() {
            if key != "ble_service_uuid" {
                assert!(config.get(&key).is_some(), "missing getter for {}", key);
            }
        }
    }
}
