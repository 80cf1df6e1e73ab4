use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Address the serving side binds to
    pub bind_address: String,

    /// Port to listen on for incoming pairings (0 lets the OS pick)
    pub listen_port: u16,

    /// Host written into the pairing descriptor; falls back to the bound address
    pub advertised_host: Option<String>,

    /// Interface whose address is advertised when bound to a wildcard address
    pub advertised_interface: Option<String>,

    /// Wi-Fi network the serving device is on, carried in the descriptor
    pub wifi_ssid: Option<String>,

    /// Also accept peers without the descriptor's key (typed-in host and
    /// port); both users must then confirm the comparison phrase
    pub allow_manual_pairing: bool,

    /// Read poll interval while idle, also the cancellation check period
    pub idle_poll_interval_ms: u64,

    /// Read timeout once a frame has started arriving
    pub transfer_timeout_ms: u64,

    pub connect_timeout_ms: u64,

    pub handshake_timeout_ms: u64,

    /// Largest encrypted frame accepted from a peer
    pub max_frame_len: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            listen_port: 1336,
            advertised_host: None,
            advertised_interface: None,
            wifi_ssid: None,
            allow_manual_pairing: false,
            idle_poll_interval_ms: 500,
            transfer_timeout_ms: 2000,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 5000,
            max_frame_len: 10 * 1024 * 1024, // 10 MiB
        }
    }
}

impl TransferConfig {
    /// Load from a JSON file, falling back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, TransferError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .map_err(|e| TransferError::Setup(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&json)
            .map_err(|e| TransferError::Setup(format!("parsing {}: {e}", path.display())))
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let cfg = TransferConfig::load_or_default(&temp.path().join("config.json")).unwrap();
        assert_eq!(cfg.listen_port, 1336);
        assert_eq!(cfg.idle_poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.transfer_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{ "listen_port": 7000, "wifi_ssid": "lab" }"#).unwrap();

        let cfg = TransferConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg.listen_port, 7000);
        assert_eq!(cfg.wifi_ssid.as_deref(), Some("lab"));
        assert!(!cfg.allow_manual_pairing);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:7000");
    }

    #[test]
    fn broken_file_is_a_setup_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            TransferConfig::load_or_default(&path),
            Err(TransferError::Setup(_))
        ));
    }
}
