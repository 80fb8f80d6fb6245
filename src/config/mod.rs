//! # Configuration
//!
//! TOML configuration for the transport engine. Every section is optional in
//! the file; missing sections and keys fall back to the defaults below, which
//! match a MeshCore companion radio on a USB serial port.
//!
//! ## Sections
//!
//! - [`MeshCoreConfig`] - serial device, handshake, watchdog and reconnect
//! - [`DeliveryConfig`] - payload size, ack wait, retries, pacing, chunking
//! - [`DedupConfig`] - duplicate suppression window
//! - [`SessionConfig`] - inactivity timeout for the in-process session manager
//! - [`StorageConfig`] - where the node directory is persisted
//! - [`LoggingConfig`] - log level and files
//!
//! ## Example
//!
//! ```toml
//! [meshcore]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! node_name = "Mesh-Citadel BBS"
//!
//! [delivery]
//! max_payload = 140
//! ack_timeout_ms = 8000
//! max_retries = 3
//!
//! [dedup]
//! window_secs = 30
//! ```
//!
//! ```rust,no_run
//! use meshcitadel::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("radio on {}", config.meshcore.port);
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::meshcore::framer::MAX_FRAME_PAYLOAD;
use crate::meshcore::protocol::SEND_TEXT_OVERHEAD;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub meshcore: MeshCoreConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshCoreConfig {
    /// Serial device path of the companion radio.
    pub port: String,
    pub baud_rate: u32,
    /// Advertised node name; left unchanged on the device when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Name sent with the application-start command.
    pub app_name: String,
    /// Highest companion protocol version this host speaks.
    pub protocol_version: u8,
    /// Maximum frame payload accepted from or written to the device.
    pub max_frame_size: usize,
    /// Bounded wait for each handshake response.
    pub handshake_timeout_secs: u64,
    /// Bounded wait for any other command response.
    pub command_timeout_secs: u64,
    /// Link restarts if no frame is parsed for this long.
    pub watchdog_interval_secs: u64,
    /// Idle time after which a keepalive is written.
    pub keepalive_interval_secs: u64,
    pub reconnect_base_secs: u64,
    pub reconnect_max_secs: u64,
    /// Consecutive failed connects before the link is declared dead.
    pub max_reconnect_attempts: u32,
    /// Hours between self-advertisements; 0 disables them.
    pub advert_interval_hours: u64,
    pub advert_flood: bool,
    /// Push the host clock to the device during the handshake.
    pub sync_time: bool,
    /// Keep the radio's contact table in manual-add mode and add
    /// advertising chat nodes from the host.
    pub manage_contacts: bool,
    /// Contact table size; 0 uses the size the device reports.
    pub max_device_contacts: usize,
    /// Free slots kept in the contact table before the oldest is evicted.
    pub contact_limit_buffer: usize,
}

impl Default for MeshCoreConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            node_name: None,
            app_name: "meshcitadel".to_string(),
            protocol_version: 3,
            max_frame_size: MAX_FRAME_PAYLOAD,
            handshake_timeout_secs: 5,
            command_timeout_secs: 10,
            watchdog_interval_secs: 180,
            keepalive_interval_secs: 60,
            reconnect_base_secs: 2,
            reconnect_max_secs: 60,
            max_reconnect_attempts: 10,
            advert_interval_hours: 6,
            advert_flood: false,
            sync_time: true,
            manage_contacts: true,
            max_device_contacts: 0,
            contact_limit_buffer: 10,
        }
    }
}

impl MeshCoreConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
    pub fn advert_interval(&self) -> Option<Duration> {
        (self.advert_interval_hours > 0).then(|| Duration::from_secs(self.advert_interval_hours * 3600))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Usable text bytes per transmitted chunk.
    pub max_payload: usize,
    pub ack_timeout_ms: u64,
    /// Retries after the first transmission before a unit is abandoned.
    pub max_retries: u32,
    /// Multiplier applied to the ack deadline on each retry.
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
    /// Direct attempts before the route is reset and the unit floods;
    /// 0 never floods.
    pub flood_after: u32,
    /// Flooded attempts allowed before the unit is abandoned; 0 leaves
    /// only `max_retries`.
    pub max_flood_attempts: u32,
    /// Pause between consecutive chunks of one session.
    pub inter_packet_delay_ms: u64,
    /// Append `[i/n]` to multi-chunk replies.
    pub chunk_markers: bool,
    /// Inbound text that cancels the session's pending output.
    pub cancel_keyword: String,
    /// Prefix multi-envelope replies with a count and the cancel hint.
    pub announce_multi_reply: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_payload: 140,
            ack_timeout_ms: 8000,
            max_retries: 3,
            backoff_factor: 2.0,
            max_backoff_ms: 60_000,
            flood_after: 2,
            max_flood_attempts: 3,
            inter_packet_delay_ms: 500,
            chunk_markers: false,
            cancel_keyword: "stop".to_string(),
            announce_multi_reply: true,
        }
    }
}

impl DeliveryConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
    pub fn inter_packet_delay(&self) -> Duration {
        Duration::from_millis(self.inter_packet_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle seconds before a session is logged out.
    pub timeout_secs: u64,
    /// How often the engine checks sessions for expiry.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Node directory file; relative paths resolve under `data_dir`.
    pub node_cache_file: String,
    pub node_cache_max_age_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            node_cache_file: "node_cache.json".to_string(),
            node_cache_max_age_days: 30,
        }
    }
}

impl StorageConfig {
    pub fn node_cache_path(&self) -> std::path::PathBuf {
        let file = std::path::Path::new(&self.node_cache_file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            std::path::Path::new(&self.data_dir).join(file)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Separate file for `security` target records (credential routing).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            security_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Command-line port takes precedence over the file.
    pub fn override_port(&mut self, port: Option<String>) {
        if let Some(port) = port {
            self.meshcore.port = port;
        }
    }

    /// Reject combinations the link cannot honour.
    pub fn validate(&self) -> Result<()> {
        let mc = &self.meshcore;
        if mc.port.trim().is_empty() {
            return Err(anyhow!("meshcore.port must name a serial device"));
        }
        if mc.max_frame_size == 0 || mc.max_frame_size > MAX_FRAME_PAYLOAD {
            return Err(anyhow!(
                "meshcore.max_frame_size must be between 1 and {}",
                MAX_FRAME_PAYLOAD
            ));
        }
        let d = &self.delivery;
        if d.max_payload == 0 || d.max_payload + SEND_TEXT_OVERHEAD > mc.max_frame_size {
            return Err(anyhow!(
                "delivery.max_payload {} does not fit a {}-byte frame ({} bytes of command overhead)",
                d.max_payload,
                mc.max_frame_size,
                SEND_TEXT_OVERHEAD
            ));
        }
        if d.ack_timeout_ms == 0 {
            return Err(anyhow!("delivery.ack_timeout_ms must be greater than zero"));
        }
        if !(d.backoff_factor >= 1.0) {
            return Err(anyhow!("delivery.backoff_factor must be at least 1.0"));
        }
        if mc.manage_contacts
            && mc.max_device_contacts > 0
            && mc.contact_limit_buffer >= mc.max_device_contacts
        {
            return Err(anyhow!(
                "meshcore.contact_limit_buffer must be smaller than max_device_contacts"
            ));
        }
        if self.dedup.window_secs == 0 || self.dedup.sweep_interval_secs == 0 {
            return Err(anyhow!("dedup window and sweep interval must be greater than zero"));
        }
        if mc.handshake_timeout_secs == 0 || mc.watchdog_interval_secs == 0 {
            return Err(anyhow!("meshcore handshake and watchdog timeouts must be greater than zero"));
        }
        if mc.keepalive_interval_secs >= mc.watchdog_interval_secs {
            return Err(anyhow!(
                "meshcore.keepalive_interval_secs must be shorter than watchdog_interval_secs"
            ));
        }
        if self.session.timeout_secs == 0 || self.session.sweep_interval_secs == 0 {
            return Err(anyhow!("session timeout and sweep interval must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delivery.max_payload, 140);
        assert_eq!(config.dedup.window(), Duration::from_secs(30));
        assert_eq!(config.dedup.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.meshcore.max_frame_size, 172);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [meshcore]
            port = "/dev/ttyACM0"

            [delivery]
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.meshcore.port, "/dev/ttyACM0");
        assert_eq!(config.meshcore.baud_rate, 115200);
        assert_eq!(config.delivery.max_retries, 5);
        assert_eq!(config.delivery.ack_timeout_ms, 8000);
        assert_eq!(config.session.timeout_secs, 1800);
    }

    #[test]
    fn payload_must_fit_frame() {
        let mut config = Config::default();
        config.delivery.max_payload = 170;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("does not fit"), "{}", err);
    }

    #[test]
    fn keepalive_must_undercut_watchdog() {
        let mut config = Config::default();
        config.meshcore.keepalive_interval_secs = config.meshcore.watchdog_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn port_override_is_validated() {
        let mut config: Config = toml::from_str("[meshcore]\nport = \"\"\n").unwrap();
        assert!(config.validate().is_err());
        config.override_port(Some("/dev/ttyACM0".to_string()));
        assert!(config.validate().is_ok());
        config.override_port(None);
        assert_eq!(config.meshcore.port, "/dev/ttyACM0");
        config.override_port(Some(" ".to_string()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn contact_buffer_must_leave_room() {
        let mut config = Config::default();
        config.meshcore.max_device_contacts = 10;
        config.meshcore.contact_limit_buffer = 10;
        assert!(config.validate().is_err());
        config.meshcore.contact_limit_buffer = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn advert_interval_zero_disables() {
        let mut mc = MeshCoreConfig::default();
        assert_eq!(mc.advert_interval(), Some(Duration::from_secs(6 * 3600)));
        mc.advert_interval_hours = 0;
        assert_eq!(mc.advert_interval(), None);
    }

    #[test]
    fn node_cache_path_resolves_under_data_dir() {
        let storage = StorageConfig::default();
        assert_eq!(
            storage.node_cache_path(),
            std::path::Path::new("data").join("node_cache.json")
        );
    }

    #[tokio::test]
    async fn default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.meshcore.protocol_version, 3);
        assert_eq!(loaded.delivery.cancel_keyword, "stop");
        assert!(loaded.validate().is_ok());
    }
}
