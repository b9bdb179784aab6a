use anyhow::Result;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use huddle_api::WsSettings;
use huddle_sfu::engine::{EngineConfig, RtpCodecCapability, WebRtcTransportOptions};
use huddle_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuSection,
    pub engine: EngineSection,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Route of the signaling WebSocket
    pub ws_path: String,
    pub max_message_size: usize,
    pub outbound_channel_capacity: usize,
    /// How long shutdown waits for WebSocket connections to close
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3000,
            ws_path: "/mediasoup".to_string(),
            max_message_size: 64 * 1024,
            outbound_channel_capacity: 256,
            drain_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuSection {
    /// 0 = unlimited
    pub max_rooms: usize,
    /// 0 = unlimited
    pub max_peers_per_room: usize,
    pub close_empty_rooms: bool,
    pub consume_requires_connected_transport: bool,
}

impl Default for SfuSection {
    fn default() -> Self {
        let defaults = SfuConfig::default();
        Self {
            max_rooms: defaults.max_rooms,
            max_peers_per_room: defaults.max_peers_per_room,
            close_empty_rooms: defaults.close_empty_rooms,
            consume_requires_connected_transport: defaults.consume_requires_connected_transport,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for EngineSection {
    fn default() -> Self {
        let transport = WebRtcTransportOptions::default();
        let engine = EngineConfig::default();
        Self {
            listen_ip: transport.listen_ip,
            announced_ip: transport.announced_ip,
            enable_udp: transport.enable_udp,
            enable_tcp: transport.enable_tcp,
            prefer_udp: transport.prefer_udp,
            rtc_min_port: engine.rtc_min_port,
            rtc_max_port: engine.rtc_max_port,
            media_codecs: engine.media_codecs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Delay between an engine failure and process exit
    pub engine_fatal_grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            engine_fatal_grace_ms: 2000,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources
    ///
    /// Priority (highest first):
    /// 1. Environment variables (`HUDDLE_SERVER__HTTP_PORT`, ...)
    /// 2. Config file (if provided)
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("HUDDLE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.engine.listen_ip,
            announced_ip: self.engine.announced_ip,
            enable_udp: self.engine.enable_udp,
            enable_tcp: self.engine.enable_tcp,
            prefer_udp: self.engine.prefer_udp,
        }
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            rtc_min_port: self.engine.rtc_min_port,
            rtc_max_port: self.engine.rtc_max_port,
            media_codecs: self.engine.media_codecs.clone(),
        }
    }

    #[must_use]
    pub fn sfu_config(&self) -> SfuConfig {
        SfuConfig {
            max_rooms: self.sfu.max_rooms,
            max_peers_per_room: self.sfu.max_peers_per_room,
            close_empty_rooms: self.sfu.close_empty_rooms,
            consume_requires_connected_transport: self.sfu.consume_requires_connected_transport,
            webrtc_transport: self.transport_options(),
        }
    }

    #[must_use]
    pub fn ws_settings(&self) -> WsSettings {
        WsSettings {
            max_message_size: self.server.max_message_size,
            outbound_channel_capacity: self.server.outbound_channel_capacity,
        }
    }

    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.server.drain_timeout_secs)
    }

    #[must_use]
    pub const fn engine_fatal_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown.engine_fatal_grace_ms)
    }

    /// Collect every configuration problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.server.ws_path.starts_with('/') {
            errors.push(format!(
                "server.ws_path must start with '/': {}",
                self.server.ws_path
            ));
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be non-zero".to_string());
        }
        if self.server.outbound_channel_capacity == 0 {
            errors.push("server.outbound_channel_capacity must be non-zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        errors.extend(self.engine_config().validate());
        errors.extend(self.sfu_config().validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `HUDDLE_CONFIG_PATH` environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (container mount path)
/// 4. Fall back to environment variables only
pub fn load_config() -> Result<Config> {
    let config_path = std::env::var("HUDDLE_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::load(Some(&path))
                .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::load(None)?
        }
    };

    // Fail fast on misconfigurations
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:3000");
        assert_eq!(config.engine_fatal_grace(), Duration::from_millis(2000));
        assert_eq!(config.engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  http_port: 4443\n  ws_path: /signal\nsfu:\n  max_rooms: 3\nengine:\n  announced_ip: 10.0.0.5\n  rtc_min_port: 40000\n  rtc_max_port: 40100"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.http_port, 4443);
        assert_eq!(config.server.ws_path, "/signal");
        assert_eq!(config.sfu.max_rooms, 3);
        assert_eq!(
            config.transport_options().advertised_ip(),
            "10.0.0.5".parse::<IpAddr>().unwrap()
        );
        assert_eq!(config.engine_config().rtc_min_port, 40000);
        // Unset fields keep their defaults
        assert!(config.sfu.close_empty_rooms);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.server.ws_path = "ws".to_string();
        config.logging.format = "xml".to_string();
        config.engine.rtc_min_port = 5000;
        config.engine.rtc_max_port = 4000;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
