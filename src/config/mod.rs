//! Configuration management for apelios-core

use crate::media::ErrorBudget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Relay endpoint and relay server settings
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Sender (offer side) settings
    #[serde(default)]
    pub sender: SenderConfig,

    /// Receiver (answer side) settings
    #[serde(default)]
    pub receiver: ReceiverConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay bind / connect address
    pub host: String,

    /// Relay port
    pub port: u16,

    /// Seconds a new relay connection has to announce its role
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: f64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl SignalingConfig {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Annex-B H.264 input; "-" reads stdin
    pub input: PathBuf,

    /// Frame rate of the input stream
    pub fps: u32,

    /// Concurrent receiver sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Seconds an offer may wait for its answer
    #[serde(default = "default_offer_timeout_secs")]
    pub offer_timeout_secs: f64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("-"),
            fps: 30,
            max_sessions: default_max_sessions(),
            offer_timeout_secs: default_offer_timeout_secs(),
        }
    }
}

impl SenderConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.offer_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Where received samples are written; "-" writes stdout
    pub output: PathBuf,

    /// Seconds allowed for one frame
    pub frame_timeout_secs: f64,

    /// Consecutive failures before the pump stops
    pub max_consecutive_errors: u32,

    /// Seconds to pause after a failed read
    pub backoff_secs: f64,

    /// Output queue capacity (1 or 2)
    pub queue_capacity: usize,

    /// Seconds to wait for the peer connection to come up
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("received.h264"),
            frame_timeout_secs: 5.0,
            max_consecutive_errors: 10,
            backoff_secs: 0.5,
            queue_capacity: 2,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ReceiverConfig {
    pub fn error_budget(&self) -> ErrorBudget {
        ErrorBudget::new(
            self.max_consecutive_errors,
            Duration::from_secs_f64(self.frame_timeout_secs),
            Duration::from_secs_f64(self.backoff_secs),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN/TURN servers; host candidates only when empty
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,

    /// Seconds to wait for ICE gathering before signaling a description
    #[serde(default = "default_gather_timeout_secs")]
    pub gather_timeout_secs: f64,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            gather_timeout_secs: default_gather_timeout_secs(),
        }
    }
}

impl WebRTCConfig {
    pub fn gather_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.gather_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.signaling.port == 0 {
            return Err("Signaling port must be non-zero".into());
        }
        if self.signaling.handshake_timeout_secs <= 0.0 {
            return Err("Signaling handshake timeout must be positive".into());
        }

        if self.sender.fps == 0 {
            return Err("Sender FPS must be non-zero".into());
        }
        if self.sender.max_sessions == 0 {
            return Err("Sender max_sessions must be non-zero".into());
        }
        if self.sender.offer_timeout_secs <= 0.0 {
            return Err("Sender offer timeout must be positive".into());
        }

        let receiver = &self.receiver;
        if !(1..=2).contains(&receiver.queue_capacity) {
            return Err("Receiver queue_capacity must be 1 or 2".into());
        }
        if receiver.max_consecutive_errors == 0 {
            return Err("Receiver max_consecutive_errors must be non-zero".into());
        }
        if receiver.frame_timeout_secs <= 0.0 || receiver.connect_timeout_secs <= 0.0 {
            return Err("Receiver timeouts must be positive".into());
        }
        if receiver.backoff_secs < 0.0 {
            return Err("Receiver backoff cannot be negative".into());
        }

        if self.webrtc.gather_timeout_secs <= 0.0 {
            return Err("WebRTC gather timeout must be positive".into());
        }
        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entries need at least one URL".into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use std::time::Duration;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.signaling.url(), "ws://127.0.0.1:9999");
        let budget = cfg.receiver.error_budget();
        assert_eq!(budget.threshold, 10);
        assert_eq!(budget.timeout, Duration::from_secs(5));
        assert_eq!(budget.backoff, Duration::from_millis(500));
    }

    #[test]
    fn validate_rejects_queue_capacity() {
        let mut cfg = Config::default();
        cfg.receiver.queue_capacity = 3;
        assert!(cfg.validate().is_err());
        cfg.receiver.queue_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_port_and_threshold() {
        let mut cfg = Config::default();
        cfg.signaling.port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.receiver.max_consecutive_errors = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.sender.offer_timeout_secs = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [signaling]
            host = "10.0.0.2"
            port = 8765

            [receiver]
            output = "/tmp/out.h264"
            frame_timeout_secs = 2.0
            max_consecutive_errors = 4
            backoff_secs = 0.25
            queue_capacity = 1

            [[webrtc.ice_servers]]
            urls = ["stun:stun.example.org:3478"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.signaling.url(), "ws://10.0.0.2:8765");
        assert_eq!(cfg.receiver.error_budget().threshold, 4);
        assert_eq!(cfg.sender.max_sessions, 8);
        assert_eq!(cfg.sender.offer_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.webrtc.ice_servers.len(), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/apelios.toml")).unwrap();
        assert_eq!(cfg.signaling.port, 9999);
    }
}

fn default_handshake_timeout_secs() -> f64 { 10.0 }
fn default_max_sessions() -> usize { 8 }
fn default_offer_timeout_secs() -> f64 { 30.0 }
fn default_connect_timeout_secs() -> f64 { 30.0 }
fn default_gather_timeout_secs() -> f64 { 5.0 }
