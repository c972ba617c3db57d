use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topics::{DEFAULT_HEARTBEAT_ACK_TOPIC, DEFAULT_HEARTBEAT_TOPIC};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("wifi ssid cannot be empty")]
    EmptySsid,
    #[error("mqtt host cannot be empty")]
    EmptyBrokerHost,
    #[error("mqtt port must be between 1 and 65535")]
    InvalidBrokerPort,
    #[error("{0} topic cannot be empty")]
    EmptyTopic(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error(
        "heartbeat received interval ({received_ms} ms) must exceed send interval ({send_ms} ms)"
    )]
    IntervalOrdering { send_ms: u64, received_ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub hostname: String,
    pub friendly_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hostname: "watchdog".to_string(),
            friendly_name: "Watchdog".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WifiConfig {
    pub ssid: String,
    pub psk: String,
    pub connect_timeout_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            psk: String::new(),
            connect_timeout_ms: 20_000,
            retry_interval_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub connect_timeout_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: String::new(),
            keep_alive_secs: 30,
            connect_timeout_ms: 10_000,
            retry_interval_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.trim().is_empty() && !self.chat_id.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub publish_topic: String,
    pub subscribe_topic: String,
    pub send_interval_ms: u64,
    pub received_interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            publish_topic: DEFAULT_HEARTBEAT_TOPIC.to_string(),
            subscribe_topic: DEFAULT_HEARTBEAT_ACK_TOPIC.to_string(),
            send_interval_ms: 60_000,
            received_interval_ms: 130_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AlertConfig {
    pub dedup_window_ms: u64,
    pub outbox_capacity: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 300_000,
            outbox_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchdogConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub wifi: WifiConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub debug: bool,
}

impl WatchdogConfig {
    /// Fills in derived values. Runs before [`WatchdogConfig::validate`].
    pub fn sanitize(&mut self) {
        self.device.hostname = self.device.hostname.trim().to_string();
        if self.device.hostname.is_empty() {
            self.device.hostname = DeviceConfig::default().hostname;
        }
        if self.device.friendly_name.trim().is_empty() {
            self.device.friendly_name = self.device.hostname.clone();
        }
        if self.mqtt.client_id.trim().is_empty() {
            self.mqtt.client_id = self.device.hostname.clone();
        }
        self.wifi.ssid = self.wifi.ssid.trim().to_string();
        self.mqtt.host = self.mqtt.host.trim().to_string();
        self.heartbeat.publish_topic = self.heartbeat.publish_topic.trim().to_string();
        self.heartbeat.subscribe_topic = self.heartbeat.subscribe_topic.trim().to_string();
        self.alerts.outbox_capacity = self.alerts.outbox_capacity.clamp(1, 256);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wifi.ssid.trim().is_empty() {
            return Err(ConfigError::EmptySsid);
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::EmptyBrokerHost);
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidBrokerPort);
        }
        if self.heartbeat.publish_topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic("heartbeat publish"));
        }
        if self.heartbeat.subscribe_topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic("heartbeat subscribe"));
        }

        let intervals = [
            ("wifi retry interval", self.wifi.retry_interval_ms),
            ("wifi connect timeout", self.wifi.connect_timeout_ms),
            ("mqtt retry interval", self.mqtt.retry_interval_ms),
            ("mqtt connect timeout", self.mqtt.connect_timeout_ms),
            ("heartbeat send interval", self.heartbeat.send_interval_ms),
            (
                "heartbeat received interval",
                self.heartbeat.received_interval_ms,
            ),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroInterval(*name));
        }

        if self.heartbeat.received_interval_ms <= self.heartbeat.send_interval_ms {
            return Err(ConfigError::IntervalOrdering {
                send_ms: self.heartbeat.send_interval_ms,
                received_ms: self.heartbeat.received_interval_ms,
            });
        }

        Ok(())
    }
}
