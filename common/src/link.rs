use thiserror::Error;
use tracing::{info, warn};

use crate::{config::WifiConfig, types::LinkState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("wifi driver rejected association request: {0}")]
    Driver(String),
}

/// Radio-side half of the WiFi link. Implementations must not block.
pub trait LinkDriver {
    /// Starts association. The result is observed later via `is_associated`.
    fn connect(&mut self, wifi: &WifiConfig, hostname: &str) -> Result<(), LinkError>;
    fn disconnect(&mut self);
    fn is_associated(&self) -> bool;

    fn rssi(&self) -> Option<i8> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    Established,
    Lost,
}

#[derive(Debug)]
pub struct LinkManager<D> {
    driver: D,
    wifi: WifiConfig,
    hostname: String,
    state: LinkState,
    last_change_ms: u64,
    last_attempt_ms: Option<u64>,
    retries: u32,
}

impl<D: LinkDriver> LinkManager<D> {
    pub fn new(driver: D, wifi: WifiConfig, hostname: impl Into<String>) -> Self {
        Self {
            driver,
            wifi,
            hostname: hostname.into(),
            state: LinkState::Disconnected,
            last_change_ms: 0,
            last_attempt_ms: None,
            retries: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn last_change_ms(&self) -> u64 {
        self.last_change_ms
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn rssi(&self) -> Option<i8> {
        if self.is_connected() {
            self.driver.rssi()
        } else {
            None
        }
    }

    /// Starts an association attempt now, ignoring the retry interval.
    pub fn connect(&mut self, now_ms: u64) {
        if self.state == LinkState::Disconnected {
            self.begin_attempt(now_ms);
        }
    }

    pub fn disconnect(&mut self, now_ms: u64) {
        if self.state != LinkState::Disconnected {
            self.driver.disconnect();
            self.set_state(LinkState::Disconnected, now_ms);
        }
    }

    /// Tears the link down and clears the backoff so the next tick retries.
    pub fn force_reconnect(&mut self, now_ms: u64) {
        info!(ssid = %self.wifi.ssid, "wifi reconnect requested");
        self.driver.disconnect();
        self.set_state(LinkState::Disconnected, now_ms);
        self.last_attempt_ms = None;
    }

    pub fn reconfigure(&mut self, wifi: WifiConfig, hostname: impl Into<String>, now_ms: u64) {
        self.force_reconnect(now_ms);
        self.wifi = wifi;
        self.hostname = hostname.into();
        self.retries = 0;
    }

    pub fn tick(&mut self, now_ms: u64) -> Option<LinkTransition> {
        let associated = self.driver.is_associated();

        match self.state {
            LinkState::Connected => {
                if associated {
                    return None;
                }
                warn!(ssid = %self.wifi.ssid, "wifi association lost");
                self.set_state(LinkState::Disconnected, now_ms);
                Some(LinkTransition::Lost)
            }
            LinkState::Connecting => {
                if associated {
                    return Some(self.establish(now_ms));
                }
                let waited = now_ms.saturating_sub(self.last_change_ms);
                if waited >= self.wifi.connect_timeout_ms {
                    warn!(
                        ssid = %self.wifi.ssid,
                        attempt = self.retries,
                        "wifi association timed out after {waited} ms"
                    );
                    self.driver.disconnect();
                    self.set_state(LinkState::Disconnected, now_ms);
                }
                None
            }
            LinkState::Disconnected => {
                if associated {
                    return Some(self.establish(now_ms));
                }
                if self.retry_due(now_ms) {
                    self.begin_attempt(now_ms);
                }
                None
            }
        }
    }

    fn establish(&mut self, now_ms: u64) -> LinkTransition {
        info!(
            ssid = %self.wifi.ssid,
            attempts = self.retries,
            "wifi connected"
        );
        self.retries = 0;
        self.set_state(LinkState::Connected, now_ms);
        LinkTransition::Established
    }

    fn retry_due(&self, now_ms: u64) -> bool {
        self.last_attempt_ms
            .map(|last| now_ms.saturating_sub(last) >= self.wifi.retry_interval_ms)
            .unwrap_or(true)
    }

    fn begin_attempt(&mut self, now_ms: u64) {
        self.last_attempt_ms = Some(now_ms);
        self.retries = self.retries.saturating_add(1);
        info!(
            ssid = %self.wifi.ssid,
            hostname = %self.hostname,
            attempt = self.retries,
            "wifi connect attempt"
        );

        match self.driver.connect(&self.wifi, &self.hostname) {
            Ok(()) => self.set_state(LinkState::Connecting, now_ms),
            Err(err) => warn!("wifi connect attempt failed: {err}"),
        }
    }

    fn set_state(&mut self, state: LinkState, now_ms: u64) {
        if self.state != state {
            self.state = state;
            self.last_change_ms = now_ms;
        }
    }
}
