use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatPhase {
    Idle,
    AwaitingAck,
}

/// Outcome of the most recently concluded heartbeat cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HeartbeatResult {
    None,
    Healthy,
    Missed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub configured: bool,
    pub sent: u64,
    pub coalesced: u64,
    pub failed: u64,
    pub dropped: u64,
    pub pending: usize,
    #[serde(rename = "inFlight")]
    pub in_flight: usize,
    #[serde(rename = "lastDeliveryOk")]
    pub last_delivery_ok: Option<bool>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub hostname: String,
    #[serde(rename = "friendlyName")]
    pub friendly_name: String,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,

    pub link: LinkState,
    #[serde(rename = "linkSinceMs")]
    pub link_since_ms: u64,
    #[serde(rename = "linkRetries")]
    pub link_retries: u32,
    pub rssi: Option<i8>,

    pub session: SessionState,
    #[serde(rename = "sessionSinceMs")]
    pub session_since_ms: u64,
    #[serde(rename = "sessionRetries")]
    pub session_retries: u32,

    #[serde(rename = "heartbeatPhase")]
    pub heartbeat_phase: HeartbeatPhase,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: HeartbeatResult,
    #[serde(rename = "consecutiveMisses")]
    pub consecutive_misses: u32,
    #[serde(rename = "currentToken")]
    pub current_token: Option<u32>,
    #[serde(rename = "lastSentMs")]
    pub last_sent_ms: Option<u64>,
    #[serde(rename = "lastAckMs")]
    pub last_ack_ms: Option<u64>,
    #[serde(rename = "heartbeatsSent")]
    pub heartbeats_sent: u64,
    #[serde(rename = "acksReceived")]
    pub acks_received: u64,

    pub alerts: AlertStats,
}

impl StatusSnapshot {
    /// Session up and the last concluded cycle was acknowledged.
    pub fn is_healthy(&self) -> bool {
        self.session == SessionState::Connected
            && self.last_heartbeat != HeartbeatResult::Missed
            && self.consecutive_misses == 0
    }
}
