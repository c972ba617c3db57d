pub mod alert;
pub mod clock;
pub mod config;
pub mod console;
pub mod heartbeat;
pub mod link;
pub mod session;
pub mod supervisor;
pub mod topics;
pub mod types;

#[cfg(test)]
mod sim;

pub use alert::{AlertDispatcher, AlertError, AlertEvent, AlertReason, AlertSink, SendStatus};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    AlertConfig, ConfigError, DeviceConfig, HeartbeatConfig, MqttConfig, TelegramConfig,
    WatchdogConfig, WifiConfig,
};
pub use console::{ConsoleLine, ConsoleLog};
pub use heartbeat::{AckError, AckOutcome, HeartbeatEngine, HeartbeatEvent, HeartbeatPayload};
pub use link::{LinkDriver, LinkError, LinkManager, LinkTransition};
pub use session::{
    BrokerTransport, InboundMessage, SessionError, SessionManager, SessionTransition,
    TransportEvent,
};
pub use supervisor::Supervisor;
pub use topics::*;
pub use types::{
    AlertStats, HeartbeatPhase, HeartbeatResult, LinkState, SessionState, StatusSnapshot,
};
