use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::{AlertConfig, TelegramConfig},
    types::AlertStats,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlertError {
    #[error("alert channel is not configured")]
    NotConfigured,
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertReason {
    LinkLost,
    SessionLost,
    HeartbeatMissed,
    Recovered,
}

impl AlertReason {
    const ALL: [AlertReason; 4] = [
        Self::LinkLost,
        Self::SessionLost,
        Self::HeartbeatMissed,
        Self::Recovered,
    ];

    fn index(self) -> usize {
        match self {
            Self::LinkLost => 0,
            Self::SessionLost => 1,
            Self::HeartbeatMissed => 2,
            Self::Recovered => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertEvent {
    pub reason: AlertReason,
    pub message: String,
    #[serde(rename = "atMs")]
    pub at_ms: u64,
}

impl AlertEvent {
    pub fn link_lost(ssid: &str, at_ms: u64) -> Self {
        Self {
            reason: AlertReason::LinkLost,
            message: format!("WiFi connection to '{ssid}' lost"),
            at_ms,
        }
    }

    pub fn session_lost(host: &str, at_ms: u64) -> Self {
        Self {
            reason: AlertReason::SessionLost,
            message: format!("MQTT broker {host} unreachable"),
            at_ms,
        }
    }

    pub fn heartbeat_missed(consecutive: u32, at_ms: u64) -> Self {
        let times = if consecutive == 1 { "time" } else { "times" };
        Self {
            reason: AlertReason::HeartbeatMissed,
            message: format!("Heartbeat missed {consecutive} {times}"),
            at_ms,
        }
    }

    pub fn recovered(after_misses: u32, at_ms: u64) -> Self {
        Self {
            reason: AlertReason::Recovered,
            message: format!("Heartbeat recovered after {after_misses} missed"),
            at_ms,
        }
    }
}

/// How far a message got by the time `send` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// Handed to a background sender; the result arrives via `poll_outcome`.
    InFlight,
}

/// Out-of-band notification channel. `send` must not block the caller.
pub trait AlertSink {
    fn is_configured(&self) -> bool;
    fn send(&mut self, text: &str) -> Result<SendStatus, AlertError>;

    /// Next finished background delivery, oldest first.
    fn poll_outcome(&mut self) -> Option<Result<(), AlertError>> {
        None
    }

    /// Picks up new channel credentials after a config reload.
    fn reconfigure(&mut self, _telegram: &TelegramConfig) {}
}

/// Coalesces, queues and forwards alerts to the sink.
///
/// Alerts are queued in a bounded outbox and only handed to the sink while
/// the link is up. A reason already sent within the de-duplication window is
/// counted instead of queued; the next alert that does go out reports how
/// many were folded into it. `Recovered` is never coalesced.
#[derive(Debug)]
pub struct AlertDispatcher<S> {
    sink: S,
    prefix: String,
    dedup_window_ms: u64,
    capacity: usize,
    outbox: VecDeque<String>,
    last_admitted_ms: [Option<u64>; 4],
    suppressed: [u32; 4],
    stats: AlertStats,
}

impl<S: AlertSink> AlertDispatcher<S> {
    pub fn new(sink: S, config: &AlertConfig, prefix: impl Into<String>) -> Self {
        Self {
            sink,
            prefix: prefix.into(),
            dedup_window_ms: config.dedup_window_ms,
            capacity: config.outbox_capacity.max(1),
            outbox: VecDeque::new(),
            last_admitted_ms: [None; 4],
            suppressed: [0; 4],
            stats: AlertStats::default(),
        }
    }

    pub fn reconfigure(
        &mut self,
        config: &AlertConfig,
        telegram: &TelegramConfig,
        prefix: impl Into<String>,
    ) {
        self.sink.reconfigure(telegram);
        self.prefix = prefix.into();
        self.dedup_window_ms = config.dedup_window_ms;
        self.capacity = config.outbox_capacity.max(1);
        while self.outbox.len() > self.capacity {
            self.outbox.pop_front();
            self.stats.dropped = self.stats.dropped.saturating_add(1);
        }
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            configured: self.sink.is_configured(),
            pending: self.outbox.len(),
            ..self.stats.clone()
        }
    }

    /// Returns `true` if the alert was queued, `false` if it was coalesced.
    pub fn dispatch(&mut self, event: &AlertEvent) -> bool {
        let slot = event.reason.index();

        if event.reason != AlertReason::Recovered {
            if let Some(last) = self.last_admitted_ms[slot] {
                if event.at_ms.saturating_sub(last) < self.dedup_window_ms {
                    self.suppressed[slot] = self.suppressed[slot].saturating_add(1);
                    self.stats.coalesced = self.stats.coalesced.saturating_add(1);
                    debug!(reason = ?event.reason, "alert coalesced: {}", event.message);
                    return false;
                }
            }
        }

        let folded = if event.reason == AlertReason::Recovered {
            // Close the incident: everything folded so far is reported now and
            // the next fault alerts immediately.
            let total = self.suppressed.iter().sum::<u32>();
            self.suppressed = [0; 4];
            self.last_admitted_ms = [None; 4];
            total
        } else {
            std::mem::take(&mut self.suppressed[slot])
        };
        self.last_admitted_ms[slot] = Some(event.at_ms);

        let mut text = format!("[{}] {}", self.prefix, event.message);
        if folded > 0 {
            let noun = if folded == 1 { "alert" } else { "alerts" };
            text.push_str(&format!(" ({folded} similar {noun} suppressed)"));
        }

        if self.outbox.len() >= self.capacity {
            if let Some(dropped) = self.outbox.pop_front() {
                warn!("alert outbox full; dropping oldest alert: {dropped}");
                self.stats.dropped = self.stats.dropped.saturating_add(1);
            }
        }
        self.outbox.push_back(text);
        true
    }

    /// Collects finished background deliveries, then hands queued alerts to
    /// the sink while online. Failures are logged and never retried.
    pub fn flush(&mut self, online: bool) {
        while let Some(outcome) = self.sink.poll_outcome() {
            self.stats.in_flight = self.stats.in_flight.saturating_sub(1);
            self.record(outcome);
        }

        if !online {
            return;
        }

        while let Some(text) = self.outbox.pop_front() {
            match self.sink.send(&text) {
                Ok(SendStatus::Accepted) => {
                    info!("alert sent: {text}");
                    self.record(Ok(()));
                }
                Ok(SendStatus::InFlight) => {
                    debug!("alert handed off: {text}");
                    self.stats.in_flight = self.stats.in_flight.saturating_add(1);
                }
                Err(AlertError::NotConfigured) => {
                    debug!("alert channel not configured; dropping: {text}");
                    self.stats.dropped = self.stats.dropped.saturating_add(1);
                }
                Err(err) => {
                    warn!("{err}; alert dropped: {text}");
                    self.record(Err(err));
                }
            }
        }
    }

    fn record(&mut self, outcome: Result<(), AlertError>) {
        match outcome {
            Ok(()) => {
                self.stats.sent = self.stats.sent.saturating_add(1);
                self.stats.last_delivery_ok = Some(true);
                self.stats.last_error = None;
            }
            Err(err) => {
                self.stats.failed = self.stats.failed.saturating_add(1);
                self.stats.last_delivery_ok = Some(false);
                self.stats.last_error = Some(err.to_string());
            }
        }
    }

    pub fn suppressed_total(&self) -> u32 {
        AlertReason::ALL
            .iter()
            .map(|reason| self.suppressed[reason.index()])
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RecordingSink;

    fn dispatcher(sink: &RecordingSink) -> AlertDispatcher<RecordingSink> {
        AlertDispatcher::new(sink.clone(), &AlertConfig::default(), "Watchdog")
    }

    #[test]
    fn formats_and_delivers_when_online() {
        let sink = RecordingSink::default();
        let mut alerts = dispatcher(&sink);

        assert!(alerts.dispatch(&AlertEvent::link_lost("home", 1_000)));
        alerts.flush(false);
        assert!(sink.delivered().is_empty());
        assert_eq!(alerts.stats().pending, 1);

        alerts.flush(true);
        assert_eq!(sink.delivered(), vec!["[Watchdog] WiFi connection to 'home' lost"]);
        assert_eq!(alerts.stats().sent, 1);
    }

    #[test]
    fn coalesces_repeated_reason_within_window() {
        let sink = RecordingSink::default();
        let mut alerts = dispatcher(&sink);

        assert!(alerts.dispatch(&AlertEvent::heartbeat_missed(1, 190_000)));
        assert!(!alerts.dispatch(&AlertEvent::heartbeat_missed(2, 250_000)));
        assert!(!alerts.dispatch(&AlertEvent::heartbeat_missed(3, 310_000)));
        assert_eq!(alerts.suppressed_total(), 2);

        // Window (300s) has elapsed since the last admitted miss.
        assert!(alerts.dispatch(&AlertEvent::heartbeat_missed(4, 490_000)));
        alerts.flush(true);

        assert_eq!(
            sink.delivered(),
            vec![
                "[Watchdog] Heartbeat missed 1 time",
                "[Watchdog] Heartbeat missed 4 times (2 similar alerts suppressed)",
            ]
        );
        assert_eq!(alerts.stats().coalesced, 2);
    }

    #[test]
    fn recovered_always_sent_and_reports_suppressed() {
        let sink = RecordingSink::default();
        let mut alerts = dispatcher(&sink);

        alerts.dispatch(&AlertEvent::heartbeat_missed(1, 0));
        alerts.dispatch(&AlertEvent::heartbeat_missed(2, 60_000));
        assert!(alerts.dispatch(&AlertEvent::recovered(2, 61_000)));
        assert!(alerts.dispatch(&AlertEvent::recovered(1, 62_000)));

        // A fresh incident alerts immediately.
        assert!(alerts.dispatch(&AlertEvent::heartbeat_missed(1, 70_000)));
        alerts.flush(true);

        assert_eq!(sink.count_containing("Heartbeat recovered"), 2);
        assert_eq!(
            sink.delivered()[1],
            "[Watchdog] Heartbeat recovered after 2 missed (1 similar alert suppressed)"
        );
        assert_eq!(sink.count_containing("Heartbeat missed"), 2);
    }

    #[test]
    fn delivery_failure_is_swallowed() {
        let sink = RecordingSink::default();
        sink.set_failing(true);
        let mut alerts = dispatcher(&sink);

        alerts.dispatch(&AlertEvent::session_lost("10.0.0.2", 0));
        alerts.flush(true);

        let stats = alerts.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.last_delivery_ok, Some(false));
        assert!(sink.delivered().is_empty());
    }

    #[test]
    fn background_outcomes_update_channel_health() {
        let sink = RecordingSink::default();
        sink.set_deferred(true);
        let mut alerts = dispatcher(&sink);

        alerts.dispatch(&AlertEvent::link_lost("home", 0));
        alerts.flush(true);

        let stats = alerts.stats();
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.last_delivery_ok, None);

        sink.complete(Err(AlertError::Delivery("HTTP 401 Unauthorized".to_string())));
        // Outcomes are collected even while the link is down.
        alerts.flush(false);

        let stats = alerts.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.last_delivery_ok, Some(false));
        assert_eq!(
            stats.last_error.as_deref(),
            Some("alert delivery failed: HTTP 401 Unauthorized")
        );

        alerts.dispatch(&AlertEvent::recovered(0, 1_000));
        alerts.flush(true);
        sink.complete(Ok(()));
        alerts.flush(true);

        let stats = alerts.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.last_delivery_ok, Some(true));
        assert_eq!(stats.last_error, None);
    }

    #[test]
    fn full_outbox_drops_oldest() {
        let sink = RecordingSink::default();
        let config = AlertConfig {
            dedup_window_ms: 0,
            outbox_capacity: 2,
        };
        let mut alerts = AlertDispatcher::new(sink.clone(), &config, "Watchdog");

        for count in 1..=3 {
            alerts.dispatch(&AlertEvent::heartbeat_missed(count, u64::from(count)));
        }
        alerts.flush(true);

        assert_eq!(alerts.stats().dropped, 1);
        assert_eq!(
            sink.delivered(),
            vec![
                "[Watchdog] Heartbeat missed 2 times",
                "[Watchdog] Heartbeat missed 3 times",
            ]
        );
    }
}
