use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{config::MqttConfig, topics::topic_matches, types::SessionState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("broker session is not connected")]
    NotConnected,
    #[error("broker transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    ConnectFailed(String),
    Closed(String),
    Message(InboundMessage),
}

/// Client side of the publish/subscribe connection. Every call returns
/// immediately; connection progress arrives through `poll_event`.
pub trait BrokerTransport {
    fn connect(&mut self, mqtt: &MqttConfig) -> Result<(), SessionError>;
    fn disconnect(&mut self);
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError>;
    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError>;
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLoss {
    LinkDown,
    BrokerClosed,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    Established,
    Lost(SessionLoss),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub message: InboundMessage,
}

#[derive(Debug, Default)]
pub struct SessionTick {
    pub transition: Option<SessionTransition>,
    pub deliveries: Vec<Delivery>,
}

#[derive(Debug)]
pub struct SessionManager<T> {
    transport: T,
    mqtt: MqttConfig,
    state: SessionState,
    last_change_ms: u64,
    last_attempt_ms: Option<u64>,
    retries: u32,
    subscriptions: Vec<String>,
}

impl<T: BrokerTransport> SessionManager<T> {
    pub fn new(transport: T, mqtt: MqttConfig) -> Self {
        Self {
            transport,
            mqtt,
            state: SessionState::Disconnected,
            last_change_ms: 0,
            last_attempt_ms: None,
            retries: 0,
            subscriptions: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn last_change_ms(&self) -> u64 {
        self.last_change_ms
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Registers interest in `topic`. The subscription is reasserted after
    /// every successful reconnect; deliveries are tagged with the returned id.
    pub fn subscribe(&mut self, topic: impl Into<String>) -> SubscriptionId {
        let topic = topic.into();
        if self.is_connected() {
            if let Err(err) = self.transport.subscribe(&topic) {
                warn!("mqtt subscribe to {topic} failed: {err}");
            }
        }
        self.subscriptions.push(topic);
        SubscriptionId(self.subscriptions.len() - 1)
    }

    pub fn resubscribe(&mut self, id: SubscriptionId, topic: impl Into<String>) {
        let Some(slot) = self.subscriptions.get_mut(id.0) else {
            return;
        };
        *slot = topic.into();
        if self.state == SessionState::Connected {
            if let Err(err) = self.transport.subscribe(slot) {
                warn!("mqtt subscribe to {slot} failed: {err}");
            }
        }
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.transport.publish(topic, payload)
    }

    /// Starts a session attempt now. Only valid while the link is up.
    pub fn connect(&mut self, now_ms: u64, link_up: bool) -> Result<(), SessionError> {
        if !link_up {
            return Err(SessionError::NotConnected);
        }
        if self.state == SessionState::Disconnected {
            self.begin_attempt(now_ms);
        }
        Ok(())
    }

    pub fn disconnect(&mut self, now_ms: u64) -> Option<SessionTransition> {
        self.teardown(now_ms, SessionLoss::Manual)
    }

    /// Drops the session and clears the backoff so the next tick reconnects.
    pub fn force_reconnect(&mut self, now_ms: u64) -> Option<SessionTransition> {
        info!(host = %self.mqtt.host, "mqtt reconnect requested");
        let transition = self.teardown(now_ms, SessionLoss::Manual);
        self.last_attempt_ms = None;
        transition
    }

    pub fn reconfigure(&mut self, mqtt: MqttConfig, now_ms: u64) -> Option<SessionTransition> {
        let transition = self.force_reconnect(now_ms);
        self.mqtt = mqtt;
        self.retries = 0;
        transition
    }

    pub fn tick(&mut self, now_ms: u64, link_up: bool) -> SessionTick {
        let mut outcome = SessionTick::default();

        if !link_up {
            // A session never outlives its link.
            outcome.transition = self.teardown(now_ms, SessionLoss::LinkDown);
            while self.transport.poll_event().is_some() {}
            return outcome;
        }

        while let Some(event) = self.transport.poll_event() {
            self.handle_event(event, now_ms, &mut outcome);
        }

        match self.state {
            SessionState::Connecting => {
                let waited = now_ms.saturating_sub(self.last_change_ms);
                if waited >= self.mqtt.connect_timeout_ms {
                    warn!(
                        host = %self.mqtt.host,
                        attempt = self.retries,
                        "mqtt connect timed out after {waited} ms"
                    );
                    self.transport.disconnect();
                    self.set_state(SessionState::Disconnected, now_ms);
                }
            }
            SessionState::Disconnected => {
                if self.retry_due(now_ms) {
                    self.begin_attempt(now_ms);
                }
            }
            SessionState::Connected => {}
        }

        outcome
    }

    fn handle_event(&mut self, event: TransportEvent, now_ms: u64, outcome: &mut SessionTick) {
        match event {
            TransportEvent::Connected => {
                if self.state != SessionState::Connecting {
                    debug!("ignoring unexpected mqtt connack in state {:?}", self.state);
                    return;
                }
                info!(
                    host = %self.mqtt.host,
                    client_id = %self.mqtt.client_id,
                    attempts = self.retries,
                    "mqtt connected"
                );
                self.retries = 0;
                self.set_state(SessionState::Connected, now_ms);
                for topic in &self.subscriptions {
                    if let Err(err) = self.transport.subscribe(topic) {
                        warn!("mqtt subscribe to {topic} failed: {err}");
                    }
                }
                outcome.transition = Some(SessionTransition::Established);
            }
            TransportEvent::ConnectFailed(reason) => {
                if self.state == SessionState::Connecting {
                    warn!(host = %self.mqtt.host, "mqtt connect failed: {reason}");
                    self.transport.disconnect();
                    self.set_state(SessionState::Disconnected, now_ms);
                }
            }
            TransportEvent::Closed(reason) => match self.state {
                SessionState::Connected => {
                    warn!(host = %self.mqtt.host, "mqtt session closed: {reason}");
                    self.transport.disconnect();
                    self.set_state(SessionState::Disconnected, now_ms);
                    outcome.transition = Some(SessionTransition::Lost(SessionLoss::BrokerClosed));
                }
                SessionState::Connecting => {
                    warn!(host = %self.mqtt.host, "mqtt connect failed: {reason}");
                    self.transport.disconnect();
                    self.set_state(SessionState::Disconnected, now_ms);
                }
                SessionState::Disconnected => {}
            },
            TransportEvent::Message(message) => {
                if self.state != SessionState::Connected {
                    debug!("dropping mqtt message on {} outside session", message.topic);
                    return;
                }
                let matching: Vec<SubscriptionId> = self
                    .subscriptions
                    .iter()
                    .enumerate()
                    .filter(|(_, filter)| topic_matches(filter, &message.topic))
                    .map(|(index, _)| SubscriptionId(index))
                    .collect();
                if matching.is_empty() {
                    debug!("no subscription for mqtt message on {}", message.topic);
                }
                for subscription in matching {
                    outcome.deliveries.push(Delivery {
                        subscription,
                        message: message.clone(),
                    });
                }
            }
        }
    }

    fn teardown(&mut self, now_ms: u64, cause: SessionLoss) -> Option<SessionTransition> {
        if self.state == SessionState::Disconnected {
            return None;
        }
        let was_connected = self.is_connected();
        self.transport.disconnect();
        self.set_state(SessionState::Disconnected, now_ms);

        if was_connected {
            match cause {
                SessionLoss::LinkDown => warn!("mqtt session dropped with wifi link"),
                _ => info!("mqtt session closed locally"),
            }
            Some(SessionTransition::Lost(cause))
        } else {
            None
        }
    }

    fn retry_due(&self, now_ms: u64) -> bool {
        self.last_attempt_ms
            .map(|last| now_ms.saturating_sub(last) >= self.mqtt.retry_interval_ms)
            .unwrap_or(true)
    }

    fn begin_attempt(&mut self, now_ms: u64) {
        self.last_attempt_ms = Some(now_ms);
        self.retries = self.retries.saturating_add(1);
        info!(
            host = %self.mqtt.host,
            port = self.mqtt.port,
            attempt = self.retries,
            "mqtt connect attempt"
        );

        match self.transport.connect(&self.mqtt) {
            Ok(()) => self.set_state(SessionState::Connecting, now_ms),
            Err(err) => warn!("mqtt connect attempt failed: {err}"),
        }
    }

    fn set_state(&mut self, state: SessionState, now_ms: u64) {
        if self.state != state {
            self.state = state;
            self.last_change_ms = now_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBroker;

    fn manager(broker: &SimBroker) -> SessionManager<SimBroker> {
        SessionManager::new(broker.clone(), MqttConfig::default())
    }

    #[test]
    fn connects_and_reasserts_subscriptions() {
        let broker = SimBroker::default();
        let mut session = manager(&broker);
        session.subscribe("watchdog/heartbeat/ack");

        assert!(session.tick(0, true).transition.is_none());
        assert_eq!(session.state(), SessionState::Connecting);

        let tick = session.tick(100, true);
        assert_eq!(tick.transition, Some(SessionTransition::Established));
        assert_eq!(broker.subscribe_calls(), vec!["watchdog/heartbeat/ack"]);

        broker.drop_session();
        let tick = session.tick(200, true);
        assert_eq!(
            tick.transition,
            Some(SessionTransition::Lost(SessionLoss::BrokerClosed))
        );

        // Retry interval (15s) measured from the last attempt at t=0.
        session.tick(15_000, true);
        let tick = session.tick(15_100, true);
        assert_eq!(tick.transition, Some(SessionTransition::Established));
        assert_eq!(
            broker.subscribe_calls(),
            vec!["watchdog/heartbeat/ack", "watchdog/heartbeat/ack"]
        );
    }

    #[test]
    fn publish_requires_connected_session() {
        let broker = SimBroker::default();
        let mut session = manager(&broker);

        assert_eq!(
            session.publish("watchdog/heartbeat", b"1"),
            Err(SessionError::NotConnected)
        );

        session.tick(0, true);
        session.tick(1, true);
        assert_eq!(session.publish("watchdog/heartbeat", b"1"), Ok(()));
        assert_eq!(broker.published().len(), 1);
    }

    #[test]
    fn link_loss_forces_disconnect_in_same_tick() {
        let broker = SimBroker::default();
        let mut session = manager(&broker);
        session.tick(0, true);
        session.tick(1, true);
        assert!(session.is_connected());

        let tick = session.tick(2, false);
        assert_eq!(
            tick.transition,
            Some(SessionTransition::Lost(SessionLoss::LinkDown))
        );
        assert_eq!(session.state(), SessionState::Disconnected);

        // Lost only reported once.
        assert!(session.tick(3, false).transition.is_none());
    }

    #[test]
    fn connect_is_gated_on_link() {
        let broker = SimBroker::default();
        let mut session = manager(&broker);

        assert_eq!(session.connect(0, false), Err(SessionError::NotConnected));
        session.tick(0, false);
        assert_eq!(broker.connect_calls(), 0);

        assert_eq!(session.connect(10, true), Ok(()));
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[test]
    fn refused_connect_backs_off() {
        let broker = SimBroker::default();
        broker.set_accepting(false);
        let mut session = manager(&broker);

        session.tick(0, true);
        session.tick(1, true);
        assert_eq!(session.state(), SessionState::Disconnected);

        session.tick(14_999, true);
        assert_eq!(broker.connect_calls(), 1);
        session.tick(15_000, true);
        assert_eq!(broker.connect_calls(), 2);
        assert_eq!(session.retries(), 2);
    }

    #[test]
    fn routes_messages_to_matching_subscriptions() {
        let broker = SimBroker::default();
        let mut session = manager(&broker);
        let ack = session.subscribe("watchdog/heartbeat/ack");
        let all = session.subscribe("watchdog/#");
        session.tick(0, true);
        session.tick(1, true);

        broker.deliver("watchdog/heartbeat/ack", b"7");
        broker.deliver("other/topic", b"x");
        let tick = session.tick(2, true);

        let ids: Vec<SubscriptionId> = tick.deliveries.iter().map(|d| d.subscription).collect();
        assert_eq!(ids, vec![ack, all]);
    }

    #[test]
    fn force_reconnect_reports_manual_loss_and_retries() {
        let broker = SimBroker::default();
        let mut session = manager(&broker);
        session.tick(0, true);
        session.tick(1, true);

        assert_eq!(
            session.force_reconnect(5),
            Some(SessionTransition::Lost(SessionLoss::Manual))
        );
        session.tick(6, true);
        assert_eq!(broker.connect_calls(), 2);
    }

    #[test]
    fn disconnect_reports_manual_loss_and_keeps_backoff() {
        let broker = SimBroker::default();
        let mut session = manager(&broker);
        session.tick(0, true);
        session.tick(1, true);
        assert!(session.is_connected());

        assert_eq!(
            session.disconnect(5),
            Some(SessionTransition::Lost(SessionLoss::Manual))
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(broker.disconnect_calls(), 1);
        assert_eq!(session.disconnect(6), None);

        session.tick(7, true);
        assert_eq!(broker.connect_calls(), 1);
        assert_eq!(
            session.publish("watchdog/heartbeat", b"1"),
            Err(SessionError::NotConnected)
        );
    }
}
