//! In-memory link, broker and alert channel used by the unit tests.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::{
    alert::{AlertError, AlertSink, SendStatus},
    config::{MqttConfig, WifiConfig},
    heartbeat::HeartbeatPayload,
    link::{LinkDriver, LinkError},
    session::{BrokerTransport, InboundMessage, SessionError, TransportEvent},
};

#[derive(Debug)]
struct LinkInner {
    associated: bool,
    accepting: bool,
    rejecting: bool,
    connect_calls: u32,
}

impl Default for LinkInner {
    fn default() -> Self {
        Self {
            associated: false,
            accepting: true,
            rejecting: false,
            connect_calls: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimLink {
    inner: Rc<RefCell<LinkInner>>,
}

impl SimLink {
    /// Whether a connect request associates immediately.
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.borrow_mut().accepting = accepting;
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.inner.borrow_mut().rejecting = rejecting;
    }

    pub fn set_associated(&self, associated: bool) {
        self.inner.borrow_mut().associated = associated;
    }

    pub fn connect_calls(&self) -> u32 {
        self.inner.borrow().connect_calls
    }
}

impl LinkDriver for SimLink {
    fn connect(&mut self, _wifi: &WifiConfig, _hostname: &str) -> Result<(), LinkError> {
        let mut inner = self.inner.borrow_mut();
        inner.connect_calls += 1;
        if inner.rejecting {
            return Err(LinkError::Driver("radio busy".to_string()));
        }
        if inner.accepting {
            inner.associated = true;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.inner.borrow_mut().associated = false;
    }

    fn is_associated(&self) -> bool {
        self.inner.borrow().associated
    }

    fn rssi(&self) -> Option<i8> {
        Some(-61)
    }
}

#[derive(Debug)]
struct BrokerInner {
    connected: bool,
    accepting: bool,
    events: VecDeque<TransportEvent>,
    published: Vec<(String, Vec<u8>)>,
    subscribe_calls: Vec<String>,
    connect_calls: u32,
    disconnect_calls: u32,
}

impl Default for BrokerInner {
    fn default() -> Self {
        Self {
            connected: false,
            accepting: true,
            events: VecDeque::new(),
            published: Vec::new(),
            subscribe_calls: Vec::new(),
            connect_calls: 0,
            disconnect_calls: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimBroker {
    inner: Rc<RefCell<BrokerInner>>,
}

impl SimBroker {
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.borrow_mut().accepting = accepting;
    }

    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.inner
            .borrow_mut()
            .events
            .push_back(TransportEvent::Message(InboundMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            }));
    }

    pub fn ack(&self, topic: &str, token: u32) {
        self.deliver(topic, format!("{{\"token\":{token}}}").as_bytes());
    }

    /// Broker closes the session from its side.
    pub fn drop_session(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.connected = false;
        inner
            .events
            .push_back(TransportEvent::Closed("connection reset by broker".to_string()));
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.borrow().published.clone()
    }

    pub fn published_tokens(&self) -> Vec<u32> {
        self.inner
            .borrow()
            .published
            .iter()
            .filter_map(|(_, payload)| serde_json::from_slice::<HeartbeatPayload>(payload).ok())
            .map(|payload| payload.token)
            .collect()
    }

    pub fn last_token(&self) -> Option<u32> {
        self.published_tokens().last().copied()
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        self.inner.borrow().subscribe_calls.clone()
    }

    pub fn connect_calls(&self) -> u32 {
        self.inner.borrow().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.inner.borrow().disconnect_calls
    }
}

impl BrokerTransport for SimBroker {
    fn connect(&mut self, _mqtt: &MqttConfig) -> Result<(), SessionError> {
        let mut inner = self.inner.borrow_mut();
        inner.connect_calls += 1;
        if inner.accepting {
            inner.connected = true;
            inner.events.push_back(TransportEvent::Connected);
        } else {
            inner
                .events
                .push_back(TransportEvent::ConnectFailed("not authorized".to_string()));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.connected = false;
        inner.disconnect_calls += 1;
        inner.events.clear();
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.connected {
            return Err(SessionError::NotConnected);
        }
        inner.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.connected {
            return Err(SessionError::NotConnected);
        }
        inner.subscribe_calls.push(topic.to_string());
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.inner.borrow_mut().events.pop_front()
    }
}

#[derive(Debug, Default)]
struct SinkInner {
    delivered: Vec<String>,
    failing: bool,
    deferred: bool,
    outcomes: VecDeque<Result<(), AlertError>>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    inner: Rc<RefCell<SinkInner>>,
}

impl RecordingSink {
    pub fn set_failing(&self, failing: bool) {
        self.inner.borrow_mut().failing = failing;
    }

    /// Reports sends as in flight; results are fed in with `complete`.
    pub fn set_deferred(&self, deferred: bool) {
        self.inner.borrow_mut().deferred = deferred;
    }

    pub fn complete(&self, outcome: Result<(), AlertError>) {
        self.inner.borrow_mut().outcomes.push_back(outcome);
    }

    pub fn delivered(&self) -> Vec<String> {
        self.inner.borrow().delivered.clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.inner
            .borrow()
            .delivered
            .iter()
            .filter(|text| text.contains(needle))
            .count()
    }
}

impl AlertSink for RecordingSink {
    fn is_configured(&self) -> bool {
        true
    }

    fn send(&mut self, text: &str) -> Result<SendStatus, AlertError> {
        let mut inner = self.inner.borrow_mut();
        if inner.failing {
            return Err(AlertError::Delivery("HTTP 502".to_string()));
        }
        inner.delivered.push(text.to_string());
        if inner.deferred {
            Ok(SendStatus::InFlight)
        } else {
            Ok(SendStatus::Accepted)
        }
    }

    fn poll_outcome(&mut self) -> Option<Result<(), AlertError>> {
        self.inner.borrow_mut().outcomes.pop_front()
    }
}
