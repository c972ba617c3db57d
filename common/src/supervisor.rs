use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::{
    alert::{AlertDispatcher, AlertEvent, AlertSink},
    clock::Clock,
    config::{ConfigError, WatchdogConfig},
    console::{ConsoleLine, ConsoleLog},
    heartbeat::{AckOutcome, HeartbeatEngine, HeartbeatEvent},
    link::{LinkDriver, LinkManager, LinkTransition},
    session::{
        BrokerTransport, Delivery, SessionError, SessionLoss, SessionManager, SessionTransition,
        SubscriptionId,
    },
    types::{LinkState, SessionState, StatusSnapshot},
};

const ALERT_HISTORY: usize = 16;

/// Composition root. One `tick` advances link, session and heartbeat in that
/// order against a single clock reading; nothing in here blocks.
#[derive(Debug)]
pub struct Supervisor<L, B, A, C> {
    config: WatchdogConfig,
    clock: C,
    link: LinkManager<L>,
    session: SessionManager<B>,
    heartbeat: HeartbeatEngine,
    alerts: AlertDispatcher<A>,
    console: ConsoleLog,
    recent_alerts: VecDeque<AlertEvent>,
    ack_subscription: SubscriptionId,
    started_ms: u64,
}

impl<L, B, A, C> Supervisor<L, B, A, C>
where
    L: LinkDriver,
    B: BrokerTransport,
    A: AlertSink,
    C: Clock,
{
    pub fn new(
        mut config: WatchdogConfig,
        link: L,
        transport: B,
        sink: A,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.sanitize();
        config.validate()?;

        let started_ms = clock.now_ms();
        let mut session = SessionManager::new(transport, config.mqtt.clone());
        let ack_subscription = session.subscribe(config.heartbeat.subscribe_topic.clone());

        Ok(Self {
            link: LinkManager::new(link, config.wifi.clone(), config.device.hostname.clone()),
            session,
            heartbeat: HeartbeatEngine::new(&config.heartbeat),
            alerts: AlertDispatcher::new(
                sink,
                &config.alerts,
                config.device.friendly_name.clone(),
            ),
            console: ConsoleLog::new(ConsoleLog::DEFAULT_CAPACITY, config.debug),
            recent_alerts: VecDeque::with_capacity(ALERT_HISTORY),
            ack_subscription,
            started_ms,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn heartbeat(&self) -> &HeartbeatEngine {
        &self.heartbeat
    }

    pub fn console_lines(&self) -> Vec<ConsoleLine> {
        self.console.lines()
    }

    /// Every alert raised, newest last, before coalescing.
    pub fn recent_alerts(&self) -> Vec<AlertEvent> {
        self.recent_alerts.iter().cloned().collect()
    }

    pub fn tick(&mut self) {
        let now_ms = self.clock.now_ms();

        match self.link.tick(now_ms) {
            Some(LinkTransition::Established) => {
                let line = format!("WiFi connected to '{}'", self.config.wifi.ssid);
                self.note(now_ms, line);
            }
            Some(LinkTransition::Lost) => {
                let line = format!("WiFi connection to '{}' lost", self.config.wifi.ssid);
                self.note(now_ms, line);
                let event = AlertEvent::link_lost(&self.config.wifi.ssid, now_ms);
                self.raise(event);
            }
            None => {}
        }

        let outcome = self.session.tick(now_ms, self.link.is_connected());
        if let Some(transition) = outcome.transition {
            self.on_session_transition(transition, now_ms);
        }
        for delivery in outcome.deliveries {
            self.route(delivery, now_ms);
        }

        if self.session.is_connected() {
            for event in self.heartbeat.tick(now_ms) {
                self.on_heartbeat_event(event, now_ms);
            }
        }

        self.alerts.flush(self.link.is_connected());
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let now_ms = self.clock.now_ms();
        StatusSnapshot {
            hostname: self.config.device.hostname.clone(),
            friendly_name: self.config.device.friendly_name.clone(),
            uptime_ms: now_ms.saturating_sub(self.started_ms),
            link: self.link.state(),
            link_since_ms: self.link.last_change_ms(),
            link_retries: self.link.retries(),
            rssi: self.link.rssi(),
            session: self.session.state(),
            session_since_ms: self.session.last_change_ms(),
            session_retries: self.session.retries(),
            heartbeat_phase: self.heartbeat.phase(),
            last_heartbeat: self.heartbeat.last_result(),
            consecutive_misses: self.heartbeat.consecutive_misses(),
            current_token: self.heartbeat.current_token(),
            last_sent_ms: self.heartbeat.last_sent_ms(),
            last_ack_ms: self.heartbeat.last_ack_ms(),
            heartbeats_sent: self.heartbeat.sent_total(),
            acks_received: self.heartbeat.acked_total(),
            alerts: self.alerts.stats(),
        }
    }

    /// Publishes a heartbeat immediately, superseding the active cycle.
    pub fn force_heartbeat(&mut self) -> Result<u32, SessionError> {
        let now_ms = self.clock.now_ms();
        if !self.session.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let Some(HeartbeatEvent::Send { token, payload }) = self.heartbeat.force(now_ms) else {
            return Err(SessionError::NotConnected);
        };

        self.session
            .publish(&self.config.heartbeat.publish_topic, &payload)?;
        self.note(now_ms, format!("Manual heartbeat #{token} sent"));
        Ok(token)
    }

    /// Drops link and session; both come back on the following ticks without
    /// waiting out their retry intervals. Raises no alert.
    pub fn force_reconnect(&mut self) {
        let now_ms = self.clock.now_ms();
        self.note(now_ms, "Manual reconnect requested");

        if self.session.force_reconnect(now_ms).is_some() {
            self.heartbeat.reset();
        }
        self.link.force_reconnect(now_ms);
    }

    pub fn reconfigure(&mut self, mut config: WatchdogConfig) -> Result<(), ConfigError> {
        config.sanitize();
        config.validate()?;
        let now_ms = self.clock.now_ms();

        self.session.reconfigure(config.mqtt.clone(), now_ms);
        self.session.resubscribe(
            self.ack_subscription,
            config.heartbeat.subscribe_topic.clone(),
        );
        self.link
            .reconfigure(config.wifi.clone(), config.device.hostname.clone(), now_ms);
        self.heartbeat.reconfigure(&config.heartbeat);
        self.alerts.reconfigure(
            &config.alerts,
            &config.telegram,
            config.device.friendly_name.clone(),
        );
        self.console.set_debug(config.debug);
        self.config = config;

        self.note(now_ms, "Configuration reloaded");
        Ok(())
    }

    fn on_session_transition(&mut self, transition: SessionTransition, now_ms: u64) {
        match transition {
            SessionTransition::Established => {
                let line = format!(
                    "MQTT connected to {}:{}",
                    self.config.mqtt.host, self.config.mqtt.port
                );
                self.note(now_ms, line);
                self.heartbeat.start(now_ms);
            }
            SessionTransition::Lost(cause) => {
                // The active cycle can never be acknowledged now; drop it
                // rather than let it time out into a spurious miss.
                self.heartbeat.reset();
                let line = format!("MQTT session lost ({cause:?})");
                self.note(now_ms, line);
                if cause == SessionLoss::BrokerClosed {
                    let event = AlertEvent::session_lost(&self.config.mqtt.host, now_ms);
                    self.raise(event);
                }
            }
        }
    }

    fn route(&mut self, delivery: Delivery, now_ms: u64) {
        if delivery.subscription != self.ack_subscription {
            debug!("no handler for message on {}", delivery.message.topic);
            return;
        }

        match self.heartbeat.on_ack(&delivery.message.payload, now_ms) {
            AckOutcome::Accepted {
                token,
                round_trip_ms,
                recovered_from,
            } => {
                debug!(token, round_trip_ms, "heartbeat acknowledged");
                self.console.debug(
                    now_ms,
                    format!("Heartbeat #{token} acknowledged in {round_trip_ms} ms"),
                );
                if recovered_from > 0 {
                    self.note(
                        now_ms,
                        format!("Heartbeat recovered after {recovered_from} missed"),
                    );
                    self.raise(AlertEvent::recovered(recovered_from, now_ms));
                }
            }
            AckOutcome::Stale { token } => {
                debug!(token, "ignoring stale heartbeat acknowledgement");
            }
            AckOutcome::Superseded { token, current } => {
                warn!(
                    token,
                    current, "heartbeat ack arrived after the next heartbeat was sent"
                );
                self.console.debug(
                    now_ms,
                    format!("Heartbeat #{token} acknowledged too late; #{current} already sent"),
                );
            }
            AckOutcome::Malformed(err) => {
                warn!(topic = %delivery.message.topic, "discarding heartbeat ack: {err}");
                self.console
                    .debug(now_ms, format!("Discarded malformed heartbeat ack: {err}"));
            }
        }
    }

    fn on_heartbeat_event(&mut self, event: HeartbeatEvent, now_ms: u64) {
        match event {
            HeartbeatEvent::Send { token, payload } => {
                match self
                    .session
                    .publish(&self.config.heartbeat.publish_topic, &payload)
                {
                    Ok(()) => {
                        debug!(token, "heartbeat sent");
                        self.console
                            .debug(now_ms, format!("Heartbeat #{token} sent"));
                    }
                    Err(err) => {
                        warn!(token, "heartbeat publish failed: {err}");
                        self.note(now_ms, format!("Heartbeat #{token} publish failed: {err}"));
                    }
                }
            }
            HeartbeatEvent::Missed { token, consecutive } => {
                self.note(
                    now_ms,
                    format!("Heartbeat #{token} not acknowledged ({consecutive} in a row)"),
                );
                self.raise(AlertEvent::heartbeat_missed(consecutive, now_ms));
            }
        }
    }

    fn raise(&mut self, event: AlertEvent) {
        self.alerts.dispatch(&event);
        if self.recent_alerts.len() == ALERT_HISTORY {
            self.recent_alerts.pop_front();
        }
        self.recent_alerts.push_back(event);
    }

    fn note(&mut self, now_ms: u64, line: impl Into<String>) {
        let line = line.into();
        info!("{line}");
        self.console.push(now_ms, line);
    }
}
