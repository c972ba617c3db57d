use std::{io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use watchdog_common::{
    AlertError, AlertEvent, AlertSink, BrokerTransport, ConfigError, ConsoleLine, InboundMessage,
    LinkDriver, LinkError, MonotonicClock, MqttConfig, SendStatus, SessionError, StatusSnapshot,
    Supervisor, TelegramConfig, TransportEvent, WatchdogConfig, WifiConfig,
};

const TICK_PERIOD: Duration = Duration::from_millis(250);
const COMMAND_QUEUE: usize = 8;
const MQTT_CHANNEL_CAPACITY: usize = 32;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const TELEGRAM_API: &str = "https://api.telegram.org";
const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);
const HOST_NETWORK_SSID: &str = "host-network";

type HostSupervisor = Supervisor<HostLink, MqttTransport, TelegramSink, MonotonicClock>;

#[derive(Clone)]
struct AppState {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ControlView>,
    store: ConfigStore,
}

#[derive(Clone)]
struct ConfigStore {
    config_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Requests handled on the control task, which owns the supervisor.
enum Command {
    ForceHeartbeat(oneshot::Sender<Result<u32, SessionError>>),
    ForceReconnect,
    Reconfigure(Box<WatchdogConfig>, oneshot::Sender<Result<(), ConfigError>>),
}

#[derive(Debug, Clone)]
struct ControlView {
    status: StatusSnapshot,
    log: Vec<ConsoleLine>,
    alerts: Vec<AlertEvent>,
    config: ConfigView,
}

impl ControlView {
    fn capture(supervisor: &HostSupervisor) -> Self {
        Self {
            status: supervisor.snapshot(),
            log: supervisor.console_lines(),
            alerts: supervisor.recent_alerts(),
            config: build_config_view(supervisor.config()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: StatusSnapshot,
    #[serde(rename = "watchdogHealthy")]
    watchdog_healthy: bool,
    #[serde(rename = "wallClock")]
    wall_clock: String,
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    token: u32,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    accepted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ConfigView {
    hostname: String,
    #[serde(rename = "friendlyName")]
    friendly_name: String,
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    mqtt_pass_set: bool,
    #[serde(rename = "mqttClientId")]
    mqtt_client_id: String,
    #[serde(rename = "publishTopic")]
    publish_topic: String,
    #[serde(rename = "subscribeTopic")]
    subscribe_topic: String,
    #[serde(rename = "sendIntervalMs")]
    send_interval_ms: u64,
    #[serde(rename = "receivedIntervalMs")]
    received_interval_ms: u64,
    #[serde(rename = "telegramConfigured")]
    telegram_configured: bool,
    debug: bool,
}

#[derive(Debug, Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let config = store
        .load()
        .await
        .context("failed to load watchdog config")?;
    info!(
        "config loaded: device=`{}`, mqtt=`{}:{}`, heartbeat=`{}` -> `{}`",
        config.device.hostname,
        config.mqtt.host,
        config.mqtt.port,
        config.heartbeat.publish_topic,
        config.heartbeat.subscribe_topic,
    );

    let telegram = TelegramSink::new(&config.telegram)?;
    if !telegram.is_configured() {
        warn!("telegram bot token or chat id missing; alerts will only be logged");
    }

    let supervisor = Supervisor::new(
        config,
        HostLink::default(),
        MqttTransport::new(),
        telegram,
        MonotonicClock::new(),
    )
    .context("invalid watchdog config")?;

    let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (view_tx, view) = watch::channel(ControlView::capture(&supervisor));
    spawn_control_loop(supervisor, command_rx, view_tx);
    spawn_reload_on_hangup(store.clone(), commands.clone());

    let app_state = AppState {
        commands,
        view,
        store,
    };

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/log", get(handle_get_log))
        .route("/api/alerts", get(handle_get_alerts))
        .route("/api/config", get(handle_get_config))
        .route("/api/config/reload", post(handle_reload_config))
        .route("/api/heartbeat", post(handle_force_heartbeat))
        .route("/api/reconnect", post(handle_force_reconnect))
        .with_state(app_state);

    let port = std::env::var("WATCHDOG_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("watchdog status on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_control_loop(
    mut supervisor: HostSupervisor,
    mut commands: mpsc::Receiver<Command>,
    view: watch::Sender<ControlView>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => supervisor.tick(),
                command = commands.recv() => match command {
                    Some(command) => handle_command(&mut supervisor, command),
                    None => break,
                },
            }
            view.send_replace(ControlView::capture(&supervisor));
        }
        warn!("control loop stopped");
    });
}

fn handle_command(supervisor: &mut HostSupervisor, command: Command) {
    match command {
        Command::ForceHeartbeat(reply) => {
            let _ = reply.send(supervisor.force_heartbeat());
        }
        Command::ForceReconnect => supervisor.force_reconnect(),
        Command::Reconfigure(config, reply) => {
            let _ = reply.send(supervisor.reconfigure(*config));
        }
    }
}

#[cfg(unix)]
fn spawn_reload_on_hangup(store: ConfigStore, commands: mpsc::Sender<Command>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(err) => {
                warn!("SIGHUP reload unavailable: {err}");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received; reloading config");
            if let Err(err) = reload_config(&store, &commands).await {
                warn!("config reload failed: {err:#}");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_store: ConfigStore, _commands: mpsc::Sender<Command>) {}

async fn reload_config(store: &ConfigStore, commands: &mpsc::Sender<Command>) -> anyhow::Result<()> {
    let config = store.load().await?;
    let (reply, result) = oneshot::channel();
    commands
        .send(Command::Reconfigure(Box::new(config), reply))
        .await
        .map_err(|_| anyhow!("control loop is not running"))?;
    result.await.context("control loop dropped reload")??;
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.view.borrow().status.clone();
    Json(StatusResponse {
        watchdog_healthy: status.is_healthy(),
        wall_clock: Utc::now().to_rfc3339(),
        status,
    })
}

async fn handle_get_log(State(state): State<AppState>) -> impl IntoResponse {
    let log = state.view.borrow().log.clone();
    Json(log)
}

async fn handle_get_alerts(State(state): State<AppState>) -> impl IntoResponse {
    let alerts = state.view.borrow().alerts.clone();
    Json(alerts)
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.view.borrow().config.clone();
    Json(config)
}

async fn handle_reload_config(State(state): State<AppState>) -> axum::response::Response {
    match reload_config(&state.store, &state.commands).await {
        Ok(()) => {
            let config = state.view.borrow().config.clone();
            Json(config).into_response()
        }
        Err(err) => error_response(StatusCode::BAD_REQUEST, &format!("{err:#}")),
    }
}

async fn handle_force_heartbeat(State(state): State<AppState>) -> axum::response::Response {
    let (reply, result) = oneshot::channel();
    if state
        .commands
        .send(Command::ForceHeartbeat(reply))
        .await
        .is_err()
    {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop is not running");
    }

    match result.await {
        Ok(Ok(token)) => Json(HeartbeatResponse { token }).into_response(),
        Ok(Err(err)) => error_response(StatusCode::CONFLICT, &err.to_string()),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop is not running"),
    }
}

async fn handle_force_reconnect(State(state): State<AppState>) -> axum::response::Response {
    match state.commands.send(Command::ForceReconnect).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse { accepted: true }),
        )
            .into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop is not running"),
    }
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("WATCHDOG_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.watchdog"));

        Self {
            config_path: Arc::new(data_dir.join("watchdog.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Reads `watchdog.json`, applies environment overrides and validates.
    async fn load(&self) -> anyhow::Result<WatchdogConfig> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref();
        let mut config = match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice::<WatchdogConfig>(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no config at {}; using defaults", path.display());
                WatchdogConfig::default()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        if config.wifi.ssid.trim().is_empty() {
            config.wifi.ssid = HOST_NETWORK_SSID.to_string();
        }
        config.sanitize();
        config.validate()?;
        Ok(config)
    }
}

fn apply_env_overrides(config: &mut WatchdogConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(ssid) = lookup("WIFI_SSID") {
        config.wifi.ssid = ssid;
    }
    if let Some(host) = lookup("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.mqtt.port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        config.mqtt.username = user;
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        config.mqtt.password = pass;
    }
    if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
        config.telegram.bot_token = token;
    }
    if let Some(chat_id) = lookup("TELEGRAM_CHAT_ID") {
        config.telegram.chat_id = chat_id;
    }
}

fn build_config_view(config: &WatchdogConfig) -> ConfigView {
    ConfigView {
        hostname: config.device.hostname.clone(),
        friendly_name: config.device.friendly_name.clone(),
        wifi_ssid: config.wifi.ssid.clone(),
        wifi_pass_set: !config.wifi.psk.is_empty(),
        mqtt_host: config.mqtt.host.clone(),
        mqtt_port: config.mqtt.port,
        mqtt_user: config.mqtt.username.clone(),
        mqtt_pass_set: !config.mqtt.password.is_empty(),
        mqtt_client_id: config.mqtt.client_id.clone(),
        publish_topic: config.heartbeat.publish_topic.clone(),
        subscribe_topic: config.heartbeat.subscribe_topic.clone(),
        send_interval_ms: config.heartbeat.send_interval_ms,
        received_interval_ms: config.heartbeat.received_interval_ms,
        telegram_configured: config.telegram.is_configured(),
        debug: config.debug,
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// On a host the network is whatever the OS provides; association always succeeds.
#[derive(Debug, Default)]
struct HostLink {
    up: bool,
}

impl LinkDriver for HostLink {
    fn connect(&mut self, _wifi: &WifiConfig, hostname: &str) -> Result<(), LinkError> {
        debug!(hostname, "using host network");
        self.up = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.up = false;
    }

    fn is_associated(&self) -> bool {
        self.up
    }
}

/// rumqttc client whose event loop runs on its own task. Events are tagged
/// with the generation of the connection that produced them.
struct MqttTransport {
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
}

impl MqttTransport {
    fn new() -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            client: None,
            poller: None,
            generation: 0,
            events_tx,
            events,
        }
    }

    fn stop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        self.generation = self.generation.wrapping_add(1);
    }
}

impl BrokerTransport for MqttTransport {
    fn connect(&mut self, mqtt: &MqttConfig) -> Result<(), SessionError> {
        self.stop();
        let (client, eventloop) = AsyncClient::new(mqtt_options(mqtt), MQTT_CHANNEL_CAPACITY);
        self.poller = Some(spawn_mqtt_poller(
            eventloop,
            self.generation,
            self.events_tx.clone(),
        ));
        self.client = Some(client);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stop();
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| SessionError::Transport(err.to_string()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| SessionError::Transport(err.to_string()))
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        while let Ok((generation, event)) = self.events.try_recv() {
            if generation == self.generation {
                return Some(event);
            }
            debug!("dropping mqtt event from stale connection {generation}");
        }
        None
    }
}

fn mqtt_options(mqtt: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
    options.set_keep_alive(Duration::from_secs(u64::from(mqtt.keep_alive_secs.max(5))));
    options.set_clean_session(true);
    if !mqtt.username.is_empty() {
        options.set_credentials(mqtt.username.clone(), mqtt.password.clone());
    }
    options
}

fn spawn_mqtt_poller(
    mut eventloop: EventLoop,
    generation: u64,
    events: mpsc::UnboundedSender<(u64, TransportEvent)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (event, last) = match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        (TransportEvent::Connected, false)
                    } else {
                        (TransportEvent::ConnectFailed(format!("{:?}", ack.code)), true)
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            message.topic,
                            message.payload.len()
                        );
                        continue;
                    }
                    let message = InboundMessage {
                        topic: message.topic,
                        payload: message.payload.to_vec(),
                    };
                    (TransportEvent::Message(message), false)
                }
                Ok(_) => continue,
                // The session manager owns reconnects; this connection is done.
                Err(err) => (TransportEvent::Closed(err.to_string()), true),
            };

            if events.send((generation, event)).is_err() || last {
                break;
            }
        }
    })
}

/// Telegram Bot API channel. Each alert is posted from its own task so the
/// control loop never waits on HTTPS; results come back over `outcomes`.
struct TelegramSink {
    client: reqwest::Client,
    telegram: TelegramConfig,
    api_base: String,
    outcomes_tx: mpsc::UnboundedSender<Result<(), AlertError>>,
    outcomes: mpsc::UnboundedReceiver<Result<(), AlertError>>,
}

impl TelegramSink {
    fn new(telegram: &TelegramConfig) -> anyhow::Result<Self> {
        Self::with_api_base(telegram, TELEGRAM_API)
    }

    fn with_api_base(telegram: &TelegramConfig, api_base: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(TELEGRAM_TIMEOUT)
            .build()
            .context("failed to build telegram http client")?;
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
        Ok(Self {
            client,
            telegram: telegram.clone(),
            api_base: api_base.to_string(),
            outcomes_tx,
            outcomes,
        })
    }
}

fn telegram_url(api_base: &str, bot_token: &str) -> String {
    format!("{api_base}/bot{bot_token}/sendMessage")
}

async fn post_telegram(request: reqwest::RequestBuilder) -> Result<(), AlertError> {
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            debug!("telegram accepted alert");
            Ok(())
        }
        Ok(response) => {
            warn!("telegram rejected alert: HTTP {}", response.status());
            Err(AlertError::Delivery(format!("HTTP {}", response.status())))
        }
        Err(err) => {
            let err = err.without_url();
            warn!("telegram delivery failed: {err}");
            Err(AlertError::Delivery(err.to_string()))
        }
    }
}

impl AlertSink for TelegramSink {
    fn is_configured(&self) -> bool {
        self.telegram.is_configured()
    }

    fn send(&mut self, text: &str) -> Result<SendStatus, AlertError> {
        if !self.is_configured() {
            return Err(AlertError::NotConfigured);
        }

        let request = self
            .client
            .post(telegram_url(&self.api_base, &self.telegram.bot_token))
            .json(&TelegramMessage {
                chat_id: &self.telegram.chat_id,
                text,
            });
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            // The receiver lives as long as the supervisor.
            let _ = outcomes.send(post_telegram(request).await);
        });
        Ok(SendStatus::InFlight)
    }

    fn poll_outcome(&mut self) -> Option<Result<(), AlertError>> {
        self.outcomes.try_recv().ok()
    }

    fn reconfigure(&mut self, telegram: &TelegramConfig) {
        self.telegram = telegram.clone();
    }
}
