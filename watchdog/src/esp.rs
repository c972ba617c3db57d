use core::convert::TryInto;
use std::{
    sync::{
        mpsc::{self, Receiver, Sender, SyncSender, TrySendError},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Write,
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::EspWifi,
};
use log::{debug, info, warn};
use serde::Serialize;

use watchdog_common::{
    AlertError, AlertEvent, AlertSink, BrokerTransport, ConsoleLine, InboundMessage, LinkDriver,
    LinkError, MonotonicClock, MqttConfig, SendStatus, SessionError, StatusSnapshot, Supervisor,
    TelegramConfig, TransportEvent, WatchdogConfig, WifiConfig,
};

const NVS_NAMESPACE: &str = "watchdog";
const NVS_CONFIG_KEY: &str = "config_json";
const MAX_HTTP_BODY: usize = 4096;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const TICK_PERIOD_MS: u64 = 250;
const ALERT_QUEUE: usize = 8;
const TELEGRAM_API: &str = "https://api.telegram.org";
const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

type EspSupervisor = Supervisor<EspLink, EspMqttTransport, TelegramSink, MonotonicClock>;

enum Command {
    ForceHeartbeat(SyncSender<Result<u32, SessionError>>),
    ForceReconnect,
}

#[derive(Debug, Clone)]
struct ControlView {
    status: StatusSnapshot,
    log: Vec<ConsoleLine>,
    alerts: Vec<AlertEvent>,
}

impl ControlView {
    fn capture(supervisor: &EspSupervisor) -> Self {
        Self {
            status: supervisor.snapshot(),
            log: supervisor.console_lines(),
            alerts: supervisor.recent_alerts(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: StatusSnapshot,
    #[serde(rename = "watchdogHealthy")]
    watchdog_healthy: bool,
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    token: u32,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    accepted: bool,
}

#[derive(Debug, Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let config = nvs_store
        .load_config()
        .context("failed to load watchdog config from NVS")?;
    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, heartbeat=`{}` -> `{}`",
        config.wifi.ssid,
        config.mqtt.host,
        config.mqtt.port,
        config.heartbeat.publish_topic,
        config.heartbeat.subscribe_topic,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

    let telegram = TelegramSink::spawn(&config.telegram)?;
    if !telegram.is_configured() {
        warn!("telegram bot token or chat id missing; alerts will only be logged");
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let supervisor = Supervisor::new(
        config,
        EspLink { wifi },
        EspMqttTransport::new(),
        telegram,
        MonotonicClock::new(),
    )
    .context("invalid watchdog config")?;

    let view = Arc::new(Mutex::new(ControlView::capture(&supervisor)));
    let (commands, command_rx) = mpsc::channel();
    spawn_control_loop(supervisor, command_rx, view.clone())?;

    let server = create_http_server(view, commands)?;

    // Keep the server alive for the program lifetime.
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn spawn_control_loop(
    mut supervisor: EspSupervisor,
    commands: Receiver<Command>,
    view: Arc<Mutex<ControlView>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            loop {
                feed_watchdog();

                while let Ok(command) = commands.try_recv() {
                    match command {
                        Command::ForceHeartbeat(reply) => {
                            let result = supervisor.force_heartbeat();
                            match &result {
                                Ok(token) => info!("manual heartbeat #{token} sent"),
                                Err(err) => warn!("manual heartbeat failed: {err}"),
                            }
                            let _ = reply.try_send(result);
                        }
                        Command::ForceReconnect => supervisor.force_reconnect(),
                    }
                }

                supervisor.tick();
                *view.lock().unwrap_or_else(PoisonError::into_inner) =
                    ControlView::capture(&supervisor);

                thread::sleep(Duration::from_millis(TICK_PERIOD_MS));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn create_http_server(
    view: Arc<Mutex<ControlView>>,
    commands: Sender<Command>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let view = view.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = view
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .status
                .clone();
            write_json(
                req,
                &StatusResponse {
                    watchdog_healthy: status.is_healthy(),
                    status,
                },
            )
        })?;
    }

    {
        let view = view.clone();
        server.fn_handler("/api/log", Method::Get, move |req| {
            let log = view.lock().unwrap_or_else(PoisonError::into_inner).log.clone();
            write_json(req, &log)
        })?;
    }

    {
        let view = view.clone();
        server.fn_handler("/api/alerts", Method::Get, move |req| {
            let alerts = view
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .alerts
                .clone();
            write_json(req, &alerts)
        })?;
    }

    {
        let commands = commands.clone();
        server.fn_handler("/api/heartbeat", Method::Post, move |req| {
            let (reply, result) = mpsc::sync_channel(1);
            if commands.send(Command::ForceHeartbeat(reply)).is_err() {
                return write_error(req, 503, "control loop is not running");
            }
            match result.recv_timeout(COMMAND_REPLY_TIMEOUT) {
                Ok(Ok(token)) => write_json(req, &HeartbeatResponse { token }),
                Ok(Err(err)) => write_error(req, 409, &err.to_string()),
                Err(_) => write_error(req, 503, "control loop is not running"),
            }
        })?;
    }

    server.fn_handler("/api/reconnect", Method::Post, move |req| {
        if commands.send(Command::ForceReconnect).is_err() {
            return write_error(req, 503, "control loop is not running");
        }
        write_json(req, &AcceptedResponse { accepted: true })
    })?;

    Ok(server)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    if body.len() > MAX_HTTP_BODY {
        warn!("status response is {} bytes", body.len());
    }
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<WatchdogConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        let mut config = match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => serde_json::from_str::<WatchdogConfig>(value)
                .context("stored watchdog config is not valid JSON")?,
            None => {
                warn!("no watchdog config in NVS; using defaults");
                WatchdogConfig::default()
            }
        };
        config.sanitize();
        config.validate()?;
        Ok(config)
    }
}

struct EspLink {
    wifi: EspWifi<'static>,
}

fn driver_error(err: EspError) -> LinkError {
    LinkError::Driver(err.to_string())
}

impl LinkDriver for EspLink {
    fn connect(&mut self, wifi: &WifiConfig, hostname: &str) -> Result<(), LinkError> {
        let auth_method = if wifi.psk.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let configuration = Configuration::Client(ClientConfiguration {
            ssid: wifi
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| LinkError::Driver("wifi ssid too long".to_string()))?,
            password: wifi
                .psk
                .as_str()
                .try_into()
                .map_err(|_| LinkError::Driver("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });

        if let Err(err) = self.wifi.sta_netif_mut().set_hostname(hostname) {
            warn!("failed to set hostname `{hostname}`: {err}");
        }
        self.wifi
            .set_configuration(&configuration)
            .map_err(driver_error)?;
        if !self.wifi.is_started().map_err(driver_error)? {
            self.wifi.start().map_err(driver_error)?;
            disable_wifi_power_save();
        }
        self.wifi.connect().map_err(driver_error)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect: {err}");
        }
    }

    fn is_associated(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn rssi(&self) -> Option<i8> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info.rssi)
    }
}

/// ESP-IDF MQTT client. Each connection gets its own receiver thread that
/// ends when the client is dropped; its events carry the connection generation.
struct EspMqttTransport {
    client: Option<EspMqttClient<'static>>,
    generation: u64,
    events_tx: Sender<(u64, TransportEvent)>,
    events: Receiver<(u64, TransportEvent)>,
}

impl EspMqttTransport {
    fn new() -> Self {
        let (events_tx, events) = mpsc::channel();
        Self {
            client: None,
            generation: 0,
            events_tx,
            events,
        }
    }

    fn stop(&mut self) {
        self.client = None;
        self.generation = self.generation.wrapping_add(1);
    }
}

fn transport_error(err: EspError) -> SessionError {
    SessionError::Transport(err.to_string())
}

impl BrokerTransport for EspMqttTransport {
    fn connect(&mut self, mqtt: &MqttConfig) -> Result<(), SessionError> {
        self.stop();

        let url = format!("mqtt://{}:{}", mqtt.host, mqtt.port);
        let conf = MqttClientConfiguration {
            client_id: Some(mqtt.client_id.as_str()),
            username: if mqtt.username.is_empty() {
                None
            } else {
                Some(mqtt.username.as_str())
            },
            password: if mqtt.password.is_empty() {
                None
            } else {
                Some(mqtt.password.as_str())
            },
            keep_alive_interval: Some(Duration::from_secs(u64::from(mqtt.keep_alive_secs))),
            ..Default::default()
        };

        let (client, connection) =
            EspMqttClient::new(url.as_str(), &conf).map_err(transport_error)?;
        spawn_mqtt_receiver(connection, self.generation, self.events_tx.clone())?;
        self.client = Some(client);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stop();
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        let client = self.client.as_mut().ok_or(SessionError::NotConnected)?;
        client
            .enqueue(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(transport_error)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        let client = self.client.as_mut().ok_or(SessionError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(transport_error)
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

fn spawn_mqtt_receiver(
    mut connection: EspMqttConnection,
    generation: u64,
    events: Sender<(u64, TransportEvent)>,
) -> Result<(), SessionError> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            while let Ok(event) = connection.next() {
                let translated = match event.payload() {
                    EventPayload::Connected(_) => Some(TransportEvent::Connected),
                    EventPayload::Disconnected => {
                        Some(TransportEvent::Closed("broker disconnected".to_string()))
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            None
                        } else if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            None
                        } else {
                            Some(TransportEvent::Message(InboundMessage {
                                topic: topic.to_string(),
                                payload: data.to_vec(),
                            }))
                        }
                    }
                    EventPayload::Error(err) => {
                        warn!("mqtt error: {err:?}");
                        None
                    }
                    _ => None,
                };

                if let Some(event) = translated {
                    if events.send((generation, event)).is_err() {
                        break;
                    }
                }
            }
            debug!("mqtt receiver for connection {generation} finished");
        })
        .map_err(|err| SessionError::Transport(err.to_string()))?;
    Ok(())
}

/// Alerts are posted from a dedicated thread; `send` only enqueues and the
/// thread reports each result back over `outcomes`.
struct TelegramSink {
    telegram: Arc<Mutex<TelegramConfig>>,
    queue: SyncSender<String>,
    outcomes: Receiver<Result<(), AlertError>>,
}

impl TelegramSink {
    fn spawn(telegram: &TelegramConfig) -> anyhow::Result<Self> {
        let telegram = Arc::new(Mutex::new(telegram.clone()));
        let (queue, pending) = mpsc::sync_channel::<String>(ALERT_QUEUE);
        let (outcomes_tx, outcomes) = mpsc::channel();

        let shared = telegram.clone();
        thread::Builder::new()
            .name("telegram".into())
            .stack_size(10 * 1024)
            .spawn(move || {
                for text in pending {
                    let telegram = shared
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    let outcome = match post_telegram(&telegram, &text) {
                        Ok(()) => {
                            info!("telegram accepted alert");
                            Ok(())
                        }
                        Err(err) => {
                            warn!("telegram delivery failed: {err:#}");
                            Err(AlertError::Delivery(format!("{err:#}")))
                        }
                    };
                    if outcomes_tx.send(outcome).is_err() {
                        break;
                    }
                }
            })
            .context("failed to spawn telegram thread")?;

        Ok(Self {
            telegram,
            queue,
            outcomes,
        })
    }
}

impl AlertSink for TelegramSink {
    fn is_configured(&self) -> bool {
        self.telegram
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_configured()
    }

    fn send(&mut self, text: &str) -> Result<SendStatus, AlertError> {
        if !self.is_configured() {
            return Err(AlertError::NotConfigured);
        }
        match self.queue.try_send(text.to_string()) {
            Ok(()) => Ok(SendStatus::InFlight),
            Err(TrySendError::Full(_)) => {
                Err(AlertError::Delivery("telegram queue full".to_string()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(AlertError::Delivery("telegram sender stopped".to_string()))
            }
        }
    }

    fn poll_outcome(&mut self) -> Option<Result<(), AlertError>> {
        self.outcomes.try_recv().ok()
    }

    fn reconfigure(&mut self, telegram: &TelegramConfig) {
        *self.telegram.lock().unwrap_or_else(PoisonError::into_inner) = telegram.clone();
    }
}

fn post_telegram(telegram: &TelegramConfig, text: &str) -> anyhow::Result<()> {
    let url = format!("{TELEGRAM_API}/bot{}/sendMessage", telegram.bot_token);
    let body = serde_json::to_vec(&TelegramMessage {
        chat_id: &telegram.chat_id,
        text,
    })?;
    let content_length = body.len().to_string();
    let headers = [
        ("content-type", "application/json"),
        ("content-length", content_length.as_str()),
    ];

    let http_conf = HttpClientConfiguration {
        timeout: Some(TELEGRAM_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let mut request = client
        .request(Method::Post, &url, &headers)
        .map_err(|e| anyhow!("{e:?}"))?;
    request.write_all(&body).map_err(|e| anyhow!("{e:?}"))?;
    request.flush().map_err(|e| anyhow!("{e:?}"))?;
    let response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("telegram returned HTTP {status}"));
    }
    Ok(())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
