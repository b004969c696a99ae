use std::{
    convert::Infallible,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use ramp_common::{
    protocol::encode_response,
    store::{BringUp, MediumError, PersistentMedium},
    types::PROFILE_REGION_BYTES,
    ActuatorDriver, ButtonLine, ButtonLines, Effect, Level, ProfileController, ProfileStore,
    Response, RuntimeConfig, PRESENCE_OFFLINE, PRESENCE_ONLINE, TOPIC_LINK_NOTIFY,
    TOPIC_LINK_PRESENCE, TOPIC_LINK_REQUEST,
};

use crate::clock::{monotonic_ms, MonotonicClock};

const ACTUATOR_QUEUE_DEPTH: usize = 16;

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<ProfileController<FileMedium>>>,
    mqtt: AsyncClient,
    actuator: mpsc::Sender<u16>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    profile_path: Arc<PathBuf>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let medium = FileMedium::open(store.profile_path.as_ref().clone(), PROFILE_REGION_BYTES)
        .context("failed to open profile medium")?;
    let mut profile_store = ProfileStore::new(medium);
    match profile_store
        .ensure_initialized()
        .context("profile medium bring-up failed")?
    {
        BringUp::Genesis => info!("profile medium was blank; initialised empty profile"),
        BringUp::Existing => info!(
            "profile loaded with {} setpoints",
            profile_store.load().valid_count()
        ),
    }

    let controller = ProfileController::new(profile_store, runtime.run.clone());

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("ramp-controller-rust", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        controller: Arc::new(Mutex::new(controller)),
        mqtt,
        actuator: spawn_actuator_task(&runtime),
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone(), runtime.run.tick_interval_ms);
    spawn_status_loop(app_state.clone(), runtime.run.status_interval_ms);

    info!("ramp controller running; waiting for ctrl-c");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    Ok(())
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_LINK_REQUEST, TOPIC_LINK_PRESENCE] {
        mqtt.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&app_state, &message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    if let Err(err) = subscribe_topics(&app_state.mqtt).await {
                        warn!("mqtt re-subscribe failed: {err:#}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState, tick_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms));

        loop {
            interval.tick().await;
            control_tick(&app_state, monotonic_ms()).await;
        }
    });
}

async fn control_tick(app_state: &AppState, now_ms: u64) {
    let effects = {
        let mut controller = app_state.controller.lock().await;
        let effects = controller.tick(now_ms);
        queue_setpoints(&app_state.actuator, effects).await
    };

    if !effects.is_empty() {
        dispatch_effects(app_state, effects).await;
    }
}

fn spawn_status_loop(app_state: AppState, status_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(status_interval_ms));
        loop {
            interval.tick().await;

            let push = {
                let controller = app_state.controller.lock().await;
                controller.status_push(monotonic_ms())
            };

            if let Some(response) = push {
                publish_response(&app_state, &response).await;
            }
        }
    });
}

/// Runs the keypad driver on a blocking thread so pulse timing never stalls the runtime.
fn spawn_actuator_task(runtime: &RuntimeConfig) -> mpsc::Sender<u16> {
    let (sender, mut receiver) = mpsc::channel::<u16>(ACTUATOR_QUEUE_DEPTH);
    let timing = runtime.actuator;

    tokio::task::spawn_blocking(move || {
        let mut driver = ActuatorDriver::new(LoggedLines, MonotonicClock, timing);
        if let Err(err) = driver.release_all() {
            warn!("failed to release button lines: {err}");
        }

        while let Some(target) = receiver.blocking_recv() {
            match driver.command(target) {
                Ok(report) => info!(
                    setpoint = report.target,
                    presses = report.presses,
                    duration_ms = report.duration_ms,
                    "setpoint entered"
                ),
                Err(err) => warn!("actuator command for {target} failed: {err}"),
            }
            debug!(diagnostics = ?driver.diagnostics(), "actuator diagnostics");
        }
        info!("actuator queue closed");
    });

    sender
}

async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) {
    let now_ms = monotonic_ms();

    match topic {
        TOPIC_LINK_PRESENCE => {
            let effects = {
                let mut controller = app_state.controller.lock().await;
                let effects = match payload {
                    p if p == PRESENCE_ONLINE.as_bytes() => {
                        controller.on_connect();
                        info!("control link connected");
                        Vec::new()
                    }
                    p if p == PRESENCE_OFFLINE.as_bytes() => {
                        info!("control link disconnected");
                        controller.on_disconnect()
                    }
                    _ => {
                        warn!("ignoring unknown presence payload ({} bytes)", payload.len());
                        Vec::new()
                    }
                };
                queue_setpoints(&app_state.actuator, effects).await
            };
            dispatch_effects(app_state, effects).await;
        }
        TOPIC_LINK_REQUEST => {
            let result = {
                let mut controller = app_state.controller.lock().await;
                let result = controller.on_request(payload, now_ms);
                match result {
                    Ok(effects) => Ok(queue_setpoints(&app_state.actuator, effects).await),
                    Err(err) => Err(err),
                }
            };
            match result {
                Ok(effects) => dispatch_effects(app_state, effects).await,
                Err(err) => warn!("dropping request ({} bytes): {err}", payload.len()),
            }
        }
        _ => {}
    }
}

/// Must run while the controller lock is held, so the actuator queue sees
/// setpoints in the order the controller issued them. Returns the remaining effects.
async fn queue_setpoints(actuator: &mpsc::Sender<u16>, effects: Vec<Effect>) -> Vec<Effect> {
    let mut rest = Vec::with_capacity(effects.len());
    for effect in effects {
        match effect {
            Effect::Actuate(target) => {
                if actuator.send(target).await.is_err() {
                    warn!("actuator task is gone; setpoint {target} not entered");
                }
            }
            other => rest.push(other),
        }
    }
    rest
}

async fn dispatch_effects(app_state: &AppState, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Actuate(target) => debug!("setpoint {target} already queued"),
            Effect::Notify(response) => publish_response(app_state, &response).await,
            Effect::RunStateChanged(state) => info!("run state -> {}", state.as_str()),
            Effect::ProfileSaved { stored, dropped } => {
                info!("profile saved with {stored} setpoints");
                if dropped > 0 {
                    warn!("profile truncated; {dropped} setpoints over capacity dropped");
                }
            }
            Effect::PersistenceFailed(reason) => warn!("profile save failed: {reason}"),
        }
    }
}

async fn publish_response(app_state: &AppState, response: &Response) {
    let body = match encode_response(response) {
        Ok(body) => body,
        Err(err) => {
            warn!("dropping {} response: {err}", response.command());
            return;
        }
    };

    if let Err(err) = app_state
        .mqtt
        .publish(TOPIC_LINK_NOTIFY, QoS::AtLeastOnce, false, body)
        .await
    {
        warn!("{} publish failed: {err}", response.command());
    }
}

/// Button lines for a machine without GPIO: every level change becomes a log line.
struct LoggedLines;

impl ButtonLines for LoggedLines {
    type Error = Infallible;

    fn drive(&mut self, line: ButtonLine, level: Level) -> Result<(), Self::Error> {
        debug!(line = line.as_str(), level = level.as_str(), "button line");
        Ok(())
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("THERMOSTAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.thermostat"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            profile_path: Arc::new(data_dir.join("profile.bin")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Profile region kept in a file. Writes stay in memory until `commit`
/// replaces the file in one rename.
#[derive(Debug)]
struct FileMedium {
    path: PathBuf,
    working: Vec<u8>,
}

impl FileMedium {
    fn open(path: PathBuf, capacity: usize) -> anyhow::Result<Self> {
        let mut working = vec![0xFF; capacity];
        match std::fs::read(&path) {
            Ok(raw) => {
                let len = raw.len().min(capacity);
                working[..len].copy_from_slice(&raw[..len]);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        }
        Ok(Self { path, working })
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), MediumError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.working.len() => Ok(()),
            _ => Err(MediumError::OutOfBounds {
                offset,
                len,
                size: self.working.len(),
            }),
        }
    }
}

fn replace_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("tmp");
    let mut file = std::fs::File::create(&staging)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&staging, path)
}

impl PersistentMedium for FileMedium {
    fn capacity(&self) -> usize {
        self.working.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), MediumError> {
        self.check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.working[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), MediumError> {
        self.check_bounds(offset, bytes.len())?;
        self.working[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), MediumError> {
        replace_file(&self.path, &self.working).map_err(|err| {
            MediumError::Commit(format!("{}: {err}", self.path.display()))
        })
    }
}
