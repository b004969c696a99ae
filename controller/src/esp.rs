use core::convert::TryInto;
use std::{
    sync::{
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use ramp_common::{
    config::{ActuatorConfig, NetworkConfig},
    protocol::encode_response,
    store::{BringUp, MediumError, PersistentMedium},
    types::PROFILE_REGION_BYTES,
    ActuatorDriver, Effect, ProfileController, ProfileStore, Response, RuntimeConfig,
    PRESENCE_OFFLINE, PRESENCE_ONLINE, TOPIC_LINK_NOTIFY, TOPIC_LINK_PRESENCE, TOPIC_LINK_REQUEST,
};

use crate::{
    buttons::GpioLines,
    clock::{monotonic_ms, MonotonicClock},
};

const NVS_NAMESPACE: &str = "ramp";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_PROFILE_KEY: &str = "profile";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const ACTUATOR_QUEUE_DEPTH: usize = 16;
const LED_PERIOD_MS: u64 = 10_000;
const LED_ON_MS: u64 = 500;

type SharedController = Arc<Mutex<ProfileController<NvsMedium>>>;
type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

#[derive(Clone)]
struct SharedState {
    controller: SharedController,
    mqtt: SharedMqtt,
    actuator: SyncSender<u16>,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, tick={}ms",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.run.tick_interval_ms,
    );

    let medium = NvsMedium::open(nvs_partition.clone(), PROFILE_REGION_BYTES)
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

    let lines = GpioLines::new(&runtime.pins).context("button line setup failed")?;
    let actuator = spawn_actuator(lines, runtime.actuator);
    let status_led = init_status_led(runtime.pins.status_led_pin);

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let shared_state = SharedState {
        controller: Arc::new(Mutex::new(ProfileController::new(
            profile_store,
            runtime.run.clone(),
        ))),
        mqtt: Arc::new(Mutex::new(mqtt_client)),
        actuator,
    };

    spawn_mqtt_receiver(shared_state.clone(), mqtt_conn);
    spawn_control_loop(shared_state, &runtime, status_led);

    // Keep services alive for the program lifetime.
    let _wifi = wifi;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.stop();
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        ));
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("ramp-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &SharedMqtt) -> anyhow::Result<()> {
    let mut mqtt = lock(mqtt);
    for topic in [TOPIC_LINK_REQUEST, TOPIC_LINK_PRESENCE] {
        mqtt.subscribe(topic, QoS::AtLeastOnce)?;
    }
    Ok(())
}

enum Inbound {
    Connected,
    Message(String, Vec<u8>),
}

fn spawn_mqtt_receiver(state: SharedState, mut conn: EspMqttConnection) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            let inbound = match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => Some(Inbound::Connected),
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => Some(Inbound::Message(topic.to_string(), data.to_vec())),
                    // Chunked payloads are larger than any message we accept.
                    EventPayload::Received { data, .. } => {
                        warn!("dropping fragmented payload chunk ({} bytes)", data.len());
                        None
                    }
                    _ => None,
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    None
                }
            };

            // The client must not be used while the connection still holds an event.
            match inbound {
                Some(Inbound::Connected) => {
                    info!("mqtt connected");
                    if let Err(err) = subscribe_topics(&state.mqtt) {
                        warn!("mqtt subscribe failed: {err:#}");
                    }
                }
                Some(Inbound::Message(topic, payload)) => {
                    handle_mqtt_message(&state, &topic, &payload);
                }
                None => {}
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn spawn_control_loop(
    state: SharedState,
    runtime: &RuntimeConfig,
    mut status_led: Option<StatusLed>,
) {
    let tick_interval_ms = runtime.run.tick_interval_ms;
    let status_interval_ms = runtime.run.status_interval_ms;

    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_tick_ms = 0_u64;
            let mut last_status_ms = 0_u64;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if now_ms.saturating_sub(last_tick_ms) >= tick_interval_ms {
                    last_tick_ms = now_ms;
                    let effects = {
                        let mut controller = lock(&state.controller);
                        let effects = controller.tick(now_ms);
                        queue_setpoints(&state.actuator, effects)
                    };
                    dispatch_effects(&state, effects);
                }

                if now_ms.saturating_sub(last_status_ms) >= status_interval_ms {
                    last_status_ms = now_ms;
                    let push = lock(&state.controller).status_push(now_ms);
                    if let Some(response) = push {
                        publish_response(&state, &response);
                    }
                }

                let running = lock(&state.controller).is_running();
                update_status_led(&mut status_led, running, now_ms);

                thread::sleep(Duration::from_millis(100));
            }
        })
        .expect("failed to spawn control loop thread");
}

/// The keypad driver blocks for the whole entry sequence, so it owns a thread.
fn spawn_actuator(lines: GpioLines, timing: ActuatorConfig) -> SyncSender<u16> {
    let (sender, receiver) = mpsc::sync_channel::<u16>(ACTUATOR_QUEUE_DEPTH);

    thread::Builder::new()
        .name("actuator".into())
        .stack_size(8 * 1024)
        .spawn(move || run_actuator(lines, timing, receiver))
        .expect("failed to spawn actuator thread");

    sender
}

fn run_actuator(lines: GpioLines, timing: ActuatorConfig, receiver: Receiver<u16>) {
    let mut driver = ActuatorDriver::new(lines, MonotonicClock, timing);
    if let Err(err) = driver.release_all() {
        warn!("failed to release button lines: {err}");
    }

    for target in receiver {
        match driver.command(target) {
            Ok(report) => info!(
                "setpoint {} entered with {} presses in {}ms",
                report.target, report.presses, report.duration_ms
            ),
            Err(err) => warn!("actuator command for {target} failed: {err}"),
        }
        let diagnostics = driver.diagnostics();
        info!(
            "actuator: sent={} failed={} last_error={:?}",
            diagnostics.sent_commands, diagnostics.failed_commands, diagnostics.last_error
        );
    }
}

fn handle_mqtt_message(state: &SharedState, topic: &str, payload: &[u8]) {
    let now_ms = monotonic_ms();

    let effects = match topic {
        TOPIC_LINK_PRESENCE if payload == PRESENCE_ONLINE.as_bytes() => {
            info!("control link connected");
            lock(&state.controller).on_connect();
            Vec::new()
        }
        TOPIC_LINK_PRESENCE if payload == PRESENCE_OFFLINE.as_bytes() => {
            info!("control link disconnected");
            let mut controller = lock(&state.controller);
            let effects = controller.on_disconnect();
            queue_setpoints(&state.actuator, effects)
        }
        TOPIC_LINK_PRESENCE => {
            warn!("ignoring unknown presence payload ({} bytes)", payload.len());
            return;
        }
        TOPIC_LINK_REQUEST => {
            let mut controller = lock(&state.controller);
            let result = controller.on_request(payload, now_ms);
            match result {
                Ok(effects) => queue_setpoints(&state.actuator, effects),
                Err(err) => {
                    warn!("dropping request ({} bytes): {err}", payload.len());
                    return;
                }
            }
        }
        _ => return,
    };

    dispatch_effects(state, effects);
}

/// Must run while the controller lock is held, so the actuator queue sees
/// setpoints in the order the controller issued them. Returns the remaining effects.
fn queue_setpoints(actuator: &SyncSender<u16>, effects: Vec<Effect>) -> Vec<Effect> {
    let mut rest = Vec::with_capacity(effects.len());
    for effect in effects {
        match effect {
            Effect::Actuate(target) => match actuator.try_send(target) {
                Ok(()) => {}
                Err(TrySendError::Full(target)) => {
                    warn!("actuator queue full; waiting to enqueue setpoint {target}");
                    if actuator.send(target).is_err() {
                        warn!("actuator thread is gone; setpoint {target} not entered");
                    }
                }
                Err(TrySendError::Disconnected(target)) => {
                    warn!("actuator thread is gone; setpoint {target} not entered");
                }
            },
            other => rest.push(other),
        }
    }
    rest
}

fn dispatch_effects(state: &SharedState, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Actuate(target) => info!("setpoint {target} already queued"),
            Effect::Notify(response) => publish_response(state, &response),
            Effect::RunStateChanged(run_state) => info!("run state -> {}", run_state.as_str()),
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

fn publish_response(state: &SharedState, response: &Response) {
    let body = match encode_response(response) {
        Ok(body) => body,
        Err(err) => {
            warn!("dropping {} response: {err}", response.command());
            return;
        }
    };

    let mut client = lock(&state.mqtt);
    if let Err(err) = client.publish(TOPIC_LINK_NOTIFY, QoS::AtLeastOnce, false, &body) {
        warn!("{} publish failed: {err:?}", response.command());
    }
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 4096];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

/// Profile region stored as one NVS blob. Writes stay in RAM until `commit`.
struct NvsMedium {
    nvs: EspNvs<NvsDefault>,
    working: Vec<u8>,
}

impl NvsMedium {
    fn open(partition: EspDefaultNvsPartition, capacity: usize) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        let mut working = vec![0xFF; capacity];
        let mut buffer = vec![0_u8; capacity];

        if let Some(stored) = nvs
            .get_blob(NVS_PROFILE_KEY, &mut buffer)
            .context("failed to read profile blob")?
        {
            let len = stored.len().min(capacity);
            working[..len].copy_from_slice(&stored[..len]);
        }

        Ok(Self { nvs, working })
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

impl PersistentMedium for NvsMedium {
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
        self.nvs
            .set_blob(NVS_PROFILE_KEY, &self.working)
            .map_err(|err| MediumError::Commit(err.to_string()))
    }
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

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

/// Short blink every ten seconds while a run is active, dark otherwise.
fn update_status_led(status_led: &mut Option<StatusLed>, running: bool, now_ms: u64) {
    let desired_on = running && now_ms % LED_PERIOD_MS < LED_ON_MS;

    let Some(led) = status_led.as_mut() else {
        return;
    };

    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = desired_on;
    }
}
