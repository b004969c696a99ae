use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub tick_interval_ms: u64,
    pub interpolation_interval_minutes: u64,
    pub status_interval_ms: u64,
    pub zero_on_interrupt: bool,
    pub interrupt_on_disconnect: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            interpolation_interval_minutes: 1,
            status_interval_ms: 30_000,
            zero_on_interrupt: true,
            interrupt_on_disconnect: false,
        }
    }
}

/// Pulse timing for the thermostat's keypad. These values are a hardware
/// contract with the thermostat model; change them only against real hardware.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActuatorConfig {
    pub press_ms: u64,
    pub settle_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            press_ms: 10,
            settle_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ButtonPinConfig {
    pub set_pin: i32,
    pub decrement_pin: i32,
    pub increment_pin: i32,
    pub shift_pin: i32,
    pub status_led_pin: i32,
}

impl Default for ButtonPinConfig {
    fn default() -> Self {
        Self {
            set_pin: 25,
            decrement_pin: 26,
            increment_pin: 27,
            shift_pin: 14,
            status_led_pin: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub pins: ButtonPinConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RunConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(100, 10_000);
        self.interpolation_interval_minutes = self.interpolation_interval_minutes.clamp(1, 60);
        self.status_interval_ms = self.status_interval_ms.clamp(1_000, 600_000);
    }
}

impl ActuatorConfig {
    pub fn sanitize(&mut self) {
        self.press_ms = self.press_ms.clamp(5, 200);
        self.settle_ms = self.settle_ms.clamp(5, 200);
    }
}

impl ButtonPinConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.set_pin < 0 {
            self.set_pin = defaults.set_pin;
        }
        if self.decrement_pin < 0 {
            self.decrement_pin = defaults.decrement_pin;
        }
        if self.increment_pin < 0 {
            self.increment_pin = defaults.increment_pin;
        }
        if self.shift_pin < 0 {
            self.shift_pin = defaults.shift_pin;
        }
        if self.status_led_pin < 0 {
            self.status_led_pin = defaults.status_led_pin;
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.run.sanitize();
        self.actuator.sanitize();
        self.pins.sanitize();
    }
}
