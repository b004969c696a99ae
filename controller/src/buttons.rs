use anyhow::Context;
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::sys::EspError;
use log::info;

use ramp_common::{ButtonLine, ButtonLines, ButtonPinConfig, Level};

type OutputDriver = PinDriver<'static, AnyOutputPin, Output>;

/// Keypad outputs. They idle high; a press pulls one low.
pub struct GpioLines {
    set: OutputDriver,
    decrement: OutputDriver,
    increment: OutputDriver,
    shift: OutputDriver,
}

impl GpioLines {
    pub fn new(pins: &ButtonPinConfig) -> anyhow::Result<Self> {
        let lines = Self {
            set: released_output(pins.set_pin, ButtonLine::Set)?,
            decrement: released_output(pins.decrement_pin, ButtonLine::Decrement)?,
            increment: released_output(pins.increment_pin, ButtonLine::Increment)?,
            shift: released_output(pins.shift_pin, ButtonLine::Shift)?,
        };
        info!(
            "button lines on GPIO SET={} DEC={} INC={} SHIFT={}",
            pins.set_pin, pins.decrement_pin, pins.increment_pin, pins.shift_pin
        );
        Ok(lines)
    }

    fn driver(&mut self, line: ButtonLine) -> &mut OutputDriver {
        match line {
            ButtonLine::Set => &mut self.set,
            ButtonLine::Decrement => &mut self.decrement,
            ButtonLine::Increment => &mut self.increment,
            ButtonLine::Shift => &mut self.shift,
        }
    }
}

fn released_output(pin: i32, line: ButtonLine) -> anyhow::Result<OutputDriver> {
    let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
        .with_context(|| format!("failed to configure GPIO{pin} for {line}"))?;
    driver
        .set_high()
        .with_context(|| format!("failed to release {line} on GPIO{pin}"))?;
    Ok(driver)
}

impl ButtonLines for GpioLines {
    type Error = EspError;

    fn drive(&mut self, line: ButtonLine, level: Level) -> Result<(), Self::Error> {
        let driver = self.driver(line);
        match level {
            Level::Low => driver.set_low(),
            Level::High => driver.set_high(),
        }
    }
}
