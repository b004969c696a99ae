use std::{
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use ramp_common::Clock;

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Process-wide monotonic clock; `sleep_until` parks the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_until(&mut self, deadline_ms: u64) {
        let remaining = deadline_ms.saturating_sub(monotonic_ms());
        if remaining > 0 {
            thread::sleep(Duration::from_millis(remaining));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_until_reaches_deadline() {
        let mut clock = MonotonicClock;
        let deadline = clock.now_ms() + 15;

        clock.sleep_until(deadline);

        assert!(clock.now_ms() >= deadline);
    }

    #[test]
    fn past_deadline_returns_immediately() {
        let mut clock = MonotonicClock;
        let before = Instant::now();

        clock.sleep_until(0);

        assert!(before.elapsed() < Duration::from_millis(50));
    }
}
