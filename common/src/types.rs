use serde::Serialize;

/// Number of setpoint slots reserved on the persistent medium.
pub const MAX_POINTS: usize = 15;
pub const BYTES_PER_POINT: usize = 4;
pub const PROFILE_REGION_BYTES: usize = MAX_POINTS * BYTES_PER_POINT;

/// Setpoint times are minutes since run start and must stay below this.
pub const TIME_LIMIT_MINUTES: u16 = 1_000;
/// Highest value the thermostat's three-digit display can take.
pub const MAX_TEMPERATURE: u16 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SetpointPoint {
    #[serde(rename = "time")]
    pub time_minutes: u16,
    pub temperature: u16,
}

impl SetpointPoint {
    pub fn new(time_minutes: u16, temperature: u16) -> Self {
        Self {
            time_minutes,
            temperature,
        }
    }

    pub fn is_valid_time(&self) -> bool {
        self.time_minutes < TIME_LIMIT_MINUTES
    }
}

/// Slot-ordered setpoint table. `None` marks an unset slot everywhere: on the
/// medium, in the executor snapshot and during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    slots: [Option<SetpointPoint>; MAX_POINTS],
}

impl Default for Profile {
    fn default() -> Self {
        Self::empty()
    }
}

impl Profile {
    pub const fn empty() -> Self {
        Self {
            slots: [None; MAX_POINTS],
        }
    }

    /// Places points into slots `0..n`, dropping anything past `MAX_POINTS`.
    pub fn from_points(points: &[SetpointPoint]) -> Self {
        let mut profile = Self::empty();
        for (slot, point) in profile.slots.iter_mut().zip(points) {
            *slot = Some(*point);
        }
        profile
    }

    pub fn slots(&self) -> &[Option<SetpointPoint>; MAX_POINTS] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<SetpointPoint> {
        self.slots.get(index).copied().flatten()
    }

    pub fn set_slot(&mut self, index: usize, point: Option<SetpointPoint>) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = point;
        }
    }

    pub fn valid_points(&self) -> impl Iterator<Item = SetpointPoint> + '_ {
        self.slots.iter().flatten().copied()
    }

    pub fn valid_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.valid_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }
}

/// Output of the executor for the caller to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    /// Drive the thermostat to this setpoint.
    Command(u16),
    /// The last valid segment has been passed.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentStatus {
    pub runtime: u64,
    pub current_temperature: u16,
    pub state: RunState,
}
