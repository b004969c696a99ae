use crate::types::{CurrentStatus, Profile, RunAction, RunState, SetpointPoint, MAX_POINTS};

const MS_PER_MINUTE: u64 = 60_000;

/// Linear target between two setpoints, rounded half up. `None` for a
/// zero-length segment, where the previous target is held instead.
pub fn interpolate(prev: SetpointPoint, cur: SetpointPoint, elapsed_minutes: u64) -> Option<u16> {
    let span = i64::from(cur.time_minutes) - i64::from(prev.time_minutes);
    if span <= 0 {
        return None;
    }

    let progressed = (elapsed_minutes as i64 - i64::from(prev.time_minutes)).clamp(0, span);
    let delta = i64::from(cur.temperature) - i64::from(prev.temperature);

    // prev + floor(progressed * delta / span + 1/2), kept in integers.
    let offset = (2 * progressed * delta + span).div_euclid(2 * span);
    let target = i64::from(prev.temperature) + offset;
    u16::try_from(target).ok()
}

#[derive(Debug, Clone)]
pub struct ScheduleExecutor {
    interpolation_interval_minutes: u64,
    state: RunState,
    snapshot: Profile,
    start_ms: u64,
    segment_index: usize,
    interpolation_baseline_minutes: u64,
    commanded_temperature: Option<u16>,
}

impl ScheduleExecutor {
    pub fn new(interpolation_interval_minutes: u64) -> Self {
        Self {
            interpolation_interval_minutes: interpolation_interval_minutes.max(1),
            state: RunState::Idle,
            snapshot: Profile::empty(),
            start_ms: 0,
            segment_index: 0,
            interpolation_baseline_minutes: 0,
            commanded_temperature: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn segment_index(&self) -> usize {
        self.segment_index
    }

    pub fn commanded_temperature(&self) -> Option<u16> {
        self.commanded_temperature
    }

    /// Takes a private copy of `profile` and begins a run at `now_ms`.
    pub fn start(&mut self, profile: Profile, now_ms: u64) {
        self.snapshot = profile;
        self.start_ms = now_ms;
        self.segment_index = 0;
        self.interpolation_baseline_minutes = 0;
        self.state = RunState::Running;
    }

    /// Whole minutes since the current run started; 0 when idle.
    pub fn elapsed_minutes(&self, now_ms: u64) -> u64 {
        match self.state {
            RunState::Idle => 0,
            RunState::Running | RunState::Completed => {
                now_ms.saturating_sub(self.start_ms) / MS_PER_MINUTE
            }
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<RunAction> {
        if self.state != RunState::Running {
            return Vec::new();
        }

        let elapsed = self.elapsed_minutes(now_ms);

        let Some((index, segment)) = self.next_valid(self.segment_index) else {
            self.state = RunState::Completed;
            return vec![RunAction::Completed];
        };
        self.segment_index = index;

        // Stepwise transition wins ties with interpolation.
        if elapsed >= u64::from(segment.time_minutes) {
            self.segment_index = index + 1;
            self.interpolation_baseline_minutes = elapsed;
            return vec![self.command(segment.temperature)];
        }

        let Some(prev) = self.prev_valid(index) else {
            return Vec::new();
        };

        if elapsed.saturating_sub(self.interpolation_baseline_minutes)
            < self.interpolation_interval_minutes
        {
            return Vec::new();
        }

        match interpolate(prev, segment, elapsed) {
            Some(target) => {
                self.interpolation_baseline_minutes = elapsed;
                vec![self.command(target)]
            }
            None => Vec::new(),
        }
    }

    /// Returns to idle from any state. Returns whether a run was actually stopped.
    pub fn interrupt(&mut self) -> bool {
        let was_running = self.is_running();
        self.state = RunState::Idle;
        was_running
    }

    /// Records a command issued outside the schedule, e.g. the zero after an interrupt.
    pub fn note_commanded(&mut self, temperature: u16) {
        self.commanded_temperature = Some(temperature);
    }

    pub fn status(&self, now_ms: u64) -> CurrentStatus {
        CurrentStatus {
            runtime: self.elapsed_minutes(now_ms),
            current_temperature: self.commanded_temperature.unwrap_or(0),
            state: self.state,
        }
    }

    fn command(&mut self, temperature: u16) -> RunAction {
        self.commanded_temperature = Some(temperature);
        RunAction::Command(temperature)
    }

    fn next_valid(&self, from: usize) -> Option<(usize, SetpointPoint)> {
        (from..MAX_POINTS).find_map(|index| self.snapshot.slot(index).map(|point| (index, point)))
    }

    fn prev_valid(&self, before: usize) -> Option<SetpointPoint> {
        (0..before)
            .rev()
            .find_map(|index| self.snapshot.slot(index))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn profile(raw: &[(u16, u16)]) -> Profile {
        let points: Vec<SetpointPoint> = raw
            .iter()
            .map(|(time, temp)| SetpointPoint::new(*time, *temp))
            .collect();
        Profile::from_points(&points)
    }

    fn minutes(m: u64) -> u64 {
        m * MS_PER_MINUTE
    }

    /// Ticks once a second from `from_ms` up to and including `to_ms`.
    fn run_until(executor: &mut ScheduleExecutor, from_ms: u64, to_ms: u64) -> Vec<RunAction> {
        let mut actions = Vec::new();
        let mut now = from_ms;
        while now <= to_ms {
            actions.extend(executor.tick(now));
            now += 1_000;
        }
        actions
    }

    #[test]
    fn interpolates_midway_between_setpoints() {
        let prev = SetpointPoint::new(0, 20);
        let cur = SetpointPoint::new(10, 40);

        assert_eq!(interpolate(prev, cur, 5), Some(30));
    }

    #[test]
    fn interpolation_rounds_half_up_on_falling_segment() {
        let prev = SetpointPoint::new(30, 25);
        let cur = SetpointPoint::new(60, 20);

        assert_eq!(interpolate(prev, cur, 45), Some(23));
    }

    #[test]
    fn zero_length_segment_is_not_interpolated() {
        let point = SetpointPoint::new(10, 40);

        assert_eq!(interpolate(SetpointPoint::new(10, 20), point, 10), None);
    }

    #[test]
    fn idle_executor_ignores_ticks() {
        let mut executor = ScheduleExecutor::new(1);

        assert!(executor.tick(minutes(5)).is_empty());
        assert_eq!(executor.state(), RunState::Idle);
    }

    #[test]
    fn empty_profile_completes_on_first_tick_without_command() {
        let mut executor = ScheduleExecutor::new(1);
        executor.start(Profile::empty(), 1_000);

        let actions = executor.tick(1_000);

        assert_eq!(actions, vec![RunAction::Completed]);
        assert_eq!(executor.state(), RunState::Completed);
        assert_eq!(executor.commanded_temperature(), None);
        assert!(executor.tick(minutes(10)).is_empty());
    }

    #[test]
    fn first_setpoint_fires_at_start() {
        let mut executor = ScheduleExecutor::new(1);
        executor.start(profile(&[(0, 20), (10, 40)]), 500);

        assert_eq!(executor.tick(500), vec![RunAction::Command(20)]);
        assert_eq!(executor.segment_index(), 1);
    }

    #[test]
    fn step_wins_tie_at_segment_boundary() {
        let mut executor = ScheduleExecutor::new(1);
        executor.start(profile(&[(0, 20), (10, 40)]), 0);

        let mut actions = run_until(&mut executor, 0, minutes(5));
        assert_eq!(actions.last(), Some(&RunAction::Command(30)));

        actions = run_until(&mut executor, minutes(5) + 1_000, minutes(10));
        assert_eq!(actions.last(), Some(&RunAction::Command(40)));
        assert_eq!(executor.commanded_temperature(), Some(40));
        assert_eq!(executor.segment_index(), 2);
    }

    #[test]
    fn interpolation_commands_at_most_once_per_interval() {
        let mut executor = ScheduleExecutor::new(1);
        executor.start(profile(&[(0, 20), (10, 40)]), 0);

        let actions = run_until(&mut executor, 0, minutes(4) + 59_000);

        assert_eq!(
            actions,
            vec![
                RunAction::Command(20),
                RunAction::Command(22),
                RunAction::Command(24),
                RunAction::Command(26),
                RunAction::Command(28),
            ]
        );
    }

    #[test]
    fn longer_interval_spaces_out_interpolation() {
        let mut executor = ScheduleExecutor::new(5);
        executor.start(profile(&[(0, 0), (100, 100)]), 0);

        let actions = run_until(&mut executor, 0, minutes(12));

        assert_eq!(
            actions,
            vec![
                RunAction::Command(0),
                RunAction::Command(5),
                RunAction::Command(10),
            ]
        );
    }

    #[test]
    fn completes_after_last_segment() {
        let mut executor = ScheduleExecutor::new(1);
        executor.start(profile(&[(0, 20), (1, 25)]), 0);

        let actions = run_until(&mut executor, 0, minutes(1) + 1_000);

        assert_eq!(
            actions,
            vec![
                RunAction::Command(20),
                RunAction::Command(25),
                RunAction::Completed,
            ]
        );
        assert_eq!(executor.state(), RunState::Completed);
    }

    #[test]
    fn unset_slots_are_skipped() {
        let mut sparse = Profile::empty();
        sparse.set_slot(0, Some(SetpointPoint::new(0, 100)));
        sparse.set_slot(3, Some(SetpointPoint::new(10, 200)));

        let mut executor = ScheduleExecutor::new(1);
        executor.start(sparse, 0);

        let actions = run_until(&mut executor, 0, minutes(5));

        assert_eq!(actions.first(), Some(&RunAction::Command(100)));
        assert_eq!(actions.last(), Some(&RunAction::Command(150)));
        assert_eq!(executor.segment_index(), 3);
    }

    #[test]
    fn coincident_setpoints_step_on_successive_ticks() {
        let mut executor = ScheduleExecutor::new(1);
        executor.start(profile(&[(0, 20), (0, 30), (10, 30)]), 0);

        assert_eq!(executor.tick(0), vec![RunAction::Command(20)]);
        assert_eq!(executor.tick(0), vec![RunAction::Command(30)]);
        assert_eq!(executor.segment_index(), 2);
    }

    #[test]
    fn interrupt_returns_to_idle_and_is_restartable() {
        let mut executor = ScheduleExecutor::new(1);
        executor.start(profile(&[(0, 20), (10, 40)]), 0);
        executor.tick(0);

        assert!(executor.interrupt());
        assert_eq!(executor.state(), RunState::Idle);
        assert!(executor.tick(minutes(3)).is_empty());
        assert!(!executor.interrupt());

        executor.start(profile(&[(0, 50)]), minutes(4));
        assert_eq!(executor.tick(minutes(4)), vec![RunAction::Command(50)]);
    }

    #[test]
    fn uploaded_profile_reaches_interpolated_target_at_45_minutes() {
        let mut executor = ScheduleExecutor::new(1);
        executor.start(profile(&[(0, 20), (30, 25), (60, 20)]), 0);

        run_until(&mut executor, 0, minutes(45));

        assert_eq!(executor.commanded_temperature(), Some(23));
        assert_eq!(executor.status(minutes(45)).runtime, 45);
    }
}
