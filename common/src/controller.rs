use crate::{
    config::RunConfig,
    executor::ScheduleExecutor,
    protocol::{decode_request, ProtocolError, Request, Response, RunStatus},
    store::{PersistentMedium, ProfileStore},
    types::{CurrentStatus, RunAction, RunState},
};

/// Work for the transport and actuator tasks, in the order it must happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Queue a setpoint for the actuator task.
    Actuate(u16),
    /// Send a message to the connected peer.
    Notify(Response),
    RunStateChanged(RunState),
    ProfileSaved { stored: usize, dropped: usize },
    PersistenceFailed(String),
}

/// All mutable run state: the stored profile, the executor and the link flag.
/// Callers share it behind a single lock.
#[derive(Debug)]
pub struct ProfileController<M> {
    store: ProfileStore<M>,
    executor: ScheduleExecutor,
    config: RunConfig,
    connected: bool,
}

impl<M: PersistentMedium> ProfileController<M> {
    pub fn new(store: ProfileStore<M>, config: RunConfig) -> Self {
        Self {
            store,
            executor: ScheduleExecutor::new(config.interpolation_interval_minutes),
            config,
            connected: false,
        }
    }

    pub fn store(&self) -> &ProfileStore<M> {
        &self.store
    }

    pub fn run_state(&self) -> RunState {
        self.executor.state()
    }

    pub fn is_running(&self) -> bool {
        self.executor.is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn commanded_temperature(&self) -> Option<u16> {
        self.executor.commanded_temperature()
    }

    pub fn on_connect(&mut self) {
        self.connected = true;
    }

    /// A run keeps going after link loss unless configured otherwise.
    pub fn on_disconnect(&mut self) -> Vec<Effect> {
        self.connected = false;
        if self.config.interrupt_on_disconnect && self.executor.is_running() {
            return self.stop_run();
        }
        Vec::new()
    }

    /// Decodes and handles one inbound message. A malformed or oversized
    /// message yields an error and must not be answered.
    pub fn on_request(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<Vec<Effect>, ProtocolError> {
        let request = decode_request(bytes)?;
        Ok(self.handle(request, now_ms))
    }

    pub fn handle(&mut self, request: Request, now_ms: u64) -> Vec<Effect> {
        match request {
            Request::GetTemperaturePoints => {
                let data = self.store.load().valid_points().collect();
                vec![Effect::Notify(Response::TemperaturePoints { data })]
            }
            Request::SetTemperaturePoints(points) => match self.store.save(&points) {
                Ok(report) => vec![
                    Effect::ProfileSaved {
                        stored: report.stored,
                        dropped: report.dropped,
                    },
                    Effect::Notify(Response::points_saved()),
                ],
                Err(err) => {
                    let reason = err.to_string();
                    vec![
                        Effect::PersistenceFailed(reason.clone()),
                        Effect::Notify(Response::points_not_saved(&reason)),
                    ]
                }
            },
            Request::StartRun => {
                if self.executor.is_running() {
                    return vec![Effect::Notify(Response::run_status(RunStatus::Running))];
                }
                let profile = self.store.load();
                self.executor.start(profile, now_ms);
                vec![
                    Effect::RunStateChanged(RunState::Running),
                    Effect::Notify(Response::run_status(RunStatus::Started)),
                ]
            }
            Request::Interrupt => {
                if !self.executor.is_running() {
                    self.executor.interrupt();
                    return vec![Effect::Notify(Response::run_status(RunStatus::Idle))];
                }
                let mut effects = self.stop_run();
                effects.push(Effect::Notify(Response::run_status(RunStatus::Interrupted)));
                effects
            }
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        for action in self.executor.tick(now_ms) {
            match action {
                RunAction::Command(target) => effects.push(Effect::Actuate(target)),
                RunAction::Completed => {
                    effects.push(Effect::RunStateChanged(RunState::Completed));
                    if self.connected {
                        effects.push(Effect::Notify(Response::run_status(RunStatus::Completed)));
                    }
                }
            }
        }
        effects
    }

    pub fn current_status(&self, now_ms: u64) -> CurrentStatus {
        self.executor.status(now_ms)
    }

    /// Periodic push; nothing is produced while no peer is connected.
    pub fn status_push(&self, now_ms: u64) -> Option<Response> {
        self.connected.then(|| Response::CurrentStatus {
            data: self.current_status(now_ms),
        })
    }

    fn stop_run(&mut self) -> Vec<Effect> {
        self.executor.interrupt();
        let mut effects = vec![Effect::RunStateChanged(RunState::Idle)];
        if self.config.zero_on_interrupt {
            self.executor.note_commanded(0);
            effects.push(Effect::Actuate(0));
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        protocol::VerifyStatus,
        store::MemoryMedium,
        types::{SetpointPoint, PROFILE_REGION_BYTES},
    };

    const MINUTE: u64 = 60_000;

    fn controller_with(config: RunConfig) -> ProfileController<MemoryMedium> {
        let mut store = ProfileStore::new(MemoryMedium::erased(PROFILE_REGION_BYTES));
        store.ensure_initialized().unwrap();
        let mut controller = ProfileController::new(store, config);
        controller.on_connect();
        controller
    }

    fn controller() -> ProfileController<MemoryMedium> {
        controller_with(RunConfig::default())
    }

    fn request(
        controller: &mut ProfileController<MemoryMedium>,
        json: &str,
        now_ms: u64,
    ) -> Vec<Effect> {
        controller.on_request(json.as_bytes(), now_ms).unwrap()
    }

    fn notifications(effects: &[Effect]) -> Vec<&Response> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Notify(response) => Some(response),
                _ => None,
            })
            .collect()
    }

    fn actuations(effects: &[Effect]) -> Vec<u16> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Actuate(target) => Some(*target),
                _ => None,
            })
            .collect()
    }

    fn tick_through(
        controller: &mut ProfileController<MemoryMedium>,
        from_ms: u64,
        to_ms: u64,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut now = from_ms;
        while now <= to_ms {
            effects.extend(controller.tick(now));
            now += 1_000;
        }
        effects
    }

    const UPLOAD: &str = r#"{"command":"set_temperature_points","data":[{"time":0,"temperature":20},{"time":30,"temperature":25},{"time":60,"temperature":20}]}"#;

    #[test]
    fn upload_start_and_follow_profile_to_45_minutes() {
        let mut controller = controller();

        let effects = request(&mut controller, UPLOAD, 0);
        assert_eq!(notifications(&effects), vec![&Response::points_saved()]);

        let effects = request(&mut controller, r#"{"command":"start_run"}"#, 0);
        assert_eq!(
            effects,
            vec![
                Effect::RunStateChanged(RunState::Running),
                Effect::Notify(Response::run_status(RunStatus::Started)),
            ]
        );

        let effects = tick_through(&mut controller, 0, 45 * MINUTE);

        assert_eq!(actuations(&effects).first(), Some(&20));
        assert_eq!(actuations(&effects).last(), Some(&23));
        assert_eq!(controller.commanded_temperature(), Some(23));
        assert_eq!(
            controller.status_push(45 * MINUTE),
            Some(Response::CurrentStatus {
                data: CurrentStatus {
                    runtime: 45,
                    current_temperature: 23,
                    state: RunState::Running,
                }
            })
        );
    }

    #[test]
    fn get_returns_only_valid_points() {
        let mut controller = controller();
        request(&mut controller, UPLOAD, 0);

        let effects = request(&mut controller, r#"{"command":"get_temperature_points"}"#, 0);

        assert_eq!(
            effects,
            vec![Effect::Notify(Response::TemperaturePoints {
                data: vec![
                    SetpointPoint::new(0, 20),
                    SetpointPoint::new(30, 25),
                    SetpointPoint::new(60, 20),
                ]
            })]
        );
    }

    #[test]
    fn fresh_device_reports_empty_profile() {
        let mut controller = controller();

        let effects = request(&mut controller, r#"{"command":"get_temperature_points"}"#, 0);

        assert_eq!(
            effects,
            vec![Effect::Notify(Response::TemperaturePoints { data: Vec::new() })]
        );
    }

    #[test]
    fn surplus_points_are_dropped_and_reported() {
        let mut controller = controller();
        let points: Vec<String> = (0..17)
            .map(|i| format!(r#"{{"time":{i},"temperature":{}}}"#, 20 + i))
            .collect();
        let json = format!(
            r#"{{"command":"set_temperature_points","data":[{}]}}"#,
            points.join(",")
        );

        let effects = request(&mut controller, &json, 0);

        assert_eq!(effects[0], Effect::ProfileSaved { stored: 15, dropped: 2 });
        assert_eq!(controller.store().load().valid_count(), 15);
    }

    #[test]
    fn persistence_failure_is_reported_to_peer() {
        let mut controller = controller();
        controller.store.medium_mut().fail_commit_after(1);

        let effects = request(&mut controller, UPLOAD, 0);

        assert!(matches!(effects[0], Effect::PersistenceFailed(_)));
        match notifications(&effects).as_slice() {
            [Response::VerifyTemperaturePoints { status, message }] => {
                assert_eq!(*status, VerifyStatus::Error);
                assert!(message.contains("write"));
            }
            other => panic!("unexpected notifications {other:?}"),
        }
        assert!(controller.store().load().is_empty());
    }

    #[test]
    fn malformed_request_is_an_error_without_effects() {
        let mut controller = controller();

        assert!(controller.on_request(b"{\"command\":", 0).is_err());
        assert!(controller
            .on_request(br#"{"command":"start_run","extra":1}"#, 0)
            .is_err());
        assert_eq!(controller.run_state(), RunState::Idle);
    }

    #[test]
    fn start_while_running_does_not_restart() {
        let mut controller = controller();
        request(&mut controller, UPLOAD, 0);
        request(&mut controller, r#"{"command":"start_run"}"#, 0);
        tick_through(&mut controller, 0, 10 * MINUTE);

        let effects = request(&mut controller, r#"{"command":"start_run"}"#, 10 * MINUTE);

        assert_eq!(
            effects,
            vec![Effect::Notify(Response::run_status(RunStatus::Running))]
        );
        assert_eq!(controller.current_status(10 * MINUTE).runtime, 10);
    }

    #[test]
    fn interrupt_stops_run_and_zeroes_actuator() {
        let mut controller = controller();
        request(&mut controller, UPLOAD, 0);
        request(&mut controller, r#"{"command":"start_run"}"#, 0);
        tick_through(&mut controller, 0, 5 * MINUTE);

        let effects = request(&mut controller, r#"{"command":"interrupt"}"#, 5 * MINUTE);

        assert_eq!(
            effects,
            vec![
                Effect::RunStateChanged(RunState::Idle),
                Effect::Actuate(0),
                Effect::Notify(Response::run_status(RunStatus::Interrupted)),
            ]
        );
        assert_eq!(controller.commanded_temperature(), Some(0));
        assert!(tick_through(&mut controller, 5 * MINUTE, 6 * MINUTE).is_empty());
    }

    #[test]
    fn interrupt_can_leave_actuator_alone() {
        let mut controller = controller_with(RunConfig {
            zero_on_interrupt: false,
            ..RunConfig::default()
        });
        request(&mut controller, UPLOAD, 0);
        request(&mut controller, r#"{"command":"start_run"}"#, 0);
        controller.tick(0);

        let effects = request(&mut controller, r#"{"command":"interrupt"}"#, 1_000);

        assert!(actuations(&effects).is_empty());
        assert_eq!(controller.commanded_temperature(), Some(20));
    }

    #[test]
    fn interrupt_while_idle_reports_idle() {
        let mut controller = controller();

        let effects = request(&mut controller, r#"{"command":"interrupt"}"#, 0);

        assert_eq!(
            effects,
            vec![Effect::Notify(Response::run_status(RunStatus::Idle))]
        );
    }

    #[test]
    fn empty_profile_completes_without_actuation() {
        let mut controller = controller();
        request(&mut controller, r#"{"command":"start_run"}"#, 0);

        let effects = controller.tick(0);

        assert_eq!(
            effects,
            vec![
                Effect::RunStateChanged(RunState::Completed),
                Effect::Notify(Response::run_status(RunStatus::Completed)),
            ]
        );
    }

    #[test]
    fn run_survives_disconnect_by_default() {
        let mut controller = controller();
        request(&mut controller, UPLOAD, 0);
        request(&mut controller, r#"{"command":"start_run"}"#, 0);
        controller.tick(0);

        assert!(controller.on_disconnect().is_empty());
        assert!(controller.is_running());
        assert_eq!(controller.status_push(MINUTE), None);

        let effects = tick_through(&mut controller, 1_000, 60 * MINUTE + 1_000);
        assert_eq!(actuations(&effects).last(), Some(&20));
        assert!(notifications(&effects).is_empty());
        assert_eq!(controller.run_state(), RunState::Completed);
    }

    #[test]
    fn disconnect_can_interrupt_run() {
        let mut controller = controller_with(RunConfig {
            interrupt_on_disconnect: true,
            ..RunConfig::default()
        });
        request(&mut controller, UPLOAD, 0);
        request(&mut controller, r#"{"command":"start_run"}"#, 0);

        let effects = controller.on_disconnect();

        assert_eq!(
            effects,
            vec![Effect::RunStateChanged(RunState::Idle), Effect::Actuate(0)]
        );
        assert!(!controller.is_connected());
    }

    #[test]
    fn run_uses_snapshot_taken_at_start() {
        let mut controller = controller();
        request(&mut controller, UPLOAD, 0);
        request(&mut controller, r#"{"command":"start_run"}"#, 0);

        request(
            &mut controller,
            r#"{"command":"set_temperature_points","data":[{"time":0,"temperature":90}]}"#,
            0,
        );
        let effects = controller.tick(0);

        assert_eq!(actuations(&effects), vec![20]);
    }
}
