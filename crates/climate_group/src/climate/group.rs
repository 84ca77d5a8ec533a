//! The climate group actor.
//!
//! Each group runs as one task owning its target state. Host events, user
//! commands and timers arrive on a single channel and are handled one at a
//! time; enforcement runs in background tasks that only ever see a copy of
//! the target.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use serde::Deserialize;
use serde::Serialize;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio::time::Interval;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::aggregate::available_states;
use super::aggregate::AggregateInput;
use super::aggregate::Aggregator;
use super::aggregate::GroupAttributes;
use super::aggregate::OPTIMISTIC_GRACE;
use super::calibration::plan_writes;
use super::calibration::Readings;
use super::calibration::Trigger;
use super::schedule::Schedule;
use super::service_call::CallSettings;
use super::service_call::EnforceOutcome;
use super::service_call::ServiceCallHandler;
use super::state::AttrValue;
use super::state::Attribute;
use super::state::FilterState;
use super::state::Provenance;
use super::state::TargetState;
use super::state::UpdateSource;
use super::sync_mode::SyncModeHandler;
use super::sync_mode::SyncOutcome;
use super::types::Features;
use super::types::HvacMode;
use super::types::SyncMode;
use super::window::ControlState;
use super::window::WindowControl;
use super::window::WindowEffect;
use crate::config::GroupConfig;
use crate::engine::CorrelationId;
use crate::engine::EntityState;
use crate::engine::GroupMessage;
use crate::engine::Host;
use crate::engine::ServiceCall;
use crate::engine::StateChangedEvent;

/// Capacity of each group's inbox.
const GROUP_CHANNEL_SIZE: usize = 256;

/// A command issued to a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum GroupCommand {
    SetHvacMode {
        hvac_mode: HvacMode,
    },
    SetTemperature {
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        target_temp_low: Option<f64>,
        #[serde(default)]
        target_temp_high: Option<f64>,
        #[serde(default)]
        hvac_mode: Option<HvacMode>,
    },
    SetHumidity {
        humidity: f64,
    },
    SetFanMode {
        fan_mode: String,
    },
    SetPresetMode {
        preset_mode: String,
    },
    SetSwingMode {
        swing_mode: String,
    },
    SetSwingHorizontalMode {
        swing_horizontal_mode: String,
    },
    TurnOn,
    TurnOff,
    Toggle,
    SetScheduleEntity {
        entity: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GroupError {
    #[error("hvac mode {0} is not supported by this group")]
    UnsupportedHvacMode(HvacMode),

    #[error("{0} is not supported by this group")]
    Unsupported(&'static str),

    #[error("command has no effect: {0}")]
    Empty(&'static str),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("group has stopped")]
    Stopped,
}

/// Published view of a group, swapped atomically after every change.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub key: String,
    pub entity_id: String,
    pub name: String,
    pub attributes: GroupAttributes,
    pub target: TargetState,
    pub sync_mode: SyncMode,
    pub sync_snapshot_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_control: Option<ControlState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_entity: Option<String>,
}

impl GroupSnapshot {
    /// The group as a climate entity state, for persistence.
    pub fn to_entity_state(&self) -> EntityState {
        self.attributes.to_entity_state(&self.entity_id)
    }
}

/// Cheap, cloneable access to a running group.
#[derive(Clone)]
pub struct GroupHandle {
    key: String,
    entity_id: String,
    tx: mpsc::Sender<GroupMessage>,
    snapshot: Arc<ArcSwap<GroupSnapshot>>,
}

impl GroupHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// The latest published view. Never blocks on the actor.
    pub fn snapshot(&self) -> Arc<GroupSnapshot> {
        self.snapshot.load_full()
    }

    /// Run a command and wait for it to be accepted.
    pub async fn command(&self, command: GroupCommand) -> Result<(), GroupError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(GroupMessage::Command { command, reply })
            .await
            .map_err(|_| GroupError::Stopped)?;
        rx.await.map_err(|_| GroupError::Stopped)?
    }

    pub(crate) async fn forward(&self, event: StateChangedEvent) -> Result<(), GroupError> {
        self.tx
            .send(GroupMessage::StateChanged(event))
            .await
            .map_err(|_| GroupError::Stopped)
    }

    /// Ask the group to recompute from current host state.
    pub(crate) async fn refresh(&self) -> Result<(), GroupError> {
        self.tx
            .send(GroupMessage::Refresh)
            .await
            .map_err(|_| GroupError::Stopped)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(GroupMessage::Shutdown).await;
    }
}

pub struct ClimateGroup {
    config: Arc<GroupConfig>,
    host: Arc<dyn Host>,
    aggregator: Aggregator,
    attributes: GroupAttributes,
    target: TargetState,
    sync: SyncModeHandler,

    /// User, schedule and window changes.
    commands: ServiceCallHandler,
    /// Sync enforcement; cancelled whenever the group's own command echoes.
    enforcement: ServiceCallHandler,
    /// Context of the latest sync enforcement run.
    last_enforcement: Option<CorrelationId>,

    window: WindowControl,
    schedule: Schedule,
    calibration_tasks: JoinSet<()>,
    all_ready_seen: bool,

    tx: mpsc::Sender<GroupMessage>,
    rx: mpsc::Receiver<GroupMessage>,
    published: Arc<ArcSwap<GroupSnapshot>>,
}

impl ClimateGroup {
    pub fn new(config: GroupConfig, host: Arc<dyn Host>, restored: Option<&EntityState>) -> Self {
        let config = Arc::new(config);
        let (tx, rx) = mpsc::channel(GROUP_CHANNEL_SIZE);
        let label = config.entity_id.as_str();
        let settings = CallSettings::from(&config.calls);

        let (target, attributes) = match restored {
            Some(state) => {
                info!("[{}] Restoring {}", label, state.state);
                (
                    TargetState::from_entity_state(state, Provenance::new(UpdateSource::Restore)),
                    GroupAttributes::from_restored(state),
                )
            }
            None => (TargetState::default(), GroupAttributes::default()),
        };

        let mut group = Self {
            aggregator: Aggregator::new(config.clone()),
            attributes,
            target,
            sync: SyncModeHandler::new(label, &config.sync, config.calls.tolerance),
            commands: ServiceCallHandler::new(
                label,
                host.clone(),
                &config.members,
                settings.clone(),
                config.calls.debounce_delay,
            ),
            enforcement: ServiceCallHandler::new(
                label,
                host.clone(),
                &config.members,
                settings,
                config.calls.debounce_delay,
            )
            .with_reporter(tx.clone()),
            last_enforcement: None,
            window: WindowControl::new(label, config.window.clone(), tx.clone()),
            schedule: Schedule::new(label, config.schedule.entity.clone()),
            calibration_tasks: JoinSet::new(),
            all_ready_seen: false,
            published: Arc::new(ArcSwap::from_pointee(GroupSnapshot {
                key: config.key.clone(),
                entity_id: config.entity_id.clone(),
                name: config.name.clone(),
                attributes: GroupAttributes::default(),
                target: TargetState::default(),
                sync_mode: config.sync.mode,
                sync_snapshot_active: false,
                window_control: None,
                schedule_entity: None,
            })),
            tx,
            rx,
            host,
            config,
        };
        group.publish();
        group
    }

    pub fn handle(&self) -> GroupHandle {
        GroupHandle {
            key: self.config.key.clone(),
            entity_id: self.config.entity_id.clone(),
            tx: self.tx.clone(),
            snapshot: self.published.clone(),
        }
    }

    /// Start the actor.
    pub fn spawn(
        config: GroupConfig,
        host: Arc<dyn Host>,
        restored: Option<&EntityState>,
    ) -> (GroupHandle, JoinHandle<()>) {
        let group = Self::new(config, host, restored);
        let handle = group.handle();
        (handle, tokio::spawn(group.run()))
    }

    fn label(&self) -> &str {
        &self.config.entity_id
    }

    pub async fn run(mut self) {
        info!(
            "[{}] Starting group with {} member(s), sync mode {}",
            self.label(),
            self.config.members.len(),
            self.config.sync.mode
        );

        self.update();

        let mut heartbeat = self.config.calibration.heartbeat.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    None | Some(GroupMessage::Shutdown) => break,
                    Some(msg) => self.handle_message(msg),
                },
                _ = tick(&mut heartbeat) => {
                    self.calibrate(Trigger::Heartbeat);
                }
            }
        }

        self.commands.cancel();
        self.enforcement.cancel();
        self.calibration_tasks.abort_all();
        info!("[{}] Stopped", self.label());
    }

    fn handle_message(&mut self, msg: GroupMessage) {
        match msg {
            GroupMessage::StateChanged(event) => self.handle_event(event),
            GroupMessage::Command { command, reply } => {
                let result = self.handle_command(command);
                if let Err(e) = &result {
                    warn!("[{}] Command rejected: {}", self.label(), e);
                }
                self.update();
                let _ = reply.send(result);
            }
            GroupMessage::WindowTimer { generation } => {
                let (room, zone) = self.window_states();
                let effect = self.window.on_timer(
                    generation,
                    room.as_ref(),
                    zone.as_ref(),
                    SystemTime::now(),
                    &self.target,
                );
                self.apply_window(effect);
                self.update();
            }
            GroupMessage::EnforcementDone { context, outcome } => {
                if self.last_enforcement != Some(context) {
                    return;
                }
                let (members, _) = available_states(&*self.host, &self.config.members);
                match outcome {
                    EnforceOutcome::Converged => self.sync.check_consensus(&members, &self.target),
                    EnforceOutcome::GaveUp => {
                        let outcome =
                            self.sync
                                .on_enforcement_failed(&members, &self.target, self.window.blocking());
                        self.apply_sync(outcome);
                    }
                }
                self.update();
            }
            GroupMessage::CapitulationTimer { generation } => {
                let (members, _) = available_states(&*self.host, &self.config.members);
                let outcome =
                    self.sync
                        .on_timeout(generation, &members, &self.target, self.window.blocking());
                self.apply_sync(outcome);
                self.update();
            }
            GroupMessage::Refresh => self.update(),
            GroupMessage::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: StateChangedEvent) {
        if !event.is_significant() {
            return;
        }
        let id = event.entity_id.as_str();

        if self.window.tracks(id) {
            let (room, zone) = self.window_states();
            let effect =
                self.window
                    .on_sensor_event(room.as_ref(), zone.as_ref(), SystemTime::now(), &self.target);
            self.apply_window(effect);
        }

        if self.schedule.tracks(id) {
            if let Some(state) = &event.new_state {
                self.apply_schedule(state);
            }
        }

        let is_member = self.config.members.iter().any(|m| m == id);
        let is_sensor = self
            .config
            .temperature_sensors
            .iter()
            .chain(&self.config.humidity_sensors)
            .any(|s| s == id);
        let is_master = self.config.master_entity.as_deref() == Some(id);

        if !(is_member || is_sensor || is_master) {
            self.update();
            return;
        }

        self.refresh();

        if is_member {
            if let Some(state) = event.new_state.as_ref().filter(|s| s.is_available()) {
                self.sync_member(state, event.context);
                self.calibrate(Trigger::Member(id.to_string()));
            }
        }
        if is_sensor {
            self.calibrate(Trigger::Sensor);
        }

        self.update();
    }

    fn handle_command(&mut self, command: GroupCommand) -> Result<(), GroupError> {
        debug!("[{}] Command {:?}", self.label(), command);

        let changes: BTreeMap<Attribute, AttrValue> = match command {
            GroupCommand::SetHvacMode { hvac_mode } => {
                self.check_mode(hvac_mode)?;
                BTreeMap::from([(Attribute::HvacMode, AttrValue::Mode(hvac_mode))])
            }
            GroupCommand::SetTemperature {
                temperature,
                target_temp_low,
                target_temp_high,
                hvac_mode,
            } => {
                if let Some(mode) = hvac_mode {
                    self.check_mode(mode)?;
                }
                [
                    (Attribute::Temperature, temperature.map(AttrValue::Number)),
                    (Attribute::TargetTempLow, target_temp_low.map(AttrValue::Number)),
                    (Attribute::TargetTempHigh, target_temp_high.map(AttrValue::Number)),
                    (Attribute::HvacMode, hvac_mode.map(AttrValue::Mode)),
                ]
                .into_iter()
                .filter_map(|(attr, value)| value.map(|v| (attr, v)))
                .collect()
            }
            GroupCommand::SetHumidity { humidity } => {
                BTreeMap::from([(Attribute::Humidity, AttrValue::Number(humidity))])
            }
            GroupCommand::SetFanMode { fan_mode } => {
                BTreeMap::from([(Attribute::FanMode, AttrValue::Text(fan_mode))])
            }
            GroupCommand::SetPresetMode { preset_mode } => {
                BTreeMap::from([(Attribute::PresetMode, AttrValue::Text(preset_mode))])
            }
            GroupCommand::SetSwingMode { swing_mode } => {
                BTreeMap::from([(Attribute::SwingMode, AttrValue::Text(swing_mode))])
            }
            GroupCommand::SetSwingHorizontalMode {
                swing_horizontal_mode,
            } => BTreeMap::from([(
                Attribute::SwingHorizontalMode,
                AttrValue::Text(swing_horizontal_mode),
            )]),
            GroupCommand::TurnOn => {
                let mode = self.turn_on_mode()?;
                BTreeMap::from([(Attribute::HvacMode, AttrValue::Mode(mode))])
            }
            GroupCommand::TurnOff => {
                if !self.attributes.hvac_modes.contains(&HvacMode::Off) {
                    return Err(GroupError::Unsupported("turn_off"));
                }
                BTreeMap::from([(Attribute::HvacMode, AttrValue::Mode(HvacMode::Off))])
            }
            GroupCommand::Toggle => {
                let command = match self.attributes.hvac_mode {
                    Some(mode) if mode != HvacMode::Off => GroupCommand::TurnOff,
                    _ => GroupCommand::TurnOn,
                };
                return self.handle_command(command);
            }
            GroupCommand::SetScheduleEntity { entity } => {
                self.schedule.set_entity(entity);
                if let Some(state) = self.schedule.entity().and_then(|e| self.host.get_state(e)) {
                    self.apply_schedule(&state);
                }
                return Ok(());
            }
        };

        if changes.is_empty() {
            return Err(GroupError::Empty("no values given"));
        }

        if changes.contains_key(&Attribute::HvacMode) {
            self.schedule_refresh();
        }
        self.apply_intent(changes, Provenance::new(UpdateSource::User));
        Ok(())
    }

    fn check_mode(&self, mode: HvacMode) -> Result<(), GroupError> {
        if self.attributes.hvac_modes.contains(&mode) {
            Ok(())
        } else {
            Err(GroupError::UnsupportedHvacMode(mode))
        }
    }

    /// Last active mode if still offered, else the first offered active mode.
    fn turn_on_mode(&self) -> Result<HvacMode, GroupError> {
        if !self.attributes.supported_features.contains(Features::TURN_ON) {
            return Err(GroupError::Unsupported("turn_on"));
        }
        let modes = &self.attributes.hvac_modes;
        self.attributes
            .last_active_hvac_mode
            .filter(|m| modes.contains(m))
            .or_else(|| modes.iter().copied().find(|m| *m != HvacMode::Off))
            .ok_or(GroupError::Unsupported("turn_on"))
    }

    /// Write user or schedule intent into the target and enforce it.
    fn apply_intent(&mut self, changes: BTreeMap<Attribute, AttrValue>, provenance: Provenance) {
        let commanded = FilterState::from_attributes(changes.keys().copied());
        let changes = self.window.defer(changes, provenance.clone());
        if changes.is_empty() {
            return;
        }

        let filter = FilterState::from_attributes(changes.keys().copied());
        self.target = self.target.update(changes, provenance);
        debug!("[{}] Target now {}", self.label(), self.target);

        self.enforcement.cancel();
        let context = CorrelationId::new();
        self.sync.record_command(context, commanded);
        self.commands.call_debounced(self.target.clone(), filter, context);
    }

    fn apply_schedule(&mut self, state: &EntityState) {
        let changes = self.schedule.read(state);
        if changes.is_empty() {
            return;
        }
        info!("[{}] Applying schedule {}", self.label(), state.entity_id);
        self.apply_intent(
            changes,
            Provenance::from_entity(UpdateSource::Schedule, &state.entity_id),
        );
    }

    fn apply_window(&mut self, effect: Option<WindowEffect>) {
        let Some(WindowEffect { target, filter }) = effect else {
            return;
        };
        self.target = target;
        self.enforcement.cancel();
        let context = CorrelationId::new();
        self.sync.record_command(context, filter);
        self.commands.call_debounced(self.target.clone(), filter, context);
    }

    fn sync_member(&mut self, state: &EntityState, context: Option<CorrelationId>) {
        let (members, _) = available_states(&*self.host, &self.config.members);
        let outcome = self.sync.handle_change(
            state,
            context,
            &members,
            &self.target,
            self.window.blocking(),
        );
        self.apply_sync(outcome);
        self.sync.check_consensus(&members, &self.target);
    }

    fn apply_sync(&mut self, outcome: SyncOutcome) {
        if outcome.cancel_enforcement {
            self.enforcement.cancel();
        }
        if let Some((changes, provenance)) = outcome.adopt {
            self.target = self.target.update(changes, provenance);
            debug!("[{}] Target now {}", self.label(), self.target);
        }
        if let Some(generation) = outcome.arm_timeout {
            self.arm_capitulation(generation);
        }
        if outcome.enforce {
            let context = CorrelationId::new();
            self.sync.record_enforcement(context);
            self.last_enforcement = Some(context);
            self.enforcement
                .call_debounced(self.target.clone(), self.config.sync.attributes, context);
        }
    }

    /// Give up on snapshot `generation` once the capitulation timeout passes.
    fn arm_capitulation(&self, generation: u64) {
        let tx = self.tx.clone();
        let timeout = self.sync.capitulation_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(GroupMessage::CapitulationTimer { generation }).await;
        });
    }

    fn calibrate(&mut self, trigger: Trigger) {
        let calibration = &self.config.calibration;
        if calibration.targets.is_empty() && calibration.humidity_targets.is_empty() {
            return;
        }

        let readings = Readings {
            temperature: self
                .attributes
                .current_temperature
                .filter(|_| !self.config.temperature_sensors.is_empty()),
            humidity: self
                .attributes
                .current_humidity
                .filter(|_| !self.config.humidity_sensors.is_empty()),
            member_temperature: self.attributes.member_temperature,
        };

        let host = self.host.clone();
        let writes = plan_writes(
            calibration,
            &trigger,
            readings,
            self.config.calls.tolerance,
            |id| host.get_state(id),
        );
        if writes.is_empty() {
            return;
        }

        debug!("[{}] Calibrating {} entity(s) on {:?}", self.label(), writes.len(), trigger);
        while self.calibration_tasks.try_join_next().is_some() {}

        let label = self.config.entity_id.clone();
        let context = CorrelationId::new();
        self.calibration_tasks.spawn(async move {
            for write in writes {
                let call = ServiceCall::number(&write.entity_id, write.value, context);
                if let Err(e) = host.call_service(call).await {
                    warn!("[{}] Calibration write failed: {}", label, e);
                }
            }
        });
    }

    fn window_states(&self) -> (Option<EntityState>, Option<EntityState>) {
        (
            self.window.room_sensor().and_then(|id| self.host.get_state(id)),
            self.window.zone_sensor().and_then(|id| self.host.get_state(id)),
        )
    }

    /// Ask for a refresh once the optimistic mode has expired.
    fn schedule_refresh(&self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(OPTIMISTIC_GRACE).await;
            let _ = tx.send(GroupMessage::Refresh).await;
        });
    }

    /// Recompute, then handle the first pass where every member is ready.
    fn update(&mut self) {
        if self.refresh() {
            self.on_first_ready();
            self.refresh();
        }
    }

    /// Recompute the aggregate and publish. Returns true on the first pass
    /// where every member is available.
    fn refresh(&mut self) -> bool {
        let host = &*self.host;
        let (members, all_ready) = available_states(host, &self.config.members);
        let master = self
            .config
            .master_entity
            .as_deref()
            .and_then(|id| host.get_state(id))
            .filter(EntityState::is_available);
        let (temperature_sensors, _) = available_states(host, &self.config.temperature_sensors);
        let (humidity_sensors, _) = available_states(host, &self.config.humidity_sensors);

        let next = self.aggregator.recompute(
            &self.attributes,
            &AggregateInput {
                members: &members,
                master: master.as_ref(),
                temperature_sensors: &temperature_sensors,
                humidity_sensors: &humidity_sensors,
                target: &self.target,
                blocking: self.window.blocking(),
                now: SystemTime::now(),
            },
        );

        if next.available != self.attributes.available {
            if next.available {
                info!("[{}] Available", self.label());
            } else {
                warn!("[{}] No member available", self.label());
            }
        }
        self.attributes = next;
        self.publish();

        let first = all_ready && !self.all_ready_seen;
        self.all_ready_seen |= all_ready;
        first
    }

    fn on_first_ready(&mut self) {
        info!("[{}] All members available", self.label());

        if self.target.is_empty() {
            let seeded: Vec<(Attribute, AttrValue)> = Attribute::iter()
                .filter_map(|attr| self.attributes.get(attr).map(|v| (attr, v)))
                .collect();
            self.target = TargetState::default().update(seeded, Provenance::new(UpdateSource::Restore));
            info!("[{}] Seeded target {}", self.label(), self.target);
        }

        self.calibrate(Trigger::Initial);

        if let Some(state) = self.schedule.entity().and_then(|e| self.host.get_state(e)) {
            self.apply_schedule(&state);
        }

        if self.window.is_active() {
            let (room, zone) = self.window_states();
            let effect =
                self.window
                    .on_sensor_event(room.as_ref(), zone.as_ref(), SystemTime::now(), &self.target);
            self.apply_window(effect);
        }
    }

    fn publish(&self) {
        self.published.store(Arc::new(GroupSnapshot {
            key: self.config.key.clone(),
            entity_id: self.config.entity_id.clone(),
            name: self.config.name.clone(),
            attributes: self.attributes.clone(),
            target: self.target.clone(),
            sync_mode: self.sync.mode(),
            sync_snapshot_active: self.sync.has_snapshot(),
            window_control: self.window.is_active().then(|| self.window.control_state()),
            schedule_entity: self.schedule.entity().map(String::from),
        }));
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
