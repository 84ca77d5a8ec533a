//! Window control: switch the group off while a window is open and restore
//! it afterwards.
//!
//! Two sensors may be configured. The room sensor covers a single window and
//! reacts quickly; the zone sensor covers a whole area and reacts slowly.
//! Closing waits for `close_delay` before restoring.

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use super::state::AttrValue;
use super::state::Attribute;
use super::state::FilterState;
use super::state::Provenance;
use super::state::TargetState;
use super::state::UpdateSource;
use super::types::HvacMode;
use crate::config::WindowConfig;
use crate::engine::EntityState;
use crate::engine::GroupMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub mode: ControlState,
    pub delay: Duration,
}

fn is_open(state: &EntityState) -> bool {
    matches!(state.state.as_str(), "on" | "open")
}

fn age(state: Option<&EntityState>, now: SystemTime) -> Duration {
    state
        .map(|s| now.duration_since(s.last_changed).unwrap_or_default())
        .unwrap_or(Duration::MAX)
}

/// Decide the control state and how long to wait before applying it.
///
/// `None` when no sensor is configured.
pub fn evaluate(
    config: &WindowConfig,
    room: Option<&EntityState>,
    zone: Option<&EntityState>,
    now: SystemTime,
) -> Option<Decision> {
    if config.room_sensor.is_none() && config.zone_sensor.is_none() {
        return None;
    }

    let room_open = config.room_sensor.is_some() && room.is_some_and(is_open);
    let room_age = age(room.filter(|_| config.room_sensor.is_some()), now);

    let zone_open = room_open || (config.zone_sensor.is_some() && zone.is_some_and(is_open));
    let zone_age = match &config.zone_sensor {
        Some(_) => age(zone, now),
        None => Duration::ZERO,
    };

    let timer_room_open = if room_open {
        config.room_open_delay.saturating_sub(room_age)
    } else {
        config.room_open_delay
    };
    let timer_zone_open = if zone_open {
        config.zone_open_delay.saturating_sub(zone_age)
    } else {
        config.zone_open_delay
    };
    let timer_zone_close = if !zone_open {
        config.close_delay.saturating_sub(zone_age)
    } else {
        config.close_delay
    };

    let delay_room_open = room_open.then(|| timer_room_open.min(timer_zone_open));
    let delay_zone_open = (zone_open && !room_open).then_some(timer_zone_open);
    let delay_zone_close = (!zone_open || !room_open).then_some(timer_zone_close);

    let delay = [delay_room_open, delay_zone_open, delay_zone_close]
        .into_iter()
        .flatten()
        .find(|d| !d.is_zero())
        .unwrap_or(Duration::ZERO);

    Some(Decision {
        mode: if zone_open {
            ControlState::Off
        } else {
            ControlState::On
        },
        delay,
    })
}

/// A target change window control wants applied and enforced.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEffect {
    pub target: TargetState,
    pub filter: FilterState,
}

pub struct WindowControl {
    label: String,
    config: WindowConfig,
    control_state: ControlState,
    restore: Option<TargetState>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    tx: mpsc::Sender<GroupMessage>,
}

impl WindowControl {
    pub fn new(label: &str, config: WindowConfig, tx: mpsc::Sender<GroupMessage>) -> Self {
        Self {
            label: label.to_string(),
            config,
            control_state: ControlState::On,
            restore: None,
            generation: 0,
            timer: None,
            tx,
        }
    }

    pub fn is_active(&self) -> bool {
        self.config.is_active()
    }

    pub fn tracks(&self, entity_id: &str) -> bool {
        self.is_active() && self.config.sensors().any(|s| s == entity_id)
    }

    pub fn control_state(&self) -> ControlState {
        self.control_state
    }

    /// Commands that would switch the group on are held back.
    pub fn blocking(&self) -> bool {
        self.control_state == ControlState::Off
    }

    pub fn room_sensor(&self) -> Option<&str> {
        self.config.room_sensor.as_deref()
    }

    pub fn zone_sensor(&self) -> Option<&str> {
        self.config.zone_sensor.as_deref()
    }

    /// A sensor changed: apply now or (re)arm the timer.
    pub fn on_sensor_event(
        &mut self,
        room: Option<&EntityState>,
        zone: Option<&EntityState>,
        now: SystemTime,
        target: &TargetState,
    ) -> Option<WindowEffect> {
        let Some(decision) = evaluate(&self.config, room, zone, now) else {
            self.control_state = ControlState::On;
            return None;
        };

        if decision.delay.is_zero() {
            self.cancel_timer();
            return self.execute(decision.mode, target);
        }

        self.schedule(decision.delay);
        None
    }

    /// A timer fired. Stale timers are ignored.
    pub fn on_timer(
        &mut self,
        generation: u64,
        room: Option<&EntityState>,
        zone: Option<&EntityState>,
        now: SystemTime,
        target: &TargetState,
    ) -> Option<WindowEffect> {
        if generation != self.generation {
            return None;
        }
        self.timer = None;
        let decision = evaluate(&self.config, room, zone, now)?;
        self.execute(decision.mode, target)
    }

    fn schedule(&mut self, delay: Duration) {
        self.cancel_timer();
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        debug!("[{}] Window timer armed for {:?}", self.label, delay);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(GroupMessage::WindowTimer { generation }).await;
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn filter(&self) -> FilterState {
        self.config
            .restore_attributes
            .union(FilterState::from_attributes([Attribute::HvacMode]))
    }

    fn execute(&mut self, mode: ControlState, target: &TargetState) -> Option<WindowEffect> {
        let target_off = target.hvac_mode() == Some(HvacMode::Off);

        match (mode, target_off) {
            (ControlState::On, false) => {
                self.control_state = ControlState::On;
                None
            }
            (ControlState::Off, true) => {
                // Already off: remember that so closing restores off.
                if self.control_state == ControlState::On {
                    self.restore = Some(target.clone());
                }
                self.control_state = ControlState::Off;
                None
            }
            (ControlState::Off, false) => {
                info!("[{}] Window open, switching off", self.label);
                self.restore = Some(target.clone());
                self.control_state = ControlState::Off;
                Some(WindowEffect {
                    target: target.update(
                        [(Attribute::HvacMode, AttrValue::Mode(HvacMode::Off))],
                        Provenance::new(UpdateSource::Window),
                    ),
                    filter: self.filter(),
                })
            }
            (ControlState::On, true) => {
                if self.control_state == ControlState::On {
                    // Switched off by someone else; nothing to restore.
                    return None;
                }
                self.control_state = ControlState::On;

                let restored = match (self.restore.take(), self.config.default_hvac_mode) {
                    (Some(snapshot), _) => {
                        info!("[{}] Window closed, restoring {}", self.label, snapshot);
                        target.update(
                            snapshot.to_filtered_map(&self.filter()),
                            Provenance::new(UpdateSource::Window),
                        )
                    }
                    (None, Some(mode)) => {
                        info!("[{}] Window closed, switching to {}", self.label, mode);
                        target.update(
                            [(Attribute::HvacMode, AttrValue::Mode(mode))],
                            Provenance::new(UpdateSource::Window),
                        )
                    }
                    (None, None) => return None,
                };

                Some(WindowEffect {
                    target: restored,
                    filter: self.filter(),
                })
            }
        }
    }

    /// While blocking, changes go into the restore snapshot; the returned
    /// changes may still be applied to the target.
    pub fn defer(
        &mut self,
        mut changes: BTreeMap<Attribute, AttrValue>,
        provenance: Provenance,
    ) -> BTreeMap<Attribute, AttrValue> {
        if !self.blocking() {
            return changes;
        }

        let snapshot = self.restore.take().unwrap_or_default();
        self.restore = Some(snapshot.update(changes.clone(), provenance));
        if changes.remove(&Attribute::HvacMode).is_some() {
            debug!("[{}] Deferring hvac mode until window closes", self.label);
        }
        changes
    }
}

impl Drop for WindowControl {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
