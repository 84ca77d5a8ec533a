//! Member deviation handling: echo detection, Lock/Mirror policy and
//! capitulation.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::state::AttrValue;
use super::state::Attribute;
use super::state::ChangeState;
use super::state::FilterState;
use super::state::Provenance;
use super::state::TargetState;
use super::state::UpdateSource;
use super::types::HvacMode;
use super::types::SyncMode;
use crate::config::SyncConfig;
use crate::engine::CorrelationId;
use crate::engine::EntityState;

/// Number of issued contexts remembered for echo detection.
pub const CONTEXT_HISTORY: usize = 10;

/// Where a member change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Caused by the group's latest command.
    Internal,
    /// Caused by an earlier call the group issued.
    Echo,
    External,
}

/// One member's deviation being fought, kept until the member is back in
/// line or the group capitulates to it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub entity_id: String,
    /// The deviating values reported by the member.
    pub changes: BTreeMap<Attribute, AttrValue>,
    /// Target values of the same attributes when the deviation appeared.
    pub group_values: BTreeMap<Attribute, AttrValue>,
    /// Every available member as it was when the deviation appeared.
    pub members: Vec<EntityState>,
    pub created: Instant,
    /// Enforcement passes started against this deviation.
    pub attempts: u32,
    pub generation: u64,
}

impl Snapshot {
    /// Whether `change` continues this conflict: same member, same
    /// attributes. Values may differ.
    fn continues(&self, change: &ChangeState) -> bool {
        self.entity_id == change.entity_id() && self.changes.keys().eq(change.changes().keys())
    }
}

/// What the group should do about a member change.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub cancel_enforcement: bool,
    pub adopt: Option<(BTreeMap<Attribute, AttrValue>, Provenance)>,
    pub enforce: bool,
    /// Generation of a newly opened snapshot whose capitulation timer should
    /// be started.
    pub arm_timeout: Option<u64>,
}

impl SyncOutcome {
    fn capitulated(changes: BTreeMap<Attribute, AttrValue>, entity_id: &str) -> Self {
        Self {
            cancel_enforcement: true,
            adopt: Some((
                changes,
                Provenance::from_entity(UpdateSource::Capitulation, entity_id),
            )),
            ..Self::default()
        }
    }
}

pub struct SyncModeHandler {
    label: String,
    mode: SyncMode,
    attributes: FilterState,
    max_attempts: u32,
    capitulation_timeout: Duration,
    tolerance: f64,

    last_group_context: Option<CorrelationId>,
    /// Attributes explicitly set by the latest command.
    last_commanded: FilterState,
    history: VecDeque<CorrelationId>,
    snapshots: BTreeMap<String, Snapshot>,
    next_generation: u64,
}

impl SyncModeHandler {
    pub fn new(label: &str, config: &SyncConfig, tolerance: f64) -> Self {
        Self {
            label: label.to_string(),
            mode: config.mode,
            attributes: config.attributes,
            max_attempts: config.max_attempts,
            capitulation_timeout: config.capitulation_timeout,
            tolerance,
            last_group_context: None,
            last_commanded: FilterState::none(),
            history: VecDeque::with_capacity(CONTEXT_HISTORY),
            snapshots: BTreeMap::new(),
            next_generation: 0,
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn capitulation_timeout(&self) -> Duration {
        self.capitulation_timeout
    }

    /// The open snapshot of `entity_id`, if its deviation is being fought.
    pub fn snapshot(&self, entity_id: &str) -> Option<&Snapshot> {
        self.snapshots.get(entity_id)
    }

    pub fn has_snapshot(&self) -> bool {
        !self.snapshots.is_empty()
    }

    /// Remember a command the group issued on its own behalf.
    pub fn record_command(&mut self, context: CorrelationId, commanded: FilterState) {
        self.last_group_context = Some(context);
        self.last_commanded = commanded;
        self.remember(context);
    }

    /// Remember a context used for enforcement.
    pub fn record_enforcement(&mut self, context: CorrelationId) {
        self.remember(context);
    }

    fn remember(&mut self, context: CorrelationId) {
        if self.history.len() == CONTEXT_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(context);
    }

    pub fn classify(&self, context: Option<CorrelationId>) -> Origin {
        match context {
            Some(c) if Some(c) == self.last_group_context => Origin::Internal,
            Some(c) if self.history.contains(&c) => Origin::Echo,
            _ => Origin::External,
        }
    }

    /// Restrict a member change to what may enter the target.
    fn syncable(&self, change: ChangeState, target: &TargetState, blocking: bool) -> ChangeState {
        let off = target.hvac_mode() == Some(HvacMode::Off);
        change.retain(|attr, _| {
            self.attributes.allows(attr)
                && !(off && attr.is_setpoint())
                && !(blocking && attr == Attribute::HvacMode)
        })
    }

    fn open_snapshot(
        &mut self,
        change: &ChangeState,
        members: &[EntityState],
        target: &TargetState,
    ) -> Snapshot {
        let generation = self.next_generation;
        self.next_generation += 1;
        debug!("[{}] Snapshot created for {}", self.label, change);

        Snapshot {
            entity_id: change.entity_id().to_string(),
            changes: change.changes().clone(),
            group_values: change
                .changes()
                .keys()
                .filter_map(|attr| target.get(*attr).map(|v| (*attr, v)))
                .collect(),
            members: members.to_vec(),
            created: Instant::now(),
            attempts: 0,
            generation,
        }
    }

    /// Accept whatever is left of the snapshot's deviation in the member's
    /// current state.
    fn settle(
        &self,
        snapshot: &Snapshot,
        members: &[EntityState],
        target: &TargetState,
        blocking: bool,
    ) -> SyncOutcome {
        let Some(member) = members.iter().find(|m| m.entity_id == snapshot.entity_id) else {
            debug!(
                "[{}] Dropping snapshot of unavailable {}",
                self.label, snapshot.entity_id
            );
            return SyncOutcome::default();
        };

        let change = self
            .syncable(ChangeState::from_member(member, target, self.tolerance), target, blocking)
            .retain(|attr, _| snapshot.changes.contains_key(&attr));
        if change.is_empty() {
            return SyncOutcome::default();
        }

        warn!(
            "[{}] Capitulating to {} after {} attempt(s) in {:?}",
            self.label,
            change,
            snapshot.attempts,
            snapshot.created.elapsed()
        );
        SyncOutcome::capitulated(change.changes().clone(), &snapshot.entity_id)
    }

    /// Decide how to react to a new state of `member`. `members` are all
    /// available members, `member` included.
    pub fn handle_change(
        &mut self,
        member: &EntityState,
        context: Option<CorrelationId>,
        members: &[EntityState],
        target: &TargetState,
        blocking: bool,
    ) -> SyncOutcome {
        if self.mode == SyncMode::Standard {
            return SyncOutcome::default();
        }

        let change = ChangeState::from_member(member, target, self.tolerance);

        match self.classify(context) {
            Origin::Echo => {
                debug!("[{}] Ignoring echo from {}", self.label, member.entity_id);
                SyncOutcome::default()
            }
            Origin::Internal => {
                self.snapshots.clear();
                let commanded = self.last_commanded;
                let side_effects = self
                    .syncable(change, target, blocking)
                    .retain(|attr, _| !commanded.allows(attr));

                if side_effects.is_empty() {
                    return SyncOutcome {
                        cancel_enforcement: true,
                        ..SyncOutcome::default()
                    };
                }

                debug!("[{}] Adopting side effects {}", self.label, side_effects);
                SyncOutcome {
                    cancel_enforcement: true,
                    adopt: Some((
                        side_effects.changes().clone(),
                        Provenance::from_entity(UpdateSource::SideEffect, &member.entity_id),
                    )),
                    enforce: self.mode == SyncMode::Mirror,
                    ..SyncOutcome::default()
                }
            }
            Origin::External => {
                let change = self.syncable(change, target, blocking);
                if change.is_empty() {
                    if self.snapshots.remove(member.entity_id.as_str()).is_some() {
                        debug!("[{}] {} back in line", self.label, member.entity_id);
                    }
                    return SyncOutcome::default();
                }

                let mut arm_timeout = None;
                let continues = self
                    .snapshots
                    .get(member.entity_id.as_str())
                    .is_some_and(|s| s.continues(&change));
                if !continues {
                    let snapshot = self.open_snapshot(&change, members, target);
                    arm_timeout = Some(snapshot.generation);
                    self.snapshots.insert(snapshot.entity_id.clone(), snapshot);
                }

                let Some(snapshot) = self.snapshots.get_mut(member.entity_id.as_str()) else {
                    return SyncOutcome::default();
                };
                snapshot.attempts += 1;

                if snapshot.attempts > self.max_attempts
                    || snapshot.created.elapsed() > self.capitulation_timeout
                {
                    warn!(
                        "[{}] Capitulating to {} after {} attempt(s)",
                        self.label, change, snapshot.attempts
                    );
                    self.snapshots.remove(member.entity_id.as_str());
                    return SyncOutcome::capitulated(change.changes().clone(), change.entity_id());
                }

                match self.mode {
                    SyncMode::Mirror => {
                        info!("[{}] Mirroring {}", self.label, change);
                        SyncOutcome {
                            adopt: Some((
                                change.changes().clone(),
                                Provenance::from_entity(UpdateSource::Sync, change.entity_id()),
                            )),
                            enforce: true,
                            arm_timeout,
                            ..SyncOutcome::default()
                        }
                    }
                    _ => {
                        info!("[{}] Reverting {}", self.label, change);
                        SyncOutcome {
                            enforce: true,
                            arm_timeout,
                            ..SyncOutcome::default()
                        }
                    }
                }
            }
        }
    }

    /// An enforcement pass ran out of retries. Deviations that have used up
    /// their attempts are accepted.
    pub fn on_enforcement_failed(
        &mut self,
        members: &[EntityState],
        target: &TargetState,
        blocking: bool,
    ) -> SyncOutcome {
        let exhausted: Vec<String> = self
            .snapshots
            .values()
            .filter(|s| {
                s.attempts >= self.max_attempts || s.created.elapsed() > self.capitulation_timeout
            })
            .map(|s| s.entity_id.clone())
            .collect();

        let mut outcome = SyncOutcome::default();
        for entity_id in exhausted {
            let Some(snapshot) = self.snapshots.remove(&entity_id) else {
                continue;
            };
            if let Some((changes, provenance)) = self.settle(&snapshot, members, target, blocking).adopt {
                outcome.cancel_enforcement = true;
                outcome
                    .adopt
                    .get_or_insert_with(|| (BTreeMap::new(), provenance))
                    .0
                    .extend(changes);
            }
        }
        outcome
    }

    /// The capitulation timer of snapshot `generation` expired. Stale
    /// generations are ignored.
    pub fn on_timeout(
        &mut self,
        generation: u64,
        members: &[EntityState],
        target: &TargetState,
        blocking: bool,
    ) -> SyncOutcome {
        let Some(entity_id) = self
            .snapshots
            .values()
            .find(|s| s.generation == generation)
            .map(|s| s.entity_id.clone())
        else {
            return SyncOutcome::default();
        };

        match self.snapshots.remove(&entity_id) {
            Some(snapshot) => self.settle(&snapshot, members, target, blocking),
            None => SyncOutcome::default(),
        }
    }

    /// Drop snapshots of members that match the target again.
    pub fn check_consensus(&mut self, members: &[EntityState], target: &TargetState) {
        let label = &self.label;
        let tolerance = self.tolerance;
        self.snapshots.retain(|entity_id, snapshot| {
            let Some(member) = members.iter().find(|m| &m.entity_id == entity_id) else {
                return true;
            };
            let back_in_line = ChangeState::from_member(member, target, tolerance)
                .retain(|attr, _| snapshot.changes.contains_key(&attr))
                .is_empty();
            if back_in_line {
                debug!("[{}] {} agrees, clearing snapshot", label, entity_id);
            }
            !back_in_line
        });
    }
}
