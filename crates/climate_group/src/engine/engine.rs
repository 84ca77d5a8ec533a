use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::event::StateChangedEvent;
use super::host::Host;
use super::restore::RestoreError;
use super::restore::RestoreStore;
use super::state::EntityState;
use super::state::State;
use crate::climate::ClimateGroup;
use crate::climate::GroupCommand;
use crate::climate::GroupError;
use crate::climate::GroupHandle;
use crate::config::GroupConfig;

/// How often changed group states are written to the restore file while
/// running.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

/// climate-group engine
///
/// Owns the running groups, fans host state changes out to them and keeps
/// their published states persisted.
pub struct Engine {
    host: Arc<dyn Host>,

    /// Host state changes, subscribed when the engine is created so nothing
    /// emitted before `run` is missed.
    events: Mutex<broadcast::Receiver<StateChangedEvent>>,

    groups: BTreeMap<String, GroupHandle>,

    /// Handles for group tasks
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,

    restore: Option<RestoreStore>,
    restored: BTreeMap<String, EntityState>,

    /// Last states written by `persist`
    persisted: std::sync::Mutex<BTreeMap<String, EntityState>>,
}

impl Engine {
    /// Create a new Engine. Previously saved states are loaded from `restore`;
    /// a corrupt file is logged and ignored.
    pub fn new(host: Arc<dyn Host>, restore: Option<RestoreStore>) -> Self {
        let restored = match restore.as_ref().map(RestoreStore::load) {
            Some(Ok(states)) => {
                info!("Loaded {} saved group state(s)", states.len());
                states
            }
            Some(Err(e)) => {
                error!("Ignoring saved states: {}", e);
                BTreeMap::new()
            }
            None => BTreeMap::new(),
        };

        Self {
            events: Mutex::new(host.subscribe()),
            host,
            groups: BTreeMap::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            restore,
            persisted: std::sync::Mutex::new(restored.clone()),
            restored,
        }
    }

    /// Register every group from configuration.
    pub fn register_groups_from_config(&mut self, cfg: &crate::config::Config) {
        for group in cfg.groups.values() {
            self.register_group(group.clone());
        }
    }

    /// Register a group with the engine
    ///
    /// This spawns the group actor, restoring its last saved state if there is
    /// one.
    pub fn register_group(&mut self, config: GroupConfig) -> GroupHandle {
        let restored = self.restored.get(&config.entity_id);
        let key = config.key.clone();
        let (handle, task) = ClimateGroup::spawn(config, self.host.clone(), restored);

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
        if self.groups.insert(key.clone(), handle.clone()).is_some() {
            warn!("Group '{}' registered twice, replacing", key);
        }
        handle
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn group(&self, key: &str) -> Option<&GroupHandle> {
        self.groups.get(key)
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupHandle> {
        self.groups.values()
    }

    /// Send a command to the group registered as `key`.
    pub async fn command(&self, key: &str, command: GroupCommand) -> Result<(), GroupError> {
        let group = self
            .groups
            .get(key)
            .ok_or_else(|| GroupError::UnknownGroup(key.to_string()))?;
        group.command(command).await
    }

    /// Get a snapshot of every group's published state.
    pub fn state_snapshot(&self) -> State {
        State {
            groups: self
                .groups
                .iter()
                .map(|(key, handle)| (key.clone(), handle.snapshot().as_ref().clone()))
                .collect(),
        }
    }

    /// Run the engine's main event loop
    ///
    /// Forwards host state changes to every group until the host closes its
    /// event stream. Groups ignore entities they do not track.
    pub async fn run(&self) {
        info!("Engine starting with {} group(s)", self.groups.len());

        let mut events = self.events.lock().await;
        let mut persist = tokio::time::interval_at(
            tokio::time::Instant::now() + PERSIST_INTERVAL,
            PERSIST_INTERVAL,
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.forward(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} state change(s), refreshing all groups", skipped);
                        for group in self.groups.values() {
                            if let Err(e) = group.refresh().await {
                                warn!("[{}] {}", group.entity_id(), e);
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = persist.tick() => {
                    if let Err(e) = self.persist() {
                        error!("Failed to persist group states: {}", e);
                    }
                }
            }
        }

        info!("Engine stopping: host closed");
    }

    async fn forward(&self, event: StateChangedEvent) {
        debug!("State change: {}", event.entity_id);
        for group in self.groups.values() {
            if let Err(e) = group.forward(event.clone()).await {
                warn!("[{}] {}", group.entity_id(), e);
            }
        }
    }

    /// Write the current group states to the restore file if any changed
    /// since the last write. Returns whether anything was written.
    pub fn persist(&self) -> Result<bool, RestoreError> {
        let Some(store) = &self.restore else {
            return Ok(false);
        };

        // Unavailable groups keep their last known state.
        let states: BTreeMap<String, EntityState> = self
            .groups
            .values()
            .map(|g| g.snapshot())
            .filter(|s| s.attributes.available)
            .map(|s| {
                let state = s.to_entity_state();
                (state.entity_id.clone(), state)
            })
            .collect();

        let mut persisted = self.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        if !changed(&persisted, &states) {
            return Ok(false);
        }

        let mut merged = persisted.clone();
        merged.extend(states);
        store.save(&merged)?;
        *persisted = merged;
        Ok(true)
    }

    /// Persist, then stop every group and wait for it to finish.
    pub async fn shutdown(&self) {
        if let Err(e) = self.persist() {
            error!("Failed to persist group states: {}", e);
        }

        for group in self.groups.values() {
            group.shutdown().await;
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Group task failed: {}", e);
            }
        }
        info!("Engine shut down");
    }
}

/// Whether any state in `next` differs from `saved` in value or attributes.
fn changed(saved: &BTreeMap<String, EntityState>, next: &BTreeMap<String, EntityState>) -> bool {
    next.iter().any(|(id, state)| {
        saved
            .get(id)
            .is_none_or(|s| s.state != state.state || s.attributes != state.attributes)
    })
}
