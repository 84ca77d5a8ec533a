//! In-process host with simulated devices.
//!
//! Used by the daemon's `[simulation]` section and by tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use super::event::StateChangedEvent;
use super::host::Host;
use super::host::HostError;
use super::host::ServiceCall;
use super::host::Service;
use super::host::EVENT_CHANNEL_SIZE;
use super::state::CorrelationId;
use super::state::EntityState;

/// How a simulated device reacts to setter calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behaviour {
    /// Applies every call.
    #[default]
    Responsive,
    /// Accepts calls but never changes state.
    Stubborn,
    /// Rejects every call.
    Failing,
}

struct Device {
    state: EntityState,
    behaviour: Behaviour,
}

pub struct MemoryHost {
    devices: Mutex<BTreeMap<String, Device>>,
    calls: Mutex<Vec<ServiceCall>>,
    events: broadcast::Sender<StateChangedEvent>,
}

impl MemoryHost {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            devices: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            events,
        }
    }

    fn devices(&self) -> MutexGuard<'_, BTreeMap<String, Device>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call_log(&self) -> MutexGuard<'_, Vec<ServiceCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a device without emitting an event.
    pub fn insert(&self, state: EntityState, behaviour: Behaviour) {
        self.devices()
            .insert(state.entity_id.clone(), Device { state, behaviour });
    }

    pub fn set_behaviour(&self, entity_id: &str, behaviour: Behaviour) -> Result<(), HostError> {
        let mut devices = self.devices();
        let device = devices
            .get_mut(entity_id)
            .ok_or_else(|| HostError::UnknownEntity(entity_id.to_string()))?;
        device.behaviour = behaviour;
        Ok(())
    }

    /// Change a device's state as if someone operated it directly.
    pub fn set_state(&self, mut state: EntityState, context: Option<CorrelationId>) {
        state.last_changed = SystemTime::now();
        state.context = context;

        let old_state = {
            let mut devices = self.devices();
            match devices.get_mut(&state.entity_id) {
                Some(device) => Some(std::mem::replace(&mut device.state, state.clone())),
                None => {
                    devices.insert(
                        state.entity_id.clone(),
                        Device {
                            state: state.clone(),
                            behaviour: Behaviour::default(),
                        },
                    );
                    None
                }
            }
        };

        self.emit(StateChangedEvent {
            entity_id: state.entity_id.clone(),
            old_state,
            new_state: Some(state),
            context,
        });
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.call_log().clone()
    }

    pub fn clear_calls(&self) {
        self.call_log().clear();
    }

    pub fn states(&self) -> Vec<EntityState> {
        self.devices().values().map(|d| d.state.clone()).collect()
    }

    fn emit(&self, event: StateChangedEvent) {
        // No receivers is fine: nothing is tracking this entity yet.
        let _ = self.events.send(event);
    }

    /// Apply `call` to one device. Returns the change event if the state
    /// actually changed.
    fn apply(&self, entity_id: &str, call: &ServiceCall) -> Result<Option<StateChangedEvent>, HostError> {
        let mut devices = self.devices();
        let device = devices
            .get_mut(entity_id)
            .ok_or_else(|| HostError::UnknownEntity(entity_id.to_string()))?;

        match device.behaviour {
            Behaviour::Responsive => {}
            Behaviour::Stubborn => return Ok(None),
            Behaviour::Failing => {
                return Err(HostError::CallFailed {
                    domain: call.domain.to_string(),
                    service: call.service,
                    entity_id: entity_id.to_string(),
                    reason: "device rejected the command".to_string(),
                });
            }
        }

        let mut next = device.state.clone();
        for (key, value) in &call.data {
            match (call.service, key.as_str()) {
                (Service::SetValue, "value") | (_, "hvac_mode") => {
                    next.state = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                }
                _ => {
                    next.attributes.insert(key.clone(), value.clone());
                }
            }
        }

        if next.state == device.state.state && next.attributes == device.state.attributes {
            return Ok(None);
        }

        next.last_changed = SystemTime::now();
        next.context = Some(call.context);
        let old_state = std::mem::replace(&mut device.state, next.clone());

        Ok(Some(StateChangedEvent {
            entity_id: entity_id.to_string(),
            old_state: Some(old_state),
            new_state: Some(next),
            context: Some(call.context),
        }))
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn get_state(&self, entity_id: &str) -> Option<EntityState> {
        self.devices().get(entity_id).map(|d| d.state.clone())
    }

    async fn call_service(&self, call: ServiceCall) -> Result<(), HostError> {
        debug!(
            "{}.{} {:?} {} (context {})",
            call.domain,
            call.service,
            call.entity_ids,
            serde_json::Value::Object(call.data.clone()),
            call.context
        );
        self.call_log().push(call.clone());

        let mut first_error = None;
        for entity_id in &call.entity_ids {
            match self.apply(entity_id, &call) {
                Ok(Some(event)) => self.emit(event),
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.events.subscribe()
    }
}
