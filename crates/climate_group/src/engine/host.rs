use async_trait::async_trait;
use serde::Serialize;
use strum::Display;
use tokio::sync::broadcast;

use super::event::StateChangedEvent;
use super::state::Attributes;
use super::state::CorrelationId;
use super::state::EntityState;

/// Capacity of the host's state-change broadcast channel.
///
/// Slow subscribers that fall further behind than this skip events and
/// resynchronise from `get_state`.
pub const EVENT_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("{domain}.{service} failed for {entity_id}: {reason}")]
    CallFailed {
        domain: String,
        service: Service,
        entity_id: String,
        reason: String,
    },

    #[error("host is shut down")]
    Closed,
}

/// Setter services the core issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Service {
    SetHvacMode,
    SetTemperature,
    SetHumidity,
    SetFanMode,
    SetPresetMode,
    SetSwingMode,
    SetSwingHorizontalMode,
    /// `number.set_value`, used for calibration entities.
    SetValue,
}

/// One batched setter call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCall {
    pub domain: &'static str,
    pub service: Service,
    pub entity_ids: Vec<String>,
    pub data: Attributes,
    pub blocking: bool,
    pub context: CorrelationId,
}

impl ServiceCall {
    pub fn climate(service: Service, entity_ids: Vec<String>, data: Attributes, context: CorrelationId) -> Self {
        Self {
            domain: "climate",
            service,
            entity_ids,
            data,
            blocking: true,
            context,
        }
    }

    pub fn number(entity_id: &str, value: impl Into<serde_json::Value>, context: CorrelationId) -> Self {
        let mut data = Attributes::new();
        data.insert("value".to_string(), value.into());
        Self {
            domain: "number",
            service: Service::SetValue,
            entity_ids: vec![entity_id.to_string()],
            data,
            blocking: false,
            context,
        }
    }
}

/// The environment member devices live in.
///
/// Reads are synchronous lookups against the host's cache; writes suspend
/// until the call round-trips.
#[async_trait]
pub trait Host: Send + Sync {
    fn get_state(&self, entity_id: &str) -> Option<EntityState>;

    async fn call_service(&self, call: ServiceCall) -> Result<(), HostError>;

    /// Subscribe to state changes of every entity.
    fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent>;
}
