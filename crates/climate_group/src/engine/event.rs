use super::state::CorrelationId;
use super::state::EntityState;

/// A state change reported by the host.
///
/// `context` carries the correlation id of the service call that caused the
/// change, or `None` for changes made outside this process.
#[derive(Debug, Clone)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: Option<EntityState>,
    pub context: Option<CorrelationId>,
}

impl StateChangedEvent {
    /// Whether the primary value or attributes changed.
    ///
    /// Hosts may emit events that only bump `last_changed`.
    pub fn is_significant(&self) -> bool {
        match (&self.old_state, &self.new_state) {
            (Some(old), Some(new)) => old.state != new.state || old.attributes != new.attributes,
            _ => true,
        }
    }
}
