//! Schedule entity support: a schedule's attributes name target values.

use std::collections::BTreeMap;
use std::str::FromStr;

use strum::IntoEnumIterator;
use tracing::info;

use super::state::AttrValue;
use super::state::Attribute;
use super::types::HvacMode;
use crate::engine::EntityState;

pub struct Schedule {
    label: String,
    entity: Option<String>,
}

impl Schedule {
    pub fn new(label: &str, entity: Option<String>) -> Self {
        Self {
            label: label.to_string(),
            entity,
        }
    }

    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    pub fn set_entity(&mut self, entity: Option<String>) {
        info!(
            "[{}] Schedule entity set to {}",
            self.label,
            entity.as_deref().unwrap_or("none")
        );
        self.entity = entity;
    }

    pub fn tracks(&self, entity_id: &str) -> bool {
        self.entity.as_deref() == Some(entity_id)
    }

    /// Target values carried by the schedule's current slot. Unknown
    /// attributes and values of the wrong kind are ignored.
    pub fn read(&self, state: &EntityState) -> BTreeMap<Attribute, AttrValue> {
        if !state.is_available() {
            return BTreeMap::new();
        }

        Attribute::iter()
            .filter_map(|attr| {
                let value = match attr {
                    // The primary value of a schedule is on/off, not a mode.
                    Attribute::HvacMode => state
                        .attr_str(attr.key())
                        .and_then(|m| HvacMode::from_str(m).ok())
                        .map(AttrValue::Mode),
                    _ => attr.read(state),
                };
                value.map(|v| (attr, v))
            })
            .collect()
    }
}
