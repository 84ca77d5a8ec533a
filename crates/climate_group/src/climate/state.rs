//! Immutable state values: the target state, attribute filters and per-event
//! change sets.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;
use strum::Display;
use strum::EnumIter;
use strum::EnumString;
use strum::IntoEnumIterator;

use super::reduce::within_tolerance;
use super::types::HvacMode;
use crate::engine::EntityState;

/// A syncable climate attribute.
///
/// This is the static name-to-accessor table: every read or write of a target
/// value by name goes through a `match` on this enum.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Attribute {
    HvacMode,
    Temperature,
    TargetTempLow,
    TargetTempHigh,
    Humidity,
    PresetMode,
    FanMode,
    SwingMode,
    SwingHorizontalMode,
}

impl Attribute {
    /// Attribute key on a member's state. `hvac_mode` is the primary value
    /// rather than an attribute.
    pub fn key(self) -> &'static str {
        match self {
            Attribute::HvacMode => "hvac_mode",
            Attribute::Temperature => "temperature",
            Attribute::TargetTempLow => "target_temp_low",
            Attribute::TargetTempHigh => "target_temp_high",
            Attribute::Humidity => "humidity",
            Attribute::PresetMode => "preset_mode",
            Attribute::FanMode => "fan_mode",
            Attribute::SwingMode => "swing_mode",
            Attribute::SwingHorizontalMode => "swing_horizontal_mode",
        }
    }

    /// Setpoints are meaningless on a device that is off.
    pub fn is_setpoint(self) -> bool {
        matches!(
            self,
            Attribute::Temperature
                | Attribute::TargetTempLow
                | Attribute::TargetTempHigh
                | Attribute::Humidity
        )
    }

    /// Read this attribute from a member's reported state.
    ///
    /// Unparseable values read as absent.
    pub fn read(self, state: &EntityState) -> Option<AttrValue> {
        match self {
            Attribute::HvacMode => HvacMode::from_str(&state.state).ok().map(AttrValue::Mode),
            Attribute::Temperature
            | Attribute::TargetTempLow
            | Attribute::TargetTempHigh
            | Attribute::Humidity => state.attr_f64(self.key()).ok().flatten().map(AttrValue::Number),
            Attribute::PresetMode
            | Attribute::FanMode
            | Attribute::SwingMode
            | Attribute::SwingHorizontalMode => {
                state.attr_str(self.key()).map(|s| AttrValue::Text(s.to_string()))
            }
        }
    }
}

/// Value of an [`Attribute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Mode(HvacMode),
    Number(f64),
    Text(String),
}

impl AttrValue {
    /// Numbers compare within `tolerance`, everything else exactly.
    pub fn matches(&self, other: &AttrValue, tolerance: f64) -> bool {
        match (self, other) {
            (AttrValue::Number(a), AttrValue::Number(b)) => within_tolerance(*a, *b, tolerance),
            (a, b) => a == b,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttrValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Mode(mode) => serde_json::Value::from(mode.to_string()),
            AttrValue::Number(n) => serde_json::Value::from(*n),
            AttrValue::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Mode(mode) => write!(f, "{}", mode),
            AttrValue::Number(n) => write!(f, "{}", n),
            AttrValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Who last wrote the target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UpdateSource {
    /// A command issued to the group.
    User,
    /// Mirror-mode adoption of a member change.
    Sync,
    /// Accepting a member state after enforcement gave up.
    Capitulation,
    /// Side effect of a group command reported by a member.
    SideEffect,
    Window,
    Schedule,
    /// Persisted state or the first full aggregate at startup.
    Restore,
}

/// Provenance recorded with each target state update.
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    pub entity: Option<String>,
    pub source: UpdateSource,
    pub timestamp: SystemTime,
}

impl Provenance {
    pub fn new(source: UpdateSource) -> Self {
        Self {
            entity: None,
            source,
            timestamp: SystemTime::now(),
        }
    }

    pub fn from_entity(source: UpdateSource, entity_id: &str) -> Self {
        Self {
            entity: Some(entity_id.to_string()),
            ..Self::new(source)
        }
    }
}

/// The group's intended member configuration.
///
/// Immutable: updates return a new value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    hvac_mode: Option<HvacMode>,
    temperature: Option<f64>,
    target_temp_low: Option<f64>,
    target_temp_high: Option<f64>,
    humidity: Option<f64>,
    preset_mode: Option<String>,
    fan_mode: Option<String>,
    swing_mode: Option<String>,
    swing_horizontal_mode: Option<String>,

    last_updated_by_entity: Option<String>,
    last_updated_by_source: Option<UpdateSource>,
    last_updated_timestamp: Option<SystemTime>,
}

impl TargetState {
    pub fn hvac_mode(&self) -> Option<HvacMode> {
        self.hvac_mode
    }

    pub fn last_updated_by_entity(&self) -> Option<&str> {
        self.last_updated_by_entity.as_deref()
    }

    pub fn last_updated_by_source(&self) -> Option<UpdateSource> {
        self.last_updated_by_source
    }

    pub fn last_updated_timestamp(&self) -> Option<SystemTime> {
        self.last_updated_timestamp
    }

    pub fn get(&self, attr: Attribute) -> Option<AttrValue> {
        match attr {
            Attribute::HvacMode => self.hvac_mode.map(AttrValue::Mode),
            Attribute::Temperature => self.temperature.map(AttrValue::Number),
            Attribute::TargetTempLow => self.target_temp_low.map(AttrValue::Number),
            Attribute::TargetTempHigh => self.target_temp_high.map(AttrValue::Number),
            Attribute::Humidity => self.humidity.map(AttrValue::Number),
            Attribute::PresetMode => self.preset_mode.clone().map(AttrValue::Text),
            Attribute::FanMode => self.fan_mode.clone().map(AttrValue::Text),
            Attribute::SwingMode => self.swing_mode.clone().map(AttrValue::Text),
            Attribute::SwingHorizontalMode => self.swing_horizontal_mode.clone().map(AttrValue::Text),
        }
    }

    /// Return a copy with `changes` applied and provenance replaced.
    ///
    /// Values of the wrong kind for their attribute are dropped.
    pub fn update<I>(&self, changes: I, provenance: Provenance) -> TargetState
    where
        I: IntoIterator<Item = (Attribute, AttrValue)>,
    {
        let mut next = self.clone();
        for (attr, value) in changes {
            if !next.set(attr, value.clone()) {
                tracing::debug!("Dropping {} value of wrong kind: {:?}", attr, value);
            }
        }
        next.last_updated_by_entity = provenance.entity;
        next.last_updated_by_source = Some(provenance.source);
        next.last_updated_timestamp = Some(provenance.timestamp);
        next
    }

    fn set(&mut self, attr: Attribute, value: AttrValue) -> bool {
        match (attr, value) {
            (Attribute::HvacMode, AttrValue::Mode(m)) => self.hvac_mode = Some(m),
            (Attribute::Temperature, AttrValue::Number(n)) => self.temperature = Some(n),
            (Attribute::TargetTempLow, AttrValue::Number(n)) => self.target_temp_low = Some(n),
            (Attribute::TargetTempHigh, AttrValue::Number(n)) => self.target_temp_high = Some(n),
            (Attribute::Humidity, AttrValue::Number(n)) => self.humidity = Some(n),
            (Attribute::PresetMode, AttrValue::Text(s)) => self.preset_mode = Some(s),
            (Attribute::FanMode, AttrValue::Text(s)) => self.fan_mode = Some(s),
            (Attribute::SwingMode, AttrValue::Text(s)) => self.swing_mode = Some(s),
            (Attribute::SwingHorizontalMode, AttrValue::Text(s)) => {
                self.swing_horizontal_mode = Some(s)
            }
            _ => return false,
        }
        true
    }

    /// All set attributes.
    pub fn to_map(&self) -> BTreeMap<Attribute, AttrValue> {
        Attribute::iter()
            .filter_map(|attr| self.get(attr).map(|v| (attr, v)))
            .collect()
    }

    /// Set attributes allowed by `filter`.
    pub fn to_filtered_map(&self, filter: &FilterState) -> BTreeMap<Attribute, AttrValue> {
        self.to_map()
            .into_iter()
            .filter(|(attr, _)| filter.allows(*attr))
            .collect()
    }

    /// No attribute is set (provenance is ignored).
    pub fn is_empty(&self) -> bool {
        Attribute::iter().all(|attr| self.get(attr).is_none())
    }

    /// Target values read from a persisted or live climate state.
    pub fn from_entity_state(state: &EntityState, provenance: Provenance) -> TargetState {
        TargetState::default().update(
            Attribute::iter().filter_map(|attr| attr.read(state).map(|v| (attr, v))),
            provenance,
        )
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetState(")?;
        for (i, (attr, value)) in self.to_map().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", attr, value)?;
        }
        if let Some(source) = self.last_updated_by_source {
            write!(f, "; source={}", source)?;
        }
        write!(f, ")")
    }
}

/// Boolean mask over [`Attribute`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterState {
    mask: u16,
}

impl FilterState {
    pub fn all() -> Self {
        Self::from_attributes(Attribute::iter())
    }

    pub fn none() -> Self {
        Self { mask: 0 }
    }

    pub fn from_attributes<I>(attrs: I) -> Self
    where
        I: IntoIterator<Item = Attribute>,
    {
        let mask = attrs
            .into_iter()
            .fold(0u16, |mask, attr| mask | (1 << attr as u16));
        Self { mask }
    }

    pub fn allows(&self, attr: Attribute) -> bool {
        self.mask & (1 << attr as u16) != 0
    }

    pub fn attributes(&self) -> Vec<Attribute> {
        Attribute::iter().filter(|a| self.allows(*a)).collect()
    }

    pub fn union(self, other: FilterState) -> FilterState {
        Self {
            mask: self.mask | other.mask,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }
}

impl Default for FilterState {
    fn default() -> Self {
        Self::all()
    }
}

impl Serialize for FilterState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.attributes())
    }
}

/// Attributes of one member's new state that differ from the target.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeState {
    entity_id: String,
    changes: BTreeMap<Attribute, AttrValue>,
}

impl ChangeState {
    /// Compare `member` against `target`. Attributes unset in the target or
    /// missing on the member are never deviations.
    pub fn from_member(member: &EntityState, target: &TargetState, tolerance: f64) -> Self {
        let changes = Attribute::iter()
            .filter_map(|attr| {
                let target_value = target.get(attr)?;
                let member_value = attr.read(member)?;
                (!member_value.matches(&target_value, tolerance)).then_some((attr, member_value))
            })
            .collect();

        Self {
            entity_id: member.entity_id.clone(),
            changes,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn changes(&self) -> &BTreeMap<Attribute, AttrValue> {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Keep only the attributes matching `keep`.
    pub fn retain<F>(mut self, mut keep: F) -> Self
    where
        F: FnMut(Attribute, &AttrValue) -> bool,
    {
        self.changes.retain(|attr, value| keep(*attr, value));
        self
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeState({}:", self.entity_id)?;
        for (attr, value) in &self.changes {
            write!(f, " {}={}", attr, value)?;
        }
        write!(f, ")")
    }
}
