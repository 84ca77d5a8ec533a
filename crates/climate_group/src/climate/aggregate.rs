//! Group state aggregation: fold live member states into one virtual
//! climate device.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use super::reduce::average;
use super::reduce::most_frequent;
use super::reduce::reduce_features;
use super::reduce::reduce_modes;
use super::reduce::round_value;
use super::state::AttrValue;
use super::state::Attribute;
use super::state::TargetState;
use super::state::UpdateSource;
use super::types::Features;
use super::types::HvacAction;
use super::types::HvacMode;
use super::types::HvacModeStrategy;
use crate::config::AverageConfig;
use crate::config::GroupConfig;
use crate::engine::EntityState;
use crate::engine::Host;

pub const DEFAULT_MIN_TEMP: f64 = 7.0;
pub const DEFAULT_MAX_TEMP: f64 = 35.0;
pub const DEFAULT_MIN_HUMIDITY: f64 = 30.0;
pub const DEFAULT_MAX_HUMIDITY: f64 = 99.0;

/// How long the commanded HVAC mode is reported after a user command,
/// before members have had a chance to report back.
pub const OPTIMISTIC_GRACE: Duration = Duration::from_secs(3);

/// The computed view of a group. Field names match the attribute keys of a
/// climate entity so the value can be published and restored as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupAttributes {
    pub available: bool,
    pub hvac_mode: Option<HvacMode>,
    pub hvac_modes: Vec<HvacMode>,
    pub hvac_action: Option<HvacAction>,
    pub current_hvac_modes: Vec<String>,
    pub last_active_hvac_mode: Option<HvacMode>,
    pub assumed_state: bool,

    pub current_temperature: Option<f64>,
    pub temperature: Option<f64>,
    pub target_temp_low: Option<f64>,
    pub target_temp_high: Option<f64>,
    pub target_temp_step: Option<f64>,
    pub min_temp: f64,
    pub max_temp: f64,

    pub current_humidity: Option<f64>,
    pub humidity: Option<f64>,
    pub min_humidity: f64,
    pub max_humidity: f64,

    pub fan_mode: Option<String>,
    pub fan_modes: Vec<String>,
    pub preset_mode: Option<String>,
    pub preset_modes: Vec<String>,
    pub swing_mode: Option<String>,
    pub swing_modes: Vec<String>,
    pub swing_horizontal_mode: Option<String>,
    pub swing_horizontal_modes: Vec<String>,

    pub supported_features: Features,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_reason: Option<String>,

    /// Member ids, when exposed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Vec<String>>,

    /// Averaged current temperature of the members themselves, ignoring
    /// external sensors.
    #[serde(skip)]
    pub member_temperature: Option<f64>,
}

impl Default for GroupAttributes {
    fn default() -> Self {
        Self {
            available: false,
            hvac_mode: None,
            hvac_modes: vec![HvacMode::Off],
            hvac_action: None,
            current_hvac_modes: Vec::new(),
            last_active_hvac_mode: None,
            assumed_state: false,
            current_temperature: None,
            temperature: None,
            target_temp_low: None,
            target_temp_high: None,
            target_temp_step: None,
            min_temp: DEFAULT_MIN_TEMP,
            max_temp: DEFAULT_MAX_TEMP,
            current_humidity: None,
            humidity: None,
            min_humidity: DEFAULT_MIN_HUMIDITY,
            max_humidity: DEFAULT_MAX_HUMIDITY,
            fan_mode: None,
            fan_modes: Vec::new(),
            preset_mode: None,
            preset_modes: Vec::new(),
            swing_mode: None,
            swing_modes: Vec::new(),
            swing_horizontal_mode: None,
            swing_horizontal_modes: Vec::new(),
            supported_features: Features::GROUP_DEFAULT,
            blocking_reason: None,
            entity_id: None,
            member_temperature: None,
        }
    }
}

impl GroupAttributes {
    /// The aggregate value of a syncable attribute.
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
            Attribute::SwingHorizontalMode => {
                self.swing_horizontal_mode.clone().map(AttrValue::Text)
            }
        }
    }

    /// Publish as a climate entity state.
    pub fn to_entity_state(&self, entity_id: &str) -> EntityState {
        let state = match (self.available, self.hvac_mode) {
            (false, _) => crate::engine::STATE_UNAVAILABLE.to_string(),
            (true, Some(mode)) => mode.to_string(),
            (true, None) => crate::engine::STATE_UNKNOWN.to_string(),
        };

        let mut entity = EntityState::new(entity_id, state);
        if let Ok(Value::Object(attributes)) = serde_json::to_value(self) {
            entity.attributes = attributes
                .into_iter()
                .filter(|(key, value)| !value.is_null() && key != "available" && key != "hvac_mode")
                .collect();
        }
        entity
    }

    /// Advertised lists and limits from a persisted state. The group stays
    /// unavailable until a member reports.
    pub fn from_restored(state: &EntityState) -> Self {
        let restored = serde_json::from_value::<GroupAttributes>(Value::Object(state.attributes.clone()))
            .unwrap_or_else(|e| {
                warn!("Ignoring malformed restored attributes of {}: {}", state.entity_id, e);
                GroupAttributes::default()
            });

        Self {
            available: false,
            hvac_mode: HvacMode::from_str(&state.state).ok(),
            ..restored
        }
    }
}

/// Everything one aggregation round looks at.
pub struct AggregateInput<'a> {
    /// Available members only.
    pub members: &'a [EntityState],
    pub master: Option<&'a EntityState>,
    pub temperature_sensors: &'a [EntityState],
    pub humidity_sensors: &'a [EntityState],
    pub target: &'a TargetState,
    pub blocking: bool,
    pub now: SystemTime,
}

/// Available states of `entity_ids`, and whether every one of them is
/// available.
pub fn available_states(host: &dyn Host, entity_ids: &[String]) -> (Vec<EntityState>, bool) {
    let states: Vec<EntityState> = entity_ids
        .iter()
        .filter_map(|id| host.get_state(id))
        .filter(EntityState::is_available)
        .collect();
    let all_ready = states.len() == entity_ids.len();
    (states, all_ready)
}

pub struct Aggregator {
    config: Arc<GroupConfig>,
}

impl Aggregator {
    pub fn new(config: Arc<GroupConfig>) -> Self {
        Self { config }
    }

    /// Recompute the group view. Pure: the same inputs always produce the
    /// same result.
    pub fn recompute(&self, previous: &GroupAttributes, input: &AggregateInput<'_>) -> GroupAttributes {
        if input.members.is_empty() {
            return GroupAttributes {
                available: false,
                hvac_mode: None,
                ..previous.clone()
            };
        }

        let members = input.members;
        let member_modes: Vec<HvacMode> = members
            .iter()
            .filter_map(|s| HvacMode::from_str(&s.state).ok())
            .collect();

        let hvac_mode = self.optimistic_mode(input.target, input.now).or_else(|| {
            resolve_hvac_mode(
                &member_modes,
                self.config.hvac_mode_strategy,
                input.target.hvac_mode(),
            )
        });

        let last_active_hvac_mode = match hvac_mode {
            Some(mode) if mode != HvacMode::Off => Some(mode),
            _ => previous.last_active_hvac_mode,
        };

        let mut hvac_modes: Vec<HvacMode> = reduce_modes(
            &members
                .iter()
                .map(|s| {
                    s.attr_list("hvac_modes")
                        .iter()
                        .filter_map(|m| HvacMode::from_str(m).ok())
                        .collect()
                })
                .collect::<Vec<Vec<HvacMode>>>(),
            self.config.feature_strategy,
        );
        hvac_modes.push(HvacMode::Off);
        hvac_modes.sort();
        hvac_modes.dedup();

        let actions: Vec<Option<HvacAction>> = members
            .iter()
            .map(|s| s.attr_str("hvac_action").and_then(|a| HvacAction::from_str(a).ok()))
            .collect();

        let features = reduce_features(
            &members
                .iter()
                .filter_map(Features::of)
                .collect::<Vec<_>>(),
            self.config.feature_strategy,
        )
        .unwrap_or_default();

        let temp = &self.config.temperature;
        let humidity = &self.config.humidity;
        let master = input.master;

        let member_temperature = average(&self.numbers(members, "current_temperature"), temp.current_average);
        let current_temperature = if self.config.temperature_sensors.is_empty() {
            member_temperature
        } else {
            let value = average(&self.sensor_values(input.temperature_sensors), temp.current_average);
            if value.is_none() {
                debug!("[{}] External temperature sensors unavailable", self.config.entity_id);
            }
            value
        };

        let current_humidity = if self.config.humidity_sensors.is_empty() {
            average(&self.numbers(members, "current_humidity"), humidity.current_average)
        } else {
            let value = average(&self.sensor_values(input.humidity_sensors), humidity.current_average);
            if value.is_none() {
                debug!("[{}] External humidity sensors unavailable", self.config.entity_id);
            }
            value
        };

        GroupAttributes {
            available: true,
            hvac_mode,
            hvac_modes,
            hvac_action: resolve_hvac_action(&actions),
            current_hvac_modes: members.iter().map(|s| s.state.clone()).collect(),
            last_active_hvac_mode,
            assumed_state: !members.iter().all(|s| s.state == members[0].state),

            current_temperature,
            temperature: self.target_value(members, master, "temperature", temp),
            target_temp_low: self.target_value(members, master, "target_temp_low", temp),
            target_temp_high: self.target_value(members, master, "target_temp_high", temp),
            target_temp_step: self
                .numbers(members, "target_temp_step")
                .into_iter()
                .reduce(f64::max),
            min_temp: self
                .numbers(members, "min_temp")
                .into_iter()
                .reduce(f64::max)
                .unwrap_or(DEFAULT_MIN_TEMP),
            max_temp: self
                .numbers(members, "max_temp")
                .into_iter()
                .reduce(f64::min)
                .unwrap_or(DEFAULT_MAX_TEMP),

            current_humidity,
            humidity: self.target_value(members, master, "humidity", humidity),
            min_humidity: self
                .numbers(members, "min_humidity")
                .into_iter()
                .reduce(f64::max)
                .unwrap_or(DEFAULT_MIN_HUMIDITY),
            max_humidity: self
                .numbers(members, "max_humidity")
                .into_iter()
                .reduce(f64::min)
                .unwrap_or(DEFAULT_MAX_HUMIDITY),

            fan_mode: most_frequent(members.iter().filter_map(|s| s.attr_str("fan_mode"))).map(String::from),
            fan_modes: self.sorted_modes(members, "fan_modes"),
            preset_mode: most_frequent(members.iter().filter_map(|s| s.attr_str("preset_mode"))).map(String::from),
            preset_modes: self.sorted_modes(members, "preset_modes"),
            swing_mode: most_frequent(members.iter().filter_map(|s| s.attr_str("swing_mode"))).map(String::from),
            swing_modes: self.sorted_modes(members, "swing_modes"),
            swing_horizontal_mode: most_frequent(members.iter().filter_map(|s| s.attr_str("swing_horizontal_mode")))
                .map(String::from),
            swing_horizontal_modes: self.sorted_modes(members, "swing_horizontal_modes"),

            supported_features: (features | Features::GROUP_DEFAULT) & Features::GROUP_SUPPORTED,

            blocking_reason: input.blocking.then(|| "window_open".to_string()),
            entity_id: self.config.expose_member_entities.then(|| self.config.members.clone()),
            member_temperature,
        }
    }

    /// The commanded mode, while a user command is still fresh.
    fn optimistic_mode(&self, target: &TargetState, now: SystemTime) -> Option<HvacMode> {
        if target.last_updated_by_source() != Some(UpdateSource::User) {
            return None;
        }
        let age = now.duration_since(target.last_updated_timestamp()?).ok()?;
        if age >= OPTIMISTIC_GRACE {
            return None;
        }
        let mode = target.hvac_mode()?;
        debug!("[{}] Applying optimistic hvac mode {}", self.config.entity_id, mode);
        Some(mode)
    }

    /// Master value if configured and reported, else the member average,
    /// rounded.
    fn target_value(
        &self,
        members: &[EntityState],
        master: Option<&EntityState>,
        key: &str,
        settings: &AverageConfig,
    ) -> Option<f64> {
        let from_master = master
            .filter(|_| settings.use_master)
            .and_then(|m| self.number(m, key));
        from_master
            .or_else(|| average(&self.numbers(members, key), settings.target_average))
            .map(|v| round_value(v, settings.round))
    }

    fn number(&self, state: &EntityState, key: &str) -> Option<f64> {
        match state.attr_f64(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("[{}] Skipping value: {}", self.config.entity_id, e);
                None
            }
        }
    }

    fn numbers(&self, states: &[EntityState], key: &str) -> Vec<f64> {
        states.iter().filter_map(|s| self.number(s, key)).collect()
    }

    fn sensor_values(&self, sensors: &[EntityState]) -> Vec<f64> {
        sensors
            .iter()
            .filter_map(|s| match s.state_f64() {
                Ok(v) if v.is_finite() => Some(v),
                Ok(_) => None,
                Err(e) => {
                    warn!("[{}] Skipping sensor reading: {}", self.config.entity_id, e);
                    None
                }
            })
            .collect()
    }

    fn sorted_modes(&self, members: &[EntityState], key: &str) -> Vec<String> {
        let lists: Vec<Vec<String>> = members.iter().map(|s| s.attr_list(key)).collect();
        let mut modes = reduce_modes(&lists, self.config.feature_strategy);
        modes.sort();
        modes
    }
}

/// Resolve the group HVAC mode from member modes.
pub fn resolve_hvac_mode(
    modes: &[HvacMode],
    strategy: HvacModeStrategy,
    target: Option<HvacMode>,
) -> Option<HvacMode> {
    let strategy = match strategy {
        HvacModeStrategy::Auto if matches!(target, None | Some(HvacMode::Off)) => HvacModeStrategy::Normal,
        HvacModeStrategy::Auto => HvacModeStrategy::OffPriority,
        other => other,
    };

    let most_common_active = most_frequent(modes.iter().copied().filter(|m| *m != HvacMode::Off));

    match strategy {
        HvacModeStrategy::OffPriority if modes.contains(&HvacMode::Off) => Some(HvacMode::Off),
        HvacModeStrategy::Normal if !modes.is_empty() && modes.iter().all(|m| *m == HvacMode::Off) => {
            Some(HvacMode::Off)
        }
        _ => most_common_active,
    }
}

/// Active actions win by plurality, then idle, then off.
pub fn resolve_hvac_action(actions: &[Option<HvacAction>]) -> Option<HvacAction> {
    let active = most_frequent(
        actions
            .iter()
            .flatten()
            .copied()
            .filter(|a| !matches!(a, HvacAction::Off | HvacAction::Idle)),
    );

    active
        .or_else(|| actions.contains(&Some(HvacAction::Idle)).then_some(HvacAction::Idle))
        .or_else(|| actions.contains(&Some(HvacAction::Off)).then_some(HvacAction::Off))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::climate::state::Provenance;
    use crate::climate::types::FeatureStrategy;
    use crate::climate::types::RoundMode;

    fn member(id: &str, mode: &str, temperature: f64) -> EntityState {
        EntityState::new(id, mode)
            .with_attribute("temperature", temperature)
            .with_attribute("current_temperature", temperature - 1.0)
            .with_attribute("hvac_modes", json!(["off", "heat", "cool"]))
            .with_attribute("fan_modes", json!(["low", "high", "auto"]))
            .with_attribute("supported_features", 1 | 8 | 128 | 256)
    }

    fn input<'a>(members: &'a [EntityState], target: &'a TargetState) -> AggregateInput<'a> {
        AggregateInput {
            members,
            master: None,
            temperature_sensors: &[],
            humidity_sensors: &[],
            target,
            blocking: false,
            now: SystemTime::now(),
        }
    }

    fn aggregator(f: impl FnOnce(&mut GroupConfig)) -> Aggregator {
        let mut config = GroupConfig::new("test", &["climate.a", "climate.b", "climate.c"]);
        f(&mut config);
        Aggregator::new(Arc::new(config))
    }

    #[test]
    fn test_two_heating_members_resolve_to_heat() {
        let members = [member("climate.a", "heat", 21.0), member("climate.b", "heat", 21.0)];
        let target = TargetState::default();
        let attrs = aggregator(|_| {}).recompute(&GroupAttributes::default(), &input(&members, &target));
        assert_eq!(attrs.hvac_mode, Some(HvacMode::Heat));
        assert!(attrs.available);
        assert!(!attrs.assumed_state);
    }

    #[test]
    fn test_off_priority() {
        assert_eq!(
            resolve_hvac_mode(
                &[HvacMode::Off, HvacMode::Heat, HvacMode::Heat],
                HvacModeStrategy::OffPriority,
                None
            ),
            Some(HvacMode::Off)
        );
        assert_eq!(
            resolve_hvac_mode(
                &[HvacMode::Off, HvacMode::Heat, HvacMode::Heat],
                HvacModeStrategy::Normal,
                None
            ),
            Some(HvacMode::Heat)
        );
        assert_eq!(
            resolve_hvac_mode(&[HvacMode::Off, HvacMode::Off], HvacModeStrategy::Normal, None),
            Some(HvacMode::Off)
        );
        assert_eq!(resolve_hvac_mode(&[], HvacModeStrategy::Normal, None), None);
    }

    #[test]
    fn test_auto_strategy_follows_target() {
        let modes = [HvacMode::Off, HvacMode::Heat];
        assert_eq!(
            resolve_hvac_mode(&modes, HvacModeStrategy::Auto, Some(HvacMode::Heat)),
            Some(HvacMode::Off)
        );
        assert_eq!(
            resolve_hvac_mode(&modes, HvacModeStrategy::Auto, Some(HvacMode::Off)),
            Some(HvacMode::Heat)
        );
        assert_eq!(
            resolve_hvac_mode(&modes, HvacModeStrategy::Auto, None),
            Some(HvacMode::Heat)
        );
    }

    #[test]
    fn test_hvac_action_priority() {
        use HvacAction::*;
        assert_eq!(resolve_hvac_action(&[Some(Idle), Some(Heating), Some(Off)]), Some(Heating));
        assert_eq!(resolve_hvac_action(&[Some(Idle), Some(Off), None]), Some(Idle));
        assert_eq!(resolve_hvac_action(&[Some(Off), None]), Some(Off));
        assert_eq!(resolve_hvac_action(&[None, None]), None);
        assert_eq!(
            resolve_hvac_action(&[Some(Cooling), Some(Heating), Some(Heating)]),
            Some(Heating)
        );
    }

    #[test]
    fn test_mean_and_half_rounding() {
        let agg = aggregator(|c| c.temperature.round = RoundMode::Half);
        let target = TargetState::default();

        let members = [member("climate.a", "heat", 21.0), member("climate.b", "heat", 23.0)];
        let attrs = agg.recompute(&GroupAttributes::default(), &input(&members, &target));
        assert_eq!(attrs.temperature, Some(22.0));

        let members = [member("climate.a", "heat", 21.0), member("climate.b", "heat", 22.3)];
        let attrs = agg.recompute(&GroupAttributes::default(), &input(&members, &target));
        assert_eq!(attrs.temperature, Some(21.5));
        // Measured values are never rounded
        assert!((attrs.current_temperature.unwrap() - 20.65).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_values_are_skipped() {
        let members = [
            member("climate.a", "heat", 21.0),
            member("climate.b", "heat", 0.0).with_attribute("temperature", "n/a"),
        ];
        let target = TargetState::default();
        let attrs = aggregator(|_| {}).recompute(&GroupAttributes::default(), &input(&members, &target));
        assert_eq!(attrs.temperature, Some(21.0));
    }

    #[test]
    fn test_no_members_marks_unavailable_and_keeps_rest() {
        let agg = aggregator(|_| {});
        let target = TargetState::default();
        let members = [member("climate.a", "heat", 21.0)];
        let previous = agg.recompute(&GroupAttributes::default(), &input(&members, &target));

        let attrs = agg.recompute(&previous, &input(&[], &target));
        assert!(!attrs.available);
        assert_eq!(attrs.hvac_mode, None);
        assert_eq!(attrs.temperature, previous.temperature);
        assert_eq!(attrs.fan_modes, previous.fan_modes);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let agg = aggregator(|_| {});
        let target = TargetState::default();
        let members = [member("climate.a", "heat", 21.0), member("climate.b", "cool", 24.0)];
        let first = agg.recompute(&GroupAttributes::default(), &input(&members, &target));
        let second = agg.recompute(&GroupAttributes::default(), &input(&members, &target));
        assert_eq!(first, second);
        assert!(first.assumed_state);
    }

    #[test]
    fn test_modes_features_and_limits() {
        let a = member("climate.a", "heat", 21.0)
            .with_attribute("hvac_modes", json!(["heat", "dry"]))
            .with_attribute("min_temp", 5.0)
            .with_attribute("max_temp", 30.0)
            .with_attribute("target_temp_step", 0.5);
        let b = member("climate.b", "heat", 21.0)
            .with_attribute("fan_modes", json!(["high", "turbo"]))
            .with_attribute("supported_features", 1 | 4)
            .with_attribute("min_temp", 8.0)
            .with_attribute("target_temp_step", 1.0);
        let members = [a, b];
        let target = TargetState::default();

        let attrs = aggregator(|_| {}).recompute(&GroupAttributes::default(), &input(&members, &target));
        assert_eq!(attrs.hvac_modes, vec![HvacMode::Off, HvacMode::Heat]);
        assert_eq!(attrs.fan_modes, vec!["high".to_string()]);
        assert_eq!(attrs.min_temp, 8.0);
        assert_eq!(attrs.max_temp, 30.0);
        assert_eq!(attrs.target_temp_step, Some(1.0));
        assert_eq!(
            attrs.supported_features,
            Features::TARGET_TEMPERATURE | Features::GROUP_DEFAULT
        );

        let union = aggregator(|c| c.feature_strategy = FeatureStrategy::Union)
            .recompute(&GroupAttributes::default(), &input(&members, &target));
        assert_eq!(
            union.hvac_modes,
            vec![HvacMode::Off, HvacMode::Heat, HvacMode::Cool, HvacMode::Dry]
        );
        assert_eq!(union.fan_modes, vec!["auto", "high", "low", "turbo"]);
        assert!(union.supported_features.contains(Features::TARGET_HUMIDITY));
    }

    #[test]
    fn test_master_and_external_sensors() {
        let agg = aggregator(|c| {
            c.master_entity = Some("climate.a".into());
            c.temperature.use_master = true;
            c.temperature_sensors = vec!["sensor.t1".into(), "sensor.t2".into(), "sensor.t3".into()];
        });
        let members = [member("climate.a", "heat", 20.0), member("climate.b", "heat", 24.0)];
        let sensors = [
            EntityState::new("sensor.t1", "19.0"),
            EntityState::new("sensor.t2", "21.0"),
            EntityState::new("sensor.t3", "broken"),
        ];
        let target = TargetState::default();
        let attrs = agg.recompute(
            &GroupAttributes::default(),
            &AggregateInput {
                master: Some(&members[0]),
                temperature_sensors: &sensors,
                ..input(&members, &target)
            },
        );
        assert_eq!(attrs.temperature, Some(20.0));
        assert_eq!(attrs.current_temperature, Some(20.0));
        assert_eq!(attrs.member_temperature, Some(21.0));
    }

    #[test]
    fn test_optimistic_mode_after_user_command() {
        let members = [member("climate.a", "off", 21.0), member("climate.b", "off", 21.0)];
        let target = TargetState::default().update(
            [(Attribute::HvacMode, AttrValue::Mode(HvacMode::Heat))],
            Provenance::new(UpdateSource::User),
        );
        let agg = aggregator(|_| {});

        let attrs = agg.recompute(&GroupAttributes::default(), &input(&members, &target));
        assert_eq!(attrs.hvac_mode, Some(HvacMode::Heat));

        let later = AggregateInput {
            now: SystemTime::now() + Duration::from_secs(5),
            ..input(&members, &target)
        };
        assert_eq!(
            agg.recompute(&GroupAttributes::default(), &later).hvac_mode,
            Some(HvacMode::Off)
        );
    }

    #[test]
    fn test_publish_and_restore() {
        let members = [member("climate.a", "heat", 21.0)];
        let target = TargetState::default();
        let attrs = aggregator(|_| {}).recompute(&GroupAttributes::default(), &input(&members, &target));

        let published = attrs.to_entity_state("climate.test");
        assert_eq!(published.state, "heat");
        assert_eq!(published.attr_f64("temperature"), Ok(Some(21.0)));
        assert!(published.attr("available").is_none());

        let restored = GroupAttributes::from_restored(&published);
        assert!(!restored.available);
        assert_eq!(restored.hvac_mode, Some(HvacMode::Heat));
        assert_eq!(restored.hvac_modes, attrs.hvac_modes);
        assert_eq!(restored.fan_modes, attrs.fan_modes);
        assert_eq!(restored.last_active_hvac_mode, Some(HvacMode::Heat));
    }
}
