//! Domain enums shared by every climate group component.

use std::ops::BitAnd;
use std::ops::BitOr;

use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumIter;
use strum::EnumString;
use tracing::warn;

use crate::engine::EntityState;

/// Operating mode of a climate device.
///
/// Declaration order is the display order used for the group's mode list.
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
pub enum HvacMode {
    Off,
    Heat,
    Cool,
    HeatCool,
    Auto,
    Dry,
    FanOnly,
}

/// What a climate device is currently doing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HvacAction {
    Off,
    Preheating,
    Heating,
    Cooling,
    Drying,
    Fan,
    Idle,
    Defrosting,
}

/// How numeric member values are combined into one group value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AverageMethod {
    Min,
    Max,
    #[default]
    Mean,
    Median,
}

/// Rounding applied to aggregated target values.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RoundMode {
    #[default]
    None,
    Half,
    Integer,
}

/// Rule for resolving the group HVAC mode from member modes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HvacModeStrategy {
    /// Off only when every member is off.
    #[default]
    Normal,
    /// Off as soon as any member is off.
    OffPriority,
    /// `OffPriority` while the target is on, `Normal` otherwise.
    Auto,
}

/// Whether mode lists and features are intersected or unioned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FeatureStrategy {
    #[default]
    Intersection,
    Union,
}

/// Policy for member deviations from the target state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncMode {
    /// Aggregate only.
    #[default]
    Standard,
    /// Revert members to the target state.
    Lock,
    /// Adopt member changes into the target state and propagate them.
    Mirror,
}

/// How an external temperature is written to a calibration entity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CalibrationMode {
    #[default]
    Absolute,
    Offset,
    Scaled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WindowMode {
    #[default]
    Off,
    On,
}

/// Bitmask of climate capabilities, bit-compatible with Home Assistant's
/// `ClimateEntityFeature`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features(pub u32);

impl Features {
    pub const TARGET_TEMPERATURE: Features = Features(1);
    pub const TARGET_TEMPERATURE_RANGE: Features = Features(2);
    pub const TARGET_HUMIDITY: Features = Features(4);
    pub const FAN_MODE: Features = Features(8);
    pub const PRESET_MODE: Features = Features(16);
    pub const SWING_MODE: Features = Features(32);
    pub const TURN_OFF: Features = Features(128);
    pub const TURN_ON: Features = Features(256);
    pub const SWING_HORIZONTAL_MODE: Features = Features(512);

    /// Everything a group can offer.
    pub const GROUP_SUPPORTED: Features = Features(
        Self::TARGET_TEMPERATURE.0
            | Self::TARGET_TEMPERATURE_RANGE.0
            | Self::TARGET_HUMIDITY.0
            | Self::FAN_MODE.0
            | Self::PRESET_MODE.0
            | Self::SWING_MODE.0
            | Self::TURN_OFF.0
            | Self::TURN_ON.0
            | Self::SWING_HORIZONTAL_MODE.0,
    );

    /// Offered even when no member reports features.
    pub const GROUP_DEFAULT: Features = Features(Self::TURN_OFF.0 | Self::TURN_ON.0);

    pub fn contains(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    /// Features reported by `state`. Values that are not a 32 bit mask are
    /// skipped.
    pub fn of(state: &EntityState) -> Option<Features> {
        let value = state.attr("supported_features")?;
        match value.as_u64().and_then(|f| u32::try_from(f).ok()) {
            Some(f) => Some(Features(f)),
            None => {
                warn!(
                    "Skipping supported_features of {}: {}",
                    state.entity_id, value
                );
                None
            }
        }
    }
}

impl BitAnd for Features {
    type Output = Features;

    fn bitand(self, rhs: Self) -> Self::Output {
        Features(self.0 & rhs.0)
    }
}

impl BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Self) -> Self::Output {
        Features(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_hvac_mode_names() {
        assert_eq!(HvacMode::HeatCool.to_string(), "heat_cool");
        assert_eq!(HvacMode::from_str("fan_only").unwrap(), HvacMode::FanOnly);
        assert!(HvacMode::from_str("warm").is_err());
    }

    #[test]
    fn test_hvac_mode_order() {
        let mut modes = vec![HvacMode::Dry, HvacMode::Off, HvacMode::Heat];
        modes.sort();
        assert_eq!(modes, vec![HvacMode::Off, HvacMode::Heat, HvacMode::Dry]);
    }

    #[test]
    fn test_features_mask() {
        let f = Features::TARGET_TEMPERATURE | Features::FAN_MODE;
        assert!(f.contains(Features::FAN_MODE));
        assert!(!f.contains(Features::TARGET_HUMIDITY));
        assert_eq!((f & Features::FAN_MODE), Features::FAN_MODE);
    }

    #[test]
    fn test_features_of_state() {
        let state = EntityState::new("climate.a", "heat").with_attribute("supported_features", 1 | 8);
        assert_eq!(Features::of(&state), Some(Features(9)));

        let oversized = EntityState::new("climate.a", "heat").with_attribute("supported_features", 1u64 << 33);
        assert_eq!(Features::of(&oversized), None);

        let text = EntityState::new("climate.a", "heat").with_attribute("supported_features", "lots");
        assert_eq!(Features::of(&text), None);
        assert_eq!(Features::of(&EntityState::new("climate.a", "heat")), None);
    }
}
