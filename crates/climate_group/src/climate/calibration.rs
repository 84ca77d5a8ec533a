//! Pushes external sensor readings to member calibration entities.

use serde_json::Value;
use tracing::debug;

use super::types::CalibrationMode;
use crate::config::CalibrationConfig;
use crate::engine::EntityState;

/// What caused a calibration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// An external temperature or humidity sensor changed.
    Sensor,
    /// A member's own reading changed.
    Member(String),
    /// First pass once every member is available.
    Initial,
    Heartbeat,
}

impl Trigger {
    fn forced(&self) -> bool {
        matches!(self, Trigger::Initial | Trigger::Heartbeat)
    }
}

/// A value to write with `number.set_value`.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationWrite {
    pub entity_id: String,
    pub value: Value,
}

/// Readings a calibration pass is based on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readings {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    /// Averaged current temperature of the members.
    pub member_temperature: Option<f64>,
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round_ties_even() / 10.0
}

/// Whether `current` (the number entity) needs rewriting to `wanted`.
fn out_of_sync(current: Option<&EntityState>, wanted: &Value, tolerance: f64) -> bool {
    let Some(current) = current.and_then(|c| c.state_f64().ok()) else {
        return true;
    };
    match (wanted.as_i64(), wanted.as_f64()) {
        (Some(i), _) => current.round() as i64 != i,
        (None, Some(f)) => (current - f).abs() > tolerance,
        _ => true,
    }
}

/// Plan calibration writes.
///
/// Absolute and scaled targets follow the external sensor only. Offset targets
/// also follow their member, since the offset depends on the member's own
/// reading. Forced passes write regardless of the current value.
pub fn plan_writes<F>(
    config: &CalibrationConfig,
    trigger: &Trigger,
    readings: Readings,
    tolerance: f64,
    lookup: F,
) -> Vec<CalibrationWrite>
where
    F: Fn(&str) -> Option<EntityState>,
{
    let force = trigger.forced();
    let mut writes = Vec::new();

    let mut push = |entity_id: &str, value: Value| {
        let current = lookup(entity_id);
        if force || out_of_sync(current.as_ref(), &value, tolerance) {
            writes.push(CalibrationWrite {
                entity_id: entity_id.to_string(),
                value,
            });
        } else {
            debug!("Calibration {} already at {}", entity_id, value);
        }
    };

    if let Some(external) = readings.temperature {
        for (number, member_id) in &config.targets {
            let relevant = match (config.mode, trigger) {
                (_, Trigger::Sensor) => true,
                (_, t) if t.forced() => true,
                (CalibrationMode::Offset, Trigger::Member(m)) => m == member_id,
                _ => false,
            };
            if !relevant {
                continue;
            }

            let member = lookup(member_id);
            if config.ignore_off && member.as_ref().is_some_and(|m| m.state == "off") {
                debug!("Skipping calibration {}: {} is off", number, member_id);
                continue;
            }

            let value = match config.mode {
                CalibrationMode::Absolute => Value::from(round_tenth(external)),
                CalibrationMode::Scaled => Value::from((external * 100.0).round() as i64),
                CalibrationMode::Offset => {
                    let reference = member
                        .as_ref()
                        .and_then(|m| m.attr_f64("current_temperature").ok().flatten())
                        .or(readings.member_temperature);
                    let Some(reference) = reference else {
                        debug!("Skipping calibration {}: no member reading", number);
                        continue;
                    };
                    let offset = lookup(number)
                        .and_then(|n| n.state_f64().ok())
                        .unwrap_or(0.0);
                    Value::from(round_tenth(external - (reference - offset)))
                }
            };

            push(number, value);
        }
    }

    if let Some(external) = readings.humidity {
        if force || *trigger == Trigger::Sensor {
            for number in config.humidity_targets.keys() {
                push(number, Value::from(round_tenth(external)));
            }
        }
    }

    writes
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn config(mode: CalibrationMode) -> CalibrationConfig {
        CalibrationConfig {
            mode,
            targets: BTreeMap::from([
                ("number.a_calibration".to_string(), "climate.a".to_string()),
                ("number.b_calibration".to_string(), "climate.b".to_string()),
            ]),
            humidity_targets: BTreeMap::new(),
            heartbeat: None,
            ignore_off: false,
        }
    }

    fn world() -> HashMap<String, EntityState> {
        [
            EntityState::new("climate.a", "heat").with_attribute("current_temperature", 22.0),
            EntityState::new("climate.b", "off").with_attribute("current_temperature", 19.5),
            EntityState::new("number.a_calibration", "0.5"),
            EntityState::new("number.b_calibration", "20.0"),
        ]
        .into_iter()
        .map(|s| (s.entity_id.clone(), s))
        .collect()
    }

    fn readings(temperature: f64) -> Readings {
        Readings {
            temperature: Some(temperature),
            humidity: None,
            member_temperature: Some(20.75),
        }
    }

    #[test]
    fn test_absolute_writes_only_out_of_sync() {
        let world = world();
        let writes = plan_writes(
            &config(CalibrationMode::Absolute),
            &Trigger::Sensor,
            readings(20.04),
            0.1,
            |id| world.get(id).cloned(),
        );
        assert_eq!(writes, vec![CalibrationWrite {
            entity_id: "number.a_calibration".into(),
            value: json!(20.0),
        }]);
    }

    #[test]
    fn test_absolute_ignores_member_trigger() {
        let world = world();
        let writes = plan_writes(
            &config(CalibrationMode::Absolute),
            &Trigger::Member("climate.a".into()),
            readings(21.0),
            0.1,
            |id| world.get(id).cloned(),
        );
        assert!(writes.is_empty());
    }

    #[test]
    fn test_scaled_is_integer() {
        let world = world();
        let writes = plan_writes(
            &config(CalibrationMode::Scaled),
            &Trigger::Heartbeat,
            readings(21.456),
            0.1,
            |id| world.get(id).cloned(),
        );
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].value, json!(2146));
    }

    #[test]
    fn test_offset_for_triggering_member_only() {
        let world = world();
        let writes = plan_writes(
            &config(CalibrationMode::Offset),
            &Trigger::Member("climate.a".into()),
            readings(21.0),
            0.1,
            |id| world.get(id).cloned(),
        );
        // real reading 22.0 - 0.5 = 21.5, so the new offset is -0.5
        assert_eq!(writes, vec![CalibrationWrite {
            entity_id: "number.a_calibration".into(),
            value: json!(-0.5),
        }]);
    }

    #[test]
    fn test_ignore_off() {
        let world = world();
        let mut cfg = config(CalibrationMode::Absolute);
        cfg.ignore_off = true;
        let writes = plan_writes(&cfg, &Trigger::Initial, readings(21.0), 0.1, |id| {
            world.get(id).cloned()
        });
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].entity_id, "number.a_calibration");
    }

    #[test]
    fn test_humidity_is_absolute() {
        let world = world();
        let mut cfg = config(CalibrationMode::Scaled);
        cfg.targets.clear();
        cfg.humidity_targets
            .insert("number.h_calibration".into(), "climate.a".into());
        let writes = plan_writes(
            &cfg,
            &Trigger::Sensor,
            Readings {
                humidity: Some(48.26),
                ..Readings::default()
            },
            0.1,
            |id| world.get(id).cloned(),
        );
        assert_eq!(writes, vec![CalibrationWrite {
            entity_id: "number.h_calibration".into(),
            value: json!(48.3),
        }]);
    }
}
