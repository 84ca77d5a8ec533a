use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use super::diagnostics::format_diagnostics;
use super::diagnostics::ConfigError;
use super::diagnostics::Diagnostic;
use super::diagnostics::Warning;
use super::partial::PartialCalibrationConfig;
use super::partial::PartialCallsConfig;
use super::partial::PartialConfig;
use super::partial::PartialGroupConfig;
use super::partial::PartialSyncConfig;
use super::partial::PartialWindowConfig;
use crate::climate::Attribute;
use crate::climate::AverageMethod;
use crate::climate::CalibrationMode;
use crate::climate::FeatureStrategy;
use crate::climate::FilterState;
use crate::climate::HvacMode;
use crate::climate::HvacModeStrategy;
use crate::climate::RoundMode;
use crate::climate::SyncMode;
use crate::climate::WindowMode;
use crate::climate::FLOAT_TOLERANCE;
use crate::engine::Attributes;
use crate::engine::Behaviour;
use crate::engine::EntityState;

pub const DEFAULT_API_PORT: u16 = 8565;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_CAPITULATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ROOM_OPEN_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_ZONE_OPEN_DELAY: Duration = Duration::from_secs(300);
pub const DEFAULT_CLOSE_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub persistence: PersistenceConfig,
    pub groups: BTreeMap<String, GroupConfig>,
    pub simulation: SimulationConfig,
}

// LogLevel needs Deserialize because it's used in PartialLoggingConfig with toml::Spanned
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Per-target filter: `level` by default, `overrides` for their targets.
    pub fn targets(&self) -> Targets {
        self.overrides
            .iter()
            .fold(Targets::new().with_default(self.level), |targets, (target, level)| {
                targets.with_target(target.clone(), *level)
            })
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: IpAddr,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: IpAddr::from([127, 0, 0, 1]),
            port: DEFAULT_API_PORT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceConfig {
    /// Where group states are saved between runs. Nothing is persisted if
    /// unset.
    pub state_file: Option<PathBuf>,
}

/// Averaging and rounding for one quantity (temperature or humidity).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AverageConfig {
    pub current_average: AverageMethod,
    pub target_average: AverageMethod,
    pub round: RoundMode,

    /// Prefer the master entity's target value over the average.
    pub use_master: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallsConfig {
    pub debounce_delay: Duration,

    /// Retries after the first attempt.
    pub retry_attempts: u32,
    pub retry_delay: Duration,

    /// Numeric values closer than this are considered equal.
    pub tolerance: f64,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            debounce_delay: Duration::ZERO,
            retry_attempts: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
            tolerance: FLOAT_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub attributes: FilterState,

    /// Deviations tolerated within one conflict before the member's state is
    /// accepted.
    pub max_attempts: u32,
    pub capitulation_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            attributes: FilterState::all(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            capitulation_timeout: DEFAULT_CAPITULATION_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    pub mode: WindowMode,
    pub room_sensor: Option<String>,
    pub zone_sensor: Option<String>,
    pub room_open_delay: Duration,
    pub zone_open_delay: Duration,
    pub close_delay: Duration,
    pub restore_attributes: FilterState,
    pub default_hvac_mode: Option<HvacMode>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            mode: WindowMode::Off,
            room_sensor: None,
            zone_sensor: None,
            room_open_delay: DEFAULT_ROOM_OPEN_DELAY,
            zone_open_delay: DEFAULT_ZONE_OPEN_DELAY,
            close_delay: DEFAULT_CLOSE_DELAY,
            restore_attributes: FilterState::all(),
            default_hvac_mode: None,
        }
    }
}

impl WindowConfig {
    pub fn sensors(&self) -> impl Iterator<Item = &str> {
        self.room_sensor.iter().chain(self.zone_sensor.iter()).map(String::as_str)
    }

    pub fn is_active(&self) -> bool {
        self.mode == WindowMode::On && self.sensors().next().is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationConfig {
    pub mode: CalibrationMode,

    /// Number entity -> member climate entity.
    pub targets: BTreeMap<String, String>,
    pub humidity_targets: BTreeMap<String, String>,

    /// Forced push interval. `None` disables the heartbeat.
    pub heartbeat: Option<Duration>,

    /// Skip targets whose member is off.
    pub ignore_off: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleConfig {
    pub entity: Option<String>,
}

/// One climate group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig {
    pub key: String,

    /// `climate.<key>`
    pub entity_id: String,
    pub name: String,
    pub members: Vec<String>,
    pub master_entity: Option<String>,
    pub temperature_sensors: Vec<String>,
    pub humidity_sensors: Vec<String>,
    pub hvac_mode_strategy: HvacModeStrategy,
    pub feature_strategy: FeatureStrategy,
    pub expose_member_entities: bool,
    pub temperature: AverageConfig,
    pub humidity: AverageConfig,
    pub calls: CallsConfig,
    pub sync: SyncConfig,
    pub window: WindowConfig,
    pub calibration: CalibrationConfig,
    pub schedule: ScheduleConfig,
}

impl GroupConfig {
    /// A group with default settings, mostly for tests.
    pub fn new(key: &str, members: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            entity_id: format!("climate.{}", key),
            name: key.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
            master_entity: None,
            temperature_sensors: Vec::new(),
            humidity_sensors: Vec::new(),
            hvac_mode_strategy: HvacModeStrategy::default(),
            feature_strategy: FeatureStrategy::default(),
            expose_member_entities: false,
            temperature: AverageConfig::default(),
            humidity: AverageConfig::default(),
            calls: CallsConfig::default(),
            sync: SyncConfig::default(),
            window: WindowConfig::default(),
            calibration: CalibrationConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }

    /// Every entity whose state changes this group reacts to.
    pub fn tracked_entities(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.members
            .iter()
            .chain(self.master_entity.iter())
            .chain(self.temperature_sensors.iter())
            .chain(self.humidity_sensors.iter())
            .chain(self.window.room_sensor.iter())
            .chain(self.window.zone_sensor.iter())
            .chain(self.calibration.targets.keys())
            .chain(self.calibration.humidity_targets.keys())
            .chain(self.schedule.entity.iter())
            .filter(|e| seen.insert(e.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub state: String,
    pub attributes: Attributes,
    pub behaviour: Behaviour,
}

impl DeviceConfig {
    /// Initial state of the simulated device `entity_id`.
    pub fn to_entity_state(&self, entity_id: &str) -> EntityState {
        let mut state = EntityState::new(entity_id, self.state.as_str());
        state.attributes = self.attributes.clone();
        state
    }
}

impl Config {
    /// Load configuration from TOML files with import resolution.
    ///
    /// Returns the config together with any warnings. Merge conflicts and
    /// validation failures are collected and returned together as
    /// [`ConfigError::Invalid`].
    pub fn from_files(paths: &[PathBuf]) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let configs = PartialConfig::load_with_imports(paths)?;
        let (partial, diagnostics) = PartialConfig::merge(configs);
        Self::from_partial(partial, diagnostics)
    }

    /// Convert a merged PartialConfig to a Config, validating all fields
    pub fn from_partial(
        partial: PartialConfig,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let logging = partial
            .logging
            .map(|l| LoggingConfig {
                level: l.level.map(|s| *s.get_ref()).unwrap_or_default(),
                overrides: l
                    .overrides
                    .map(|hm| hm.into_iter().map(|(k, v)| (k, *v.get_ref())).collect())
                    .unwrap_or_default(),
            })
            .unwrap_or_default();

        let mut api = ApiConfig::default();
        if let Some(partial_api) = partial.api {
            api.enabled = partial_api.enabled.unwrap_or(api.enabled);
            api.port = partial_api.port.unwrap_or(api.port);
            if let Some(listen) = partial_api.listen {
                match IpAddr::from_str(&listen) {
                    Ok(addr) => api.listen = addr,
                    Err(e) => diagnostics.push(Diagnostic::validation(
                        "api.listen",
                        format!("'{}' is not an IP address: {}", listen, e),
                    )),
                }
            }
        }

        let persistence = PersistenceConfig {
            state_file: partial.persistence.and_then(|p| p.state_file),
        };

        let mut groups = BTreeMap::new();
        for (key, group) in partial.groups.unwrap_or_default() {
            if let Some(group) = validate_group(&key, group, &mut diagnostics) {
                groups.insert(key, group);
            }
        }
        check_shared_members(&groups, &mut diagnostics);

        let simulation = SimulationConfig {
            devices: partial
                .simulation
                .map(|s| s.devices)
                .unwrap_or_default()
                .into_iter()
                .map(|(entity_id, d)| {
                    (
                        entity_id,
                        DeviceConfig {
                            state: d.state,
                            attributes: d.attributes,
                            behaviour: d.behaviour,
                        },
                    )
                })
                .collect(),
        };

        if diagnostics.iter().any(Diagnostic::is_error) {
            return Err(ConfigError::Invalid {
                rendered: format_diagnostics(&diagnostics),
                diagnostics,
            });
        }

        Ok((
            Config {
                logging,
                api,
                persistence,
                groups,
                simulation,
            },
            diagnostics,
        ))
    }
}

/// Validate one group, pushing every problem found. Returns `None` if any
/// error was found.
fn validate_group(
    key: &str,
    partial: PartialGroupConfig,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<GroupConfig> {
    let errors_before = diagnostics.iter().filter(|d| d.is_error()).count();
    let path = format!("groups.{}", key);

    if partial.members.is_empty() {
        diagnostics.push(Diagnostic::validation(
            format!("{}.members", path),
            "at least one member is required",
        ));
    }
    let mut seen = HashSet::new();
    for member in &partial.members {
        if !seen.insert(member) {
            diagnostics.push(Diagnostic::validation(
                format!("{}.members", path),
                format!("'{}' is listed more than once", member),
            ));
        }
    }

    let calls = validate_calls(&path, partial.calls, diagnostics);
    let sync = validate_sync(&path, partial.sync, diagnostics);
    let window = validate_window(&path, partial.window, diagnostics);
    let calibration = validate_calibration(&path, partial.calibration, diagnostics);

    let errors_after = diagnostics.iter().filter(|d| d.is_error()).count();
    if errors_after > errors_before {
        return None;
    }

    Some(GroupConfig {
        key: key.to_string(),
        entity_id: format!("climate.{}", key),
        name: partial.name.unwrap_or_else(|| key.to_string()),
        members: partial.members,
        master_entity: partial.master_entity,
        temperature_sensors: partial.temperature_sensors,
        humidity_sensors: partial.humidity_sensors,
        hvac_mode_strategy: partial.hvac_mode_strategy,
        feature_strategy: partial.feature_strategy,
        expose_member_entities: partial.expose_member_entities,
        temperature: partial.temperature,
        humidity: partial.humidity,
        calls,
        sync,
        window,
        calibration,
        schedule: ScheduleConfig {
            entity: partial.schedule.entity,
        },
    })
}

fn validate_calls(path: &str, partial: PartialCallsConfig, diagnostics: &mut Vec<Diagnostic>) -> CallsConfig {
    let defaults = CallsConfig::default();
    let tolerance = partial.tolerance.unwrap_or(defaults.tolerance);
    if !(tolerance.is_finite() && tolerance > 0.0) {
        diagnostics.push(Diagnostic::validation(
            format!("{}.calls.tolerance", path),
            format!("must be a positive number, got {}", tolerance),
        ));
    }

    CallsConfig {
        debounce_delay: seconds(path, "calls.debounce_delay", partial.debounce_delay, defaults.debounce_delay, diagnostics),
        retry_attempts: partial.retry_attempts.unwrap_or(defaults.retry_attempts),
        retry_delay: seconds(path, "calls.retry_delay", partial.retry_delay, defaults.retry_delay, diagnostics),
        tolerance,
    }
}

fn validate_sync(path: &str, partial: PartialSyncConfig, diagnostics: &mut Vec<Diagnostic>) -> SyncConfig {
    let defaults = SyncConfig::default();
    SyncConfig {
        mode: partial.mode,
        attributes: attribute_filter(path, "sync.attributes", partial.attributes, diagnostics),
        max_attempts: partial.max_attempts.unwrap_or(defaults.max_attempts),
        capitulation_timeout: seconds(
            path,
            "sync.capitulation_timeout",
            partial.capitulation_timeout,
            defaults.capitulation_timeout,
            diagnostics,
        ),
    }
}

fn validate_window(path: &str, partial: PartialWindowConfig, diagnostics: &mut Vec<Diagnostic>) -> WindowConfig {
    let defaults = WindowConfig::default();
    let window = WindowConfig {
        mode: partial.mode,
        room_sensor: partial.room_sensor,
        zone_sensor: partial.zone_sensor,
        room_open_delay: seconds(path, "window.room_open_delay", partial.room_open_delay, defaults.room_open_delay, diagnostics),
        zone_open_delay: seconds(path, "window.zone_open_delay", partial.zone_open_delay, defaults.zone_open_delay, diagnostics),
        close_delay: seconds(path, "window.close_delay", partial.close_delay, defaults.close_delay, diagnostics),
        restore_attributes: attribute_filter(path, "window.restore_attributes", partial.restore_attributes, diagnostics),
        default_hvac_mode: partial.default_hvac_mode,
    };

    if window.mode == WindowMode::On && !window.is_active() {
        diagnostics.push(Diagnostic::Warning(Warning::Ineffective {
            field_path: format!("{}.window.mode", path),
            message: "window control is on but no sensors are configured".to_string(),
        }));
    }

    window
}

fn validate_calibration(
    path: &str,
    partial: PartialCalibrationConfig,
    diagnostics: &mut Vec<Diagnostic>,
) -> CalibrationConfig {
    let heartbeat = seconds(path, "calibration.heartbeat", partial.heartbeat, Duration::ZERO, diagnostics);
    CalibrationConfig {
        mode: partial.mode,
        targets: partial.targets,
        humidity_targets: partial.humidity_targets,
        heartbeat: (!heartbeat.is_zero()).then_some(heartbeat),
        ignore_off: partial.ignore_off,
    }
}

/// Convert optional seconds to a Duration, rejecting negative and non-finite
/// values.
fn seconds(
    path: &str,
    field: &str,
    value: Option<f64>,
    default: Duration,
    diagnostics: &mut Vec<Diagnostic>,
) -> Duration {
    match value {
        None => default,
        Some(secs) => Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
            diagnostics.push(Diagnostic::validation(
                format!("{}.{}", path, field),
                format!("must be a non-negative number of seconds, got {}", secs),
            ));
            default
        }),
    }
}

fn attribute_filter(
    path: &str,
    field: &str,
    names: Option<Vec<String>>,
    diagnostics: &mut Vec<Diagnostic>,
) -> FilterState {
    let Some(names) = names else {
        return FilterState::all();
    };

    let attrs = names.iter().filter_map(|name| match Attribute::from_str(name) {
        Ok(attr) => Some(attr),
        Err(_) => {
            diagnostics.push(Diagnostic::validation(
                format!("{}.{}", path, field),
                format!("unknown attribute '{}'", name),
            ));
            None
        }
    });
    FilterState::from_attributes(attrs.collect::<Vec<_>>())
}

/// A member may belong to at most one group with enforcement enabled, or two
/// groups would fight over it.
fn check_shared_members(groups: &BTreeMap<String, GroupConfig>, diagnostics: &mut Vec<Diagnostic>) {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    for (key, group) in groups {
        if group.sync.mode == SyncMode::Standard {
            continue;
        }
        for member in &group.members {
            if let Some(other) = owners.insert(member.as_str(), key.as_str()) {
                diagnostics.push(Diagnostic::validation(
                    format!("groups.{}.members", key),
                    format!("'{}' is already synchronised by group '{}'", member, other),
                ));
            }
        }
    }
}
