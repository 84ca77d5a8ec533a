use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use super::config::AverageConfig;
use super::diagnostics::Diagnostic;
use super::diagnostics::Error;
use super::diagnostics::LoadError;
use super::diagnostics::MergeConflictLocation;
use super::diagnostics::MergeError;
use super::diagnostics::SourceInfo;
use super::diagnostics::Warning;
use super::LogLevel;
use crate::climate::CalibrationMode;
use crate::climate::FeatureStrategy;
use crate::climate::HvacMode;
use crate::climate::HvacModeStrategy;
use crate::climate::SyncMode;
use crate::climate::WindowMode;
use crate::engine::Attributes;
use crate::engine::Behaviour;

#[derive(Debug, Default, Deserialize)]
pub struct PartialConfig {
    #[serde(default)]
    pub imports: Vec<String>,

    pub logging: Option<PartialLoggingConfig>,
    pub api: Option<PartialApiConfig>,
    pub persistence: Option<PartialPersistenceConfig>,
    pub groups: Option<BTreeMap<String, PartialGroupConfig>>,
    pub simulation: Option<PartialSimulationConfig>,

    /// Source information for error reporting (not serialized)
    #[serde(skip)]
    pub source: Option<SourceInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialLoggingConfig {
    pub level: Option<toml::Spanned<LogLevel>>,
    pub overrides: Option<HashMap<String, toml::Spanned<LogLevel>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialApiConfig {
    pub enabled: Option<bool>,
    pub listen: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialPersistenceConfig {
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialGroupConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
    pub master_entity: Option<String>,
    #[serde(default)]
    pub temperature_sensors: Vec<String>,
    #[serde(default)]
    pub humidity_sensors: Vec<String>,
    #[serde(default)]
    pub hvac_mode_strategy: HvacModeStrategy,
    #[serde(default)]
    pub feature_strategy: FeatureStrategy,
    #[serde(default)]
    pub expose_member_entities: bool,
    #[serde(default)]
    pub temperature: AverageConfig,
    #[serde(default)]
    pub humidity: AverageConfig,
    #[serde(default)]
    pub calls: PartialCallsConfig,
    #[serde(default)]
    pub sync: PartialSyncConfig,
    #[serde(default)]
    pub window: PartialWindowConfig,
    #[serde(default)]
    pub calibration: PartialCalibrationConfig,
    #[serde(default)]
    pub schedule: PartialScheduleConfig,
}

/// Durations are given in seconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialCallsConfig {
    pub debounce_delay: Option<f64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay: Option<f64>,
    pub tolerance: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialSyncConfig {
    #[serde(default)]
    pub mode: SyncMode,
    pub attributes: Option<Vec<String>>,
    pub max_attempts: Option<u32>,
    pub capitulation_timeout: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialWindowConfig {
    #[serde(default)]
    pub mode: WindowMode,
    pub room_sensor: Option<String>,
    pub zone_sensor: Option<String>,
    pub room_open_delay: Option<f64>,
    pub zone_open_delay: Option<f64>,
    pub close_delay: Option<f64>,
    pub restore_attributes: Option<Vec<String>>,
    pub default_hvac_mode: Option<HvacMode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialCalibrationConfig {
    #[serde(default)]
    pub mode: CalibrationMode,
    #[serde(default)]
    pub targets: BTreeMap<String, String>,
    #[serde(default)]
    pub humidity_targets: BTreeMap<String, String>,
    pub heartbeat: Option<f64>,
    #[serde(default)]
    pub ignore_off: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialScheduleConfig {
    pub entity: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialSimulationConfig {
    #[serde(default)]
    pub devices: BTreeMap<String, PartialDeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialDeviceConfig {
    pub state: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub behaviour: Behaviour,
}

impl PartialConfig {
    /// Parse one file. Its `imports` are left unresolved.
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|error| LoadError::Io {
            path: path.to_path_buf(),
            error,
        })?;

        let mut config: PartialConfig = toml::from_str(&content).map_err(|error| LoadError::Parse {
            path: path.to_path_buf(),
            error,
        })?;
        config.source = Some(SourceInfo {
            file_path: path.to_path_buf(),
            content,
        });
        Ok(config)
    }

    /// Parse `paths` and everything they import.
    ///
    /// Imports come before the file importing them.
    pub fn load_with_imports(paths: &[PathBuf]) -> Result<Vec<Self>, LoadError> {
        let mut loaded = Vec::new();
        let mut chain = Vec::new();
        for path in paths {
            Self::load_into(path, &mut chain, &mut loaded)?;
        }
        Ok(loaded)
    }

    /// `chain` holds the files currently being imported, outermost first.
    fn load_into(path: &Path, chain: &mut Vec<PathBuf>, loaded: &mut Vec<Self>) -> Result<(), LoadError> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if let Some(pos) = chain.iter().position(|p| *p == key) {
            return Err(LoadError::ImportCycle {
                path: key,
                cycle: chain[pos..].to_vec(),
            });
        }

        let config = Self::from_file(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let imports: Vec<PathBuf> = config.imports.iter().map(|i| base.join(i)).collect();

        chain.push(key);
        for import in &imports {
            Self::load_into(import, chain, loaded)?;
        }
        chain.pop();

        loaded.push(config);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.logging.is_none()
            && self.api.is_none()
            && self.persistence.is_none()
            && self.groups.is_none()
            && self.simulation.is_none()
            && self.imports.is_empty()
    }

    /// Merge multiple partial configs together
    ///
    /// First-wins: the first definition of a field is kept and every later
    /// definition is reported as a conflict. Merging continues after a
    /// conflict so that all of them are reported at once.
    pub fn merge<I>(configs: I) -> (Self, Vec<Diagnostic>)
    where
        I: IntoIterator<Item = Self>,
    {
        let mut merger = Merger::default();
        for config in configs {
            merger.add(config);
        }
        merger.finish()
    }
}

/// First-wins merge state: where each field was first defined.
#[derive(Default)]
struct Merger {
    result: PartialConfig,
    diagnostics: Vec<Diagnostic>,
    seen: HashMap<String, MergeConflictLocation>,
}

impl Merger {
    fn add(&mut self, config: PartialConfig) {
        let source = config.source.clone().unwrap_or_else(|| SourceInfo {
            file_path: PathBuf::from("<unknown>"),
            content: String::new(),
        });

        if config.is_empty() {
            self.diagnostics.push(Diagnostic::Warning(Warning::EmptyConfig {
                file_path: source.file_path.clone(),
            }));
        }

        self.result.imports.extend(config.imports);

        if let Some(logging) = config.logging {
            let result = self.result.logging.get_or_insert_with(Default::default);

            if let Some(level) = logging.level {
                let span = level.span();
                if claim(&mut self.seen, &mut self.diagnostics, "logging.level", "Logging level defined in multiple config files", &source, span) {
                    result.level = Some(level);
                }
            }

            for (key, value) in logging.overrides.unwrap_or_default() {
                let span = value.span();
                let field = format!("logging.overrides.{}", key);
                let message = format!("Logging override for '{}' defined in multiple config files", key);
                if claim(&mut self.seen, &mut self.diagnostics, &field, &message, &source, span) {
                    result
                        .overrides
                        .get_or_insert_with(HashMap::new)
                        .insert(key, value);
                }
            }
        }

        if let Some(api) = config.api {
            let span = header_span(&source.content, "[api]");
            if claim(&mut self.seen, &mut self.diagnostics, "api", "API section defined in multiple config files", &source, span) {
                self.result.api = Some(api);
            }
        }

        if let Some(persistence) = config.persistence {
            let span = header_span(&source.content, "[persistence]");
            if claim(&mut self.seen, &mut self.diagnostics, "persistence", "Persistence section defined in multiple config files", &source, span) {
                self.result.persistence = Some(persistence);
            }
        }

        for (key, group) in config.groups.unwrap_or_default() {
            let field = format!("groups.{}", key);
            let span = header_span(&source.content, &format!("[{}]", field));
            let message = format!("Group '{}' defined in multiple config files", key);
            if claim(&mut self.seen, &mut self.diagnostics, &field, &message, &source, span) {
                self.result
                    .groups
                    .get_or_insert_with(BTreeMap::new)
                    .insert(key, group);
            }
        }

        if let Some(simulation) = config.simulation {
            let result = self.result.simulation.get_or_insert_with(Default::default);
            for (entity_id, device) in simulation.devices {
                let field = format!("simulation.devices.\"{}\"", entity_id);
                let span = header_span(&source.content, &entity_id);
                let message = format!("Simulated device '{}' defined in multiple config files", entity_id);
                if claim(&mut self.seen, &mut self.diagnostics, &field, &message, &source, span) {
                    result.devices.insert(entity_id, device);
                }
            }
        }
    }

    fn finish(self) -> (PartialConfig, Vec<Diagnostic>) {
        (self.result, self.diagnostics)
    }
}

/// Record `field` as defined at `span`. Returns false (and records a
/// conflict) if an earlier file already defined it.
fn claim(
    seen: &mut HashMap<String, MergeConflictLocation>,
    diagnostics: &mut Vec<Diagnostic>,
    field: &str,
    message: &str,
    source: &SourceInfo,
    span: Range<usize>,
) -> bool {
    let location = MergeConflictLocation {
        file_path: source.file_path.clone(),
        span,
        content: source.content.clone(),
    };

    match seen.get(field) {
        Some(prev) => {
            diagnostics.push(Diagnostic::Error(Error::Merge(MergeError {
                field_path: field.to_string(),
                message: message.to_string(),
                conflicts: vec![prev.clone(), location],
            })));
            false
        }
        None => {
            seen.insert(field.to_string(), location);
            true
        }
    }
}

/// Span of the first occurrence of `needle`, or an empty span.
fn header_span(content: &str, needle: &str) -> Range<usize> {
    content
        .find(needle)
        .map(|start| start..(start + needle.len()))
        .unwrap_or(0..0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(path: &str, content: &str) -> PartialConfig {
        let mut config: PartialConfig = toml::from_str(content).unwrap();
        config.source = Some(SourceInfo {
            file_path: PathBuf::from(path),
            content: content.to_string(),
        });
        config
    }

    #[test]
    fn test_merge_first_wins() {
        let a = parse(
            "a.toml",
            r#"
[groups.living]
members = ["climate.a"]
"#,
        );
        let b = parse(
            "b.toml",
            r#"
[groups.living]
members = ["climate.b"]

[groups.office]
members = ["climate.c"]
"#,
        );

        let (merged, diagnostics) = PartialConfig::merge([a, b]);
        let groups = merged.groups.unwrap();
        assert_eq!(groups["living"].members, vec!["climate.a"]);
        assert_eq!(groups["office"].members, vec!["climate.c"]);

        assert_eq!(diagnostics.len(), 1);
        let Diagnostic::Error(Error::Merge(err)) = &diagnostics[0] else {
            panic!("expected merge error");
        };
        assert_eq!(err.field_path, "groups.living");
        assert_eq!(err.conflicts[0].file_path, PathBuf::from("a.toml"));
        assert_eq!(err.conflicts[1].file_path, PathBuf::from("b.toml"));
    }

    #[test]
    fn test_unknown_enum_value_is_parse_error() {
        let result: Result<PartialConfig, _> = toml::from_str(
            r#"
[groups.living]
members = ["climate.a"]
hvac_mode_strategy = "sometimes"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_simulation_attributes_parse_as_json() {
        let config = parse(
            "sim.toml",
            r#"
[simulation.devices."climate.a"]
state = "heat"
behaviour = "stubborn"
attributes = { temperature = 21.0, hvac_modes = ["off", "heat"] }
"#,
        );
        let device = &config.simulation.unwrap().devices["climate.a"];
        assert_eq!(device.behaviour, Behaviour::Stubborn);
        assert_eq!(device.attributes["temperature"], serde_json::json!(21.0));
        assert_eq!(device.attributes["hvac_modes"], serde_json::json!(["off", "heat"]));
    }
}
