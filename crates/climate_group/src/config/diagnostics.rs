use std::collections::BTreeMap;
use std::ops::Range;
use std::path::PathBuf;

/// Source information for where a diagnostic came from
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub file_path: PathBuf,
    pub content: String,
}

/// A diagnostic message that can be either a warning or an error
#[derive(Debug, Clone)]
pub enum Diagnostic {
    Warning(Warning),
    Error(Error),
}

/// Warning messages that don't prevent config loading
#[derive(Debug, Clone)]
pub enum Warning {
    EmptyConfig { file_path: PathBuf },

    /// A group field that is set but has no effect.
    Ineffective { field_path: String, message: String },
}

/// Error messages that indicate problems with the config
#[derive(Debug, Clone)]
pub enum Error {
    Merge(MergeError),
    Validation(ValidationError),
}

/// Error type for merge conflicts
#[derive(Debug, Clone)]
pub struct MergeError {
    pub field_path: String,
    pub message: String,
    pub conflicts: Vec<MergeConflictLocation>,
}

#[derive(Debug, Clone)]
pub struct MergeConflictLocation {
    pub file_path: PathBuf,
    pub span: Range<usize>,
    pub content: String,
}

/// Error type for validation failures
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field_path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            message: message.into(),
        }
    }
}

/// Error type for config loading failures (parse errors, IO errors, etc.)
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read '{}': {error}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Failed to parse '{}': {error}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        error: toml::de::Error,
    },

    #[error("Import cycle detected at '{}': involves {} file(s)", path.display(), cycle.len())]
    ImportCycle { path: PathBuf, cycle: Vec<PathBuf> },
}

/// Loading failed, or loading succeeded with error diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("{rendered}")]
    Invalid {
        diagnostics: Vec<Diagnostic>,
        rendered: String,
    },
}

impl Diagnostic {
    /// Returns true if this diagnostic is an error
    pub fn is_error(&self) -> bool {
        matches!(self, Diagnostic::Error(_))
    }

    /// Returns true if this diagnostic is a warning
    pub fn is_warning(&self) -> bool {
        matches!(self, Diagnostic::Warning(_))
    }

    pub(super) fn validation(field_path: impl Into<String>, message: impl Into<String>) -> Self {
        Diagnostic::Error(Error::Validation(ValidationError::new(field_path, message)))
    }
}

/// Render every diagnostic, one block per diagnostic. Merge conflicts are
/// drawn with ariadne against the files involved; everything else is a single
/// line.
pub fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    let mut out = Vec::new();
    for diagnostic in diagnostics {
        let line = match diagnostic {
            Diagnostic::Warning(Warning::EmptyConfig { file_path }) => format!(
                "Warning: Config file '{}' is empty and has no effect",
                file_path.display()
            ),
            Diagnostic::Warning(Warning::Ineffective {
                field_path,
                message,
            }) => format!("Warning: '{}': {}", field_path, message),
            Diagnostic::Error(Error::Validation(e)) => {
                format!("Validation error in '{}': {}", e.field_path, e.message)
            }
            Diagnostic::Error(Error::Merge(e)) => {
                render_merge(e, &mut out);
                continue;
            }
        };
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn render_merge(error: &MergeError, out: &mut Vec<u8>) {
    use ariadne::Color;
    use ariadne::Label;
    use ariadne::Report;
    use ariadne::ReportKind;

    let source_id = |c: &MergeConflictLocation| c.file_path.to_string_lossy().into_owned();

    let Some(first) = error.conflicts.first() else {
        return;
    };

    let labels = error.conflicts.iter().enumerate().map(|(i, c)| {
        let (message, color) = match i {
            0 => ("first definition here", Color::Red),
            _ => ("conflicts with this definition", Color::Yellow),
        };
        Label::new((source_id(c), c.span.clone()))
            .with_message(message)
            .with_color(color)
    });

    // One cache holding every file the report points into.
    let files: BTreeMap<String, String> = error
        .conflicts
        .iter()
        .map(|c| (source_id(c), c.content.clone()))
        .collect();

    let report = Report::build(ReportKind::Error, (source_id(first), first.span.clone()))
        .with_config(ariadne::Config::default().with_color(false))
        .with_message(format!("Merge conflict in field '{}'", error.field_path))
        .with_note(&error.message)
        .with_labels(labels)
        .finish();

    if let Err(e) = report.write(ariadne::sources(files), &mut *out) {
        tracing::warn!("Failed to render merge conflict: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_validation_and_warnings() {
        let diagnostics = vec![
            Diagnostic::Warning(Warning::EmptyConfig {
                file_path: PathBuf::from("empty.toml"),
            }),
            Diagnostic::validation("groups.living.members", "at least one member is required"),
            Diagnostic::Warning(Warning::Ineffective {
                field_path: "groups.living.window.mode".into(),
                message: "window control is on but no sensors are configured".into(),
            }),
        ];

        insta::assert_snapshot!(format_diagnostics(&diagnostics), @r"
        Warning: Config file 'empty.toml' is empty and has no effect
        Validation error in 'groups.living.members': at least one member is required
        Warning: 'groups.living.window.mode': window control is on but no sensors are configured
        ");
    }

    #[test]
    fn test_format_merge_conflict_mentions_both_files() {
        let a = "[logging]\nlevel = \"info\"\n".to_string();
        let b = "[logging]\nlevel = \"debug\"\n".to_string();
        let diagnostics = vec![Diagnostic::Error(Error::Merge(MergeError {
            field_path: "logging.level".into(),
            message: "Logging level defined in multiple config files".into(),
            conflicts: vec![
                MergeConflictLocation {
                    file_path: PathBuf::from("a.toml"),
                    span: 18..24,
                    content: a,
                },
                MergeConflictLocation {
                    file_path: PathBuf::from("b.toml"),
                    span: 18..25,
                    content: b,
                },
            ],
        }))];

        let out = format_diagnostics(&diagnostics);
        assert!(out.contains("Merge conflict in field 'logging.level'"));
        assert!(out.contains("a.toml"));
        assert!(out.contains("b.toml"));
        assert!(out.contains("first definition here"));
    }
}
