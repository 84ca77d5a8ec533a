mod config;
mod diagnostics;
mod partial;

pub use config::*;
pub use diagnostics::format_diagnostics;
pub use diagnostics::ConfigError;
pub use diagnostics::Diagnostic;
pub use diagnostics::LoadError;
