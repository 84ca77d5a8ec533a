//! Climate groups: several climate devices presented and controlled as one.
//!
//! See [`climate::ClimateGroup`] for the group actor and [`engine::Engine`]
//! for running groups against a [`engine::Host`].

pub mod api;
pub mod climate;
pub mod config;
pub mod engine;

pub use climate::ClimateGroup;
pub use climate::GroupCommand;
pub use climate::GroupError;
pub use climate::GroupHandle;
pub use climate::GroupSnapshot;
pub use config::format_diagnostics;
pub use config::Config;
pub use config::Diagnostic;
pub use config::LogLevel;
pub use engine::Engine;
pub use engine::State;
