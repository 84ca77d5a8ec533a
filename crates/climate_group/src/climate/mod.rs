//! Climate group core: aggregation, enforcement, sync, window control,
//! calibration and schedules.

mod aggregate;
mod calibration;
mod debounce;
mod group;
mod reduce;
mod schedule;
mod service_call;
pub mod state;
mod sync_mode;
pub mod types;
mod window;

pub use aggregate::available_states;
pub use aggregate::resolve_hvac_action;
pub use aggregate::resolve_hvac_mode;
pub use aggregate::AggregateInput;
pub use aggregate::Aggregator;
pub use aggregate::GroupAttributes;
pub use aggregate::OPTIMISTIC_GRACE;
pub use calibration::plan_writes;
pub use calibration::CalibrationWrite;
pub use calibration::Readings;
pub use calibration::Trigger;
pub use debounce::Debouncer;
pub use group::ClimateGroup;
pub use group::GroupCommand;
pub use group::GroupError;
pub use group::GroupHandle;
pub use group::GroupSnapshot;
pub use reduce::average;
pub use reduce::reduce_features;
pub use reduce::reduce_modes;
pub use reduce::round_value;
pub use reduce::within_tolerance;
pub use reduce::FLOAT_TOLERANCE;
pub use schedule::Schedule;
pub use service_call::enforce;
pub use service_call::plan_calls;
pub use service_call::CallSettings;
pub use service_call::EnforceOutcome;
pub use service_call::PlannedCall;
pub use service_call::ServiceCallHandler;
pub use state::AttrValue;
pub use state::Attribute;
pub use state::ChangeState;
pub use state::FilterState;
pub use state::Provenance;
pub use state::TargetState;
pub use state::UpdateSource;
pub use sync_mode::Origin;
pub use sync_mode::SyncModeHandler;
pub use sync_mode::SyncOutcome;
pub use types::*;
pub use window::evaluate as evaluate_window;
pub use window::ControlState;
pub use window::Decision;
pub use window::WindowControl;
