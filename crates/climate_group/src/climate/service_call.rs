//! Enforcement: turning a target state into batched setter calls and
//! retrying until members agree.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use super::aggregate::available_states;
use super::debounce::Debouncer;
use super::state::AttrValue;
use super::state::Attribute;
use super::state::FilterState;
use super::state::TargetState;
use super::types::Features;
use super::types::HvacMode;
use crate::config::CallsConfig;
use crate::engine::Attributes;
use crate::engine::CorrelationId;
use crate::engine::EntityState;
use crate::engine::GroupMessage;
use crate::engine::Host;
use crate::engine::Service;
use crate::engine::ServiceCall;

#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub tolerance: f64,
}

impl From<&CallsConfig> for CallSettings {
    fn from(config: &CallsConfig) -> Self {
        Self {
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay,
            tolerance: config.tolerance,
        }
    }
}

/// One setter call, batched over every member that needs it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCall {
    pub service: Service,
    pub entity_ids: Vec<String>,
    pub data: Attributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforceOutcome {
    Converged,
    GaveUp,
}

fn member_features(member: &EntityState) -> Features {
    Features::of(member).unwrap_or_default()
}

fn supports(member: &EntityState, attr: Attribute, value: &AttrValue) -> bool {
    let in_list = |key: &str| member.attr_list(key).iter().any(|m| *m == value.to_string());
    match attr {
        Attribute::HvacMode => in_list("hvac_modes"),
        Attribute::FanMode => in_list("fan_modes"),
        Attribute::PresetMode => in_list("preset_modes"),
        Attribute::SwingMode => in_list("swing_modes"),
        Attribute::SwingHorizontalMode => in_list("swing_horizontal_modes"),
        Attribute::Temperature => member_features(member).contains(Features::TARGET_TEMPERATURE),
        Attribute::TargetTempLow | Attribute::TargetTempHigh => {
            member_features(member).contains(Features::TARGET_TEMPERATURE_RANGE)
        }
        Attribute::Humidity => member_features(member).contains(Features::TARGET_HUMIDITY),
    }
}

/// A missing value counts as out of sync.
fn out_of_sync(member: &EntityState, attr: Attribute, value: &AttrValue, tolerance: f64) -> bool {
    attr.read(member)
        .is_none_or(|current| !current.matches(value, tolerance))
}

fn service_for(attr: Attribute) -> Service {
    match attr {
        Attribute::HvacMode => Service::SetHvacMode,
        Attribute::Temperature | Attribute::TargetTempLow | Attribute::TargetTempHigh => {
            Service::SetTemperature
        }
        Attribute::Humidity => Service::SetHumidity,
        Attribute::FanMode => Service::SetFanMode,
        Attribute::PresetMode => Service::SetPresetMode,
        Attribute::SwingMode => Service::SetSwingMode,
        Attribute::SwingHorizontalMode => Service::SetSwingHorizontalMode,
    }
}

fn plan_single(
    members: &[EntityState],
    attr: Attribute,
    value: &AttrValue,
    tolerance: f64,
) -> Option<PlannedCall> {
    let entity_ids: Vec<String> = members
        .iter()
        .filter(|m| supports(m, attr, value) && out_of_sync(m, attr, value, tolerance))
        .map(|m| m.entity_id.clone())
        .collect();
    if entity_ids.is_empty() {
        return None;
    }

    let mut data = Attributes::new();
    data.insert(attr.key().to_string(), value.to_json());
    Some(PlannedCall {
        service: service_for(attr),
        entity_ids,
        data,
    })
}

/// Calls needed to bring `members` to `target`, restricted to `filter`.
///
/// While the target mode is off only the mode call is planned.
pub fn plan_calls(
    target: &TargetState,
    filter: &FilterState,
    members: &[EntityState],
    tolerance: f64,
) -> Vec<PlannedCall> {
    let wanted = target.to_filtered_map(filter);
    let mut calls = Vec::new();

    if let Some(mode) = wanted.get(&Attribute::HvacMode) {
        calls.extend(plan_single(members, Attribute::HvacMode, mode, tolerance));
    }
    if target.hvac_mode() == Some(HvacMode::Off) {
        return calls;
    }

    if let Some(value) = wanted.get(&Attribute::Temperature) {
        calls.extend(plan_single(members, Attribute::Temperature, value, tolerance));
    }

    // The range is only ever sent as a pair.
    if let (Some(low), Some(high)) = (
        target.get(Attribute::TargetTempLow),
        target.get(Attribute::TargetTempHigh),
    ) {
        if filter.allows(Attribute::TargetTempLow) || filter.allows(Attribute::TargetTempHigh) {
            let entity_ids: Vec<String> = members
                .iter()
                .filter(|m| supports(m, Attribute::TargetTempLow, &low))
                .filter(|m| {
                    out_of_sync(m, Attribute::TargetTempLow, &low, tolerance)
                        || out_of_sync(m, Attribute::TargetTempHigh, &high, tolerance)
                })
                .map(|m| m.entity_id.clone())
                .collect();
            if !entity_ids.is_empty() {
                let mut data = Attributes::new();
                data.insert(Attribute::TargetTempLow.key().to_string(), low.to_json());
                data.insert(Attribute::TargetTempHigh.key().to_string(), high.to_json());
                calls.push(PlannedCall {
                    service: Service::SetTemperature,
                    entity_ids,
                    data,
                });
            }
        }
    }

    for attr in [
        Attribute::Humidity,
        Attribute::FanMode,
        Attribute::PresetMode,
        Attribute::SwingMode,
        Attribute::SwingHorizontalMode,
    ] {
        if let Some(value) = wanted.get(&attr) {
            calls.extend(plan_single(members, attr, value, tolerance));
        }
    }

    calls
}

/// Issue calls until members match `target` or attempts run out.
///
/// Call failures are logged and retried; running out of attempts is not an
/// error.
pub async fn enforce(
    host: &dyn Host,
    label: &str,
    members: &[String],
    target: &TargetState,
    filter: FilterState,
    settings: &CallSettings,
    context: CorrelationId,
) -> EnforceOutcome {
    let attempts = settings.retry_attempts + 1;

    for attempt in 1..=attempts {
        let (states, _) = available_states(host, members);
        let calls = plan_calls(target, &filter, &states, settings.tolerance);
        if calls.is_empty() {
            debug!("[{}] Members match target", label);
            return EnforceOutcome::Converged;
        }

        debug!(
            "[{}] Enforcing {} (attempt {}/{}, {} call(s))",
            label,
            target,
            attempt,
            attempts,
            calls.len()
        );

        for call in calls {
            let call = ServiceCall::climate(call.service, call.entity_ids, call.data, context);
            if let Err(e) = host.call_service(call).await {
                warn!("[{}] Service call failed: {}", label, e);
            }
        }

        if attempt < attempts {
            tokio::time::sleep(settings.retry_delay).await;
        }
    }

    let (states, _) = available_states(host, members);
    if plan_calls(target, &filter, &states, settings.tolerance).is_empty() {
        EnforceOutcome::Converged
    } else {
        debug!("[{}] Giving up after {} attempt(s)", label, attempts);
        EnforceOutcome::GaveUp
    }
}

/// Debounced enforcement for one group.
pub struct ServiceCallHandler {
    label: String,
    host: Arc<dyn Host>,
    members: Arc<[String]>,
    settings: CallSettings,
    debouncer: Debouncer,
    pending_filter: FilterState,
    reporter: Option<mpsc::Sender<GroupMessage>>,
}

impl ServiceCallHandler {
    pub fn new(
        label: &str,
        host: Arc<dyn Host>,
        members: &[String],
        settings: CallSettings,
        debounce_delay: Duration,
    ) -> Self {
        Self {
            label: label.to_string(),
            host,
            members: members.into(),
            settings,
            debouncer: Debouncer::new(debounce_delay),
            pending_filter: FilterState::none(),
            reporter: None,
        }
    }

    /// Send `GroupMessage::EnforcementDone` to `tx` whenever a run finishes.
    /// Cancelled runs report nothing.
    pub fn with_reporter(mut self, tx: mpsc::Sender<GroupMessage>) -> Self {
        self.reporter = Some(tx);
        self
    }

    /// Schedule enforcement of `target`. Replaces a pending run; filters of
    /// replaced runs are kept.
    pub fn call_debounced(&mut self, target: TargetState, filter: FilterState, context: CorrelationId) {
        self.pending_filter = if self.debouncer.is_pending() {
            self.pending_filter.union(filter)
        } else {
            filter
        };

        let host = self.host.clone();
        let members = self.members.clone();
        let settings = self.settings.clone();
        let label = self.label.clone();
        let filter = self.pending_filter;
        let reporter = self.reporter.clone();

        self.debouncer.call(async move {
            let outcome = enforce(&*host, &label, &members, &target, filter, &settings, context).await;
            if let Some(tx) = reporter {
                let _ = tx.send(GroupMessage::EnforcementDone { context, outcome }).await;
            }
        });
    }

    /// Abort pending and running enforcement.
    pub fn cancel(&mut self) -> bool {
        let cancelled = self.debouncer.cancel();
        if cancelled {
            debug!("[{}] Cancelled enforcement", self.label);
        }
        self.pending_filter = FilterState::none();
        cancelled
    }
}
