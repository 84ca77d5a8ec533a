mod common;

use std::time::Duration;

use climate_group::climate::AttrValue;
use climate_group::climate::Attribute;
use climate_group::climate::HvacMode;
use climate_group::climate::SyncMode;
use climate_group::climate::UpdateSource;
use climate_group::config::GroupConfig;
use climate_group::engine::Behaviour;
use climate_group::engine::Service;
use climate_group::GroupCommand;
use common::host_with;
use common::thermostat;
use common::Harness;

fn group(mode: SyncMode) -> GroupConfig {
    let mut config = GroupConfig::new("living", &["climate.a", "climate.b"]);
    config.sync.mode = mode;
    config.sync.max_attempts = 2;
    config
}

async fn start(mode: SyncMode, a: Behaviour) -> Harness {
    let host = host_with(&[
        (thermostat("climate.a", "heat", 20.0), a),
        (thermostat("climate.b", "heat", 20.0), Behaviour::Responsive),
    ]);
    Harness::start(host, vec![group(mode)]).await
}

#[tokio::test(start_paused = true)]
async fn test_standard_ignores_manual_change() {
    let harness = start(SyncMode::Standard, Behaviour::Responsive).await;

    harness.host.set_state(thermostat("climate.a", "off", 20.0), None);
    harness.settle().await;

    assert_eq!(harness.state("climate.a").state, "off");
    assert!(harness.host.calls().is_empty());
    assert_eq!(
        harness.group("living").snapshot().target.hvac_mode(),
        Some(HvacMode::Heat)
    );

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lock_reverts_manual_change() {
    let harness = start(SyncMode::Lock, Behaviour::Responsive).await;

    harness.host.set_state(thermostat("climate.a", "off", 20.0), None);
    harness.settle().await;

    assert_eq!(harness.state("climate.a").state, "heat");
    let calls = harness.calls_of(Service::SetHvacMode);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].entity_ids, vec!["climate.a"]);
    assert_eq!(
        harness.group("living").snapshot().target.hvac_mode(),
        Some(HvacMode::Heat)
    );

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_mirror_propagates_fan_mode() {
    let harness = start(SyncMode::Mirror, Behaviour::Responsive).await;

    harness.host.set_state(
        thermostat("climate.b", "heat", 20.0).with_attribute("fan_mode", "high"),
        None,
    );
    harness.settle().await;

    let snapshot = harness.group("living").snapshot();
    assert_eq!(
        snapshot.target.get(Attribute::FanMode),
        Some(AttrValue::Text("high".into()))
    );
    assert_eq!(snapshot.target.last_updated_by_source(), Some(UpdateSource::Sync));
    assert_eq!(snapshot.target.last_updated_by_entity(), Some("climate.b"));

    assert_eq!(harness.state("climate.a").attr_str("fan_mode"), Some("high"));
    let calls = harness.calls_of(Service::SetFanMode);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].entity_ids, vec!["climate.a"]);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_own_command_is_not_enforced_twice() {
    let harness = start(SyncMode::Mirror, Behaviour::Responsive).await;

    harness
        .engine
        .command("living", GroupCommand::SetTemperature {
            temperature: Some(22.0),
            target_temp_low: None,
            target_temp_high: None,
            hvac_mode: None,
        })
        .await
        .unwrap();
    harness.settle().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let calls = harness.calls_of(Service::SetTemperature);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].entity_ids, vec!["climate.a", "climate.b"]);
    assert_eq!(harness.state("climate.a").attr_f64("temperature"), Ok(Some(22.0)));
    assert_eq!(harness.state("climate.b").attr_f64("temperature"), Ok(Some(22.0)));
    assert_eq!(harness.host.calls().len(), 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lock_capitulates_to_stubborn_member() {
    let harness = start(SyncMode::Lock, Behaviour::Stubborn).await;

    // The device ignores the revert and is changed by hand once more.
    harness.host.set_state(thermostat("climate.a", "off", 18.0), None);
    harness.settle().await;

    let snapshot = harness.group("living").snapshot();
    assert_eq!(snapshot.target.hvac_mode(), Some(HvacMode::Heat));
    assert!(snapshot.sync_snapshot_active);

    harness.host.set_state(thermostat("climate.a", "off", 18.5), None);
    harness.settle().await;

    let snapshot = harness.group("living").snapshot();
    assert_eq!(snapshot.target.hvac_mode(), Some(HvacMode::Off));
    assert_eq!(
        snapshot.target.get(Attribute::Temperature),
        Some(AttrValue::Number(18.5))
    );
    assert_eq!(snapshot.target.last_updated_by_source(), Some(UpdateSource::Capitulation));
    assert_eq!(snapshot.target.last_updated_by_entity(), Some("climate.a"));
    assert!(!snapshot.sync_snapshot_active);
    assert_eq!(harness.calls_of(Service::SetHvacMode).len(), 2);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lock_capitulates_after_timeout_without_further_events() {
    let harness = start(SyncMode::Lock, Behaviour::Stubborn).await;

    harness.host.set_state(thermostat("climate.a", "off", 20.0), None);
    harness.settle().await;

    let snapshot = harness.group("living").snapshot();
    assert_eq!(snapshot.target.hvac_mode(), Some(HvacMode::Heat));
    assert!(snapshot.sync_snapshot_active);

    tokio::time::sleep(Duration::from_secs(61)).await;

    let snapshot = harness.group("living").snapshot();
    assert_eq!(snapshot.target.hvac_mode(), Some(HvacMode::Off));
    assert_eq!(snapshot.target.last_updated_by_source(), Some(UpdateSource::Capitulation));
    assert_eq!(snapshot.target.last_updated_by_entity(), Some("climate.a"));
    assert!(!snapshot.sync_snapshot_active);
    assert_eq!(harness.state("climate.a").state, "off");
    assert_eq!(harness.calls_of(Service::SetHvacMode).len(), 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lock_capitulates_when_revert_fails() {
    let host = host_with(&[
        (thermostat("climate.a", "heat", 20.0), Behaviour::Stubborn),
        (thermostat("climate.b", "heat", 20.0), Behaviour::Responsive),
    ]);
    let mut config = group(SyncMode::Lock);
    config.sync.max_attempts = 1;
    let harness = Harness::start(host, vec![config]).await;

    harness.host.set_state(thermostat("climate.a", "cool", 20.0), None);
    harness.settle().await;

    let snapshot = harness.group("living").snapshot();
    assert_eq!(snapshot.target.hvac_mode(), Some(HvacMode::Cool));
    assert_eq!(snapshot.target.last_updated_by_source(), Some(UpdateSource::Capitulation));
    assert!(!snapshot.sync_snapshot_active);
    assert_eq!(harness.calls_of(Service::SetHvacMode).len(), 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lock_reverts_second_member_while_first_resists() {
    let harness = start(SyncMode::Lock, Behaviour::Stubborn).await;

    harness.host.set_state(thermostat("climate.a", "off", 20.0), None);
    harness.settle().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    harness.host.set_state(thermostat("climate.b", "heat", 25.0), None);
    harness.settle().await;

    assert_eq!(harness.state("climate.b").attr_f64("temperature"), Ok(Some(20.0)));
    let calls = harness.calls_of(Service::SetTemperature);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].entity_ids, vec!["climate.b"]);

    let target = harness.group("living").snapshot().target.clone();
    assert_eq!(target.hvac_mode(), Some(HvacMode::Heat));
    assert_eq!(target.get(Attribute::Temperature), Some(AttrValue::Number(20.0)));
    assert_ne!(target.last_updated_by_source(), Some(UpdateSource::Capitulation));

    // Only the deviation of climate.a is accepted once its timeout passes.
    tokio::time::sleep(Duration::from_secs(51)).await;

    let target = harness.group("living").snapshot().target.clone();
    assert_eq!(target.hvac_mode(), Some(HvacMode::Off));
    assert_eq!(target.get(Attribute::Temperature), Some(AttrValue::Number(20.0)));
    assert_eq!(target.last_updated_by_source(), Some(UpdateSource::Capitulation));
    assert_eq!(target.last_updated_by_entity(), Some("climate.a"));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_enforcement_gives_up() {
    let host = host_with(&[
        (thermostat("climate.a", "heat", 20.0), Behaviour::Stubborn),
        (thermostat("climate.b", "heat", 20.0), Behaviour::Responsive),
    ]);
    let mut config = group(SyncMode::Lock);
    config.calls.retry_attempts = 2;
    config.calls.retry_delay = Duration::from_secs(1);
    let harness = Harness::start(host, vec![config]).await;

    let start = tokio::time::Instant::now();
    harness
        .engine
        .command("living", GroupCommand::SetTemperature {
            temperature: Some(25.0),
            target_temp_low: None,
            target_temp_high: None,
            hvac_mode: None,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let calls = harness.calls_of(Service::SetTemperature);
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].entity_ids, vec!["climate.a", "climate.b"]);
    assert_eq!(calls[1].entity_ids, vec!["climate.a"]);
    assert_eq!(calls[2].entity_ids, vec!["climate.a"]);
    assert!(calls.iter().all(|c| c.context == calls[0].context));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.calls_of(Service::SetTemperature).len(), 3);
    assert!(start.elapsed() >= Duration::from_secs(65));

    harness.stop().await;
}
