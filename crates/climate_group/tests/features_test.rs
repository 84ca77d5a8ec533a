mod common;

use std::collections::BTreeMap;

use climate_group::climate::AttrValue;
use climate_group::climate::Attribute;
use climate_group::climate::CalibrationMode;
use climate_group::climate::UpdateSource;
use climate_group::config::GroupConfig;
use climate_group::engine::Behaviour;
use climate_group::engine::EntityState;
use climate_group::engine::Service;
use climate_group::GroupCommand;
use common::host_with;
use common::thermostat;
use common::Harness;

#[tokio::test(start_paused = true)]
async fn test_calibration_follows_external_sensor() {
    let host = host_with(&[
        (thermostat("climate.a", "heat", 20.0), Behaviour::Responsive),
        (EntityState::new("sensor.living_temperature", "20.0"), Behaviour::Responsive),
        (EntityState::new("number.a_external", "0"), Behaviour::Responsive),
    ]);
    let mut config = GroupConfig::new("living", &["climate.a"]);
    config.temperature_sensors = vec!["sensor.living_temperature".to_string()];
    config.calibration.mode = CalibrationMode::Absolute;
    config.calibration.targets = BTreeMap::from([("number.a_external".to_string(), "climate.a".to_string())]);
    let harness = Harness::start(host, vec![config]).await;

    assert_eq!(harness.state("number.a_external").state_f64(), Ok(20.0));
    assert_eq!(
        harness.group("living").snapshot().attributes.current_temperature,
        Some(20.0)
    );

    harness
        .host
        .set_state(EntityState::new("sensor.living_temperature", "21.34"), None);
    harness.settle().await;
    assert_eq!(harness.state("number.a_external").state_f64(), Ok(21.3));

    // Within tolerance: no write.
    harness
        .host
        .set_state(EntityState::new("sensor.living_temperature", "21.32"), None);
    harness.settle().await;
    assert_eq!(harness.calls_of(Service::SetValue).len(), 2);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_schedule_drives_target() {
    let host = host_with(&[
        (thermostat("climate.a", "heat", 20.0), Behaviour::Responsive),
        (thermostat("climate.b", "heat", 20.0), Behaviour::Responsive),
        (
            EntityState::new("schedule.heating", "on").with_attribute("temperature", 19.0),
            Behaviour::Responsive,
        ),
    ]);
    let mut config = GroupConfig::new("living", &["climate.a", "climate.b"]);
    config.schedule.entity = Some("schedule.heating".to_string());
    let harness = Harness::start(host, vec![config]).await;
    let group = harness.group("living");

    let target = group.snapshot().target.clone();
    assert_eq!(target.get(Attribute::Temperature), Some(AttrValue::Number(19.0)));
    assert_eq!(target.last_updated_by_source(), Some(UpdateSource::Schedule));
    assert_eq!(target.last_updated_by_entity(), Some("schedule.heating"));
    assert_eq!(harness.state("climate.b").attr_f64("temperature"), Ok(Some(19.0)));

    harness.host.set_state(
        EntityState::new("schedule.heating", "on").with_attribute("temperature", 22.0),
        None,
    );
    harness.settle().await;
    assert_eq!(harness.state("climate.a").attr_f64("temperature"), Ok(Some(22.0)));

    group
        .command(GroupCommand::SetScheduleEntity { entity: None })
        .await
        .unwrap();
    harness.host.set_state(
        EntityState::new("schedule.heating", "on").with_attribute("temperature", 16.0),
        None,
    );
    harness.settle().await;
    assert_eq!(harness.state("climate.a").attr_f64("temperature"), Ok(Some(22.0)));
    assert_eq!(group.snapshot().schedule_entity, None);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_master_target_temperature() {
    let host = host_with(&[
        (thermostat("climate.a", "heat", 22.0), Behaviour::Responsive),
        (thermostat("climate.b", "heat", 20.0), Behaviour::Responsive),
    ]);
    let mut config = GroupConfig::new("living", &["climate.a", "climate.b"]);
    config.master_entity = Some("climate.a".to_string());
    config.temperature.use_master = true;
    let harness = Harness::start(host, vec![config]).await;

    assert_eq!(harness.group("living").snapshot().attributes.temperature, Some(22.0));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_turn_off_and_on_again() {
    let host = host_with(&[
        (thermostat("climate.a", "cool", 24.0), Behaviour::Responsive),
        (thermostat("climate.b", "cool", 24.0), Behaviour::Responsive),
    ]);
    let harness = Harness::start(host, vec![GroupConfig::new("living", &["climate.a", "climate.b"])]).await;

    harness.engine.command("living", GroupCommand::TurnOff).await.unwrap();
    harness.settle().await;
    assert_eq!(harness.state("climate.a").state, "off");

    harness.engine.command("living", GroupCommand::TurnOn).await.unwrap();
    harness.settle().await;
    assert_eq!(harness.state("climate.a").state, "cool");
    assert_eq!(harness.state("climate.b").state, "cool");

    harness.stop().await;
}
