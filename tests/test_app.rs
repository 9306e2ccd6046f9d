mod common;
use common::*;

use dtsu666_emulator::Components;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
meter:
  update_interval: 1
  sample_timeout_ms: 200
mappings:
  power_total: { source: home/grid/power, unit: W }
  voltage_l1: home/grid/voltage
  frequency: home/grid/frequency
"#;

#[tokio::test]
async fn config_mappings_drive_the_engine() -> Result<()> {
    common_setup();

    let config = ConfigWrapper::from_config(Config::from_str(CONFIG)?);
    let store = Factory::healthy_store();
    let engine = RefreshEngine::new(
        Factory::map(),
        Arc::new(store.clone()),
        Arc::new(config.clone()),
        EngineSettings::from_meter(&config.meter()),
    );
    let handle = engine.handle();

    assert_eq!(engine.settings().sample_timeout, Duration::from_millis(200));
    assert_eq!(
        config.source_topics(),
        vec![FREQUENCY_TOPIC, POWER_TOPIC, VOLTAGE_TOPIC]
    );

    engine.force_refresh().await?;
    assert_eq!(handle.read(0x0850, 1)?, vec![1500]);

    // swap the voltage source at runtime
    let mut mappings = config.mappings();
    mappings.insert(Role::VoltageL1, RoleMapping::new("home/backup/voltage"));
    config.set_mappings(mappings)?;

    let report = engine.force_refresh().await?;
    assert_eq!(report.state, HealthState::Failed);
    assert_eq!(report.failing_roles, vec![Role::VoltageL1]);

    store.update("home/backup/voltage", r#"{"value": 228.1}"#)?;
    let report = engine.force_refresh().await?;
    assert_eq!(report.state, HealthState::Serving);
    assert_eq!(handle.read(0x183C, 1)?, vec![2281]);

    // invalid mappings are refused and the previous ones stay
    let mut bad = config.mappings();
    bad.insert(
        Role::Frequency,
        RoleMapping::new(FREQUENCY_TOPIC).with_unit(Unit::Watt),
    );
    assert!(config.set_mappings(bad).is_err());
    assert_eq!(config.mappings().get(Role::Frequency).and_then(|m| m.unit), None);

    Ok(())
}

#[tokio::test]
async fn mqtt_payloads_reach_the_register_image() -> Result<()> {
    common_setup();

    let store = ValueStore::new(Some(Duration::from_secs(60)));
    store.update(POWER_TOPIC, "-2500")?;
    store.update(VOLTAGE_TOPIC, r#"{"state": "231.4"}"#)?;
    store.update(FREQUENCY_TOPIC, "50.02")?;

    let engine = Factory::engine(
        store.clone(),
        SharedMappings::new(Factory::mappings()),
        Factory::settings(),
    );
    let handle = engine.handle();

    engine.force_refresh().await?;
    assert_eq!(handle.read(0x0850, 1)?, vec![(-2500i16) as u16]);
    assert_eq!(handle.read(0x183C, 1)?, vec![2314]);

    store.update(FREQUENCY_TOPIC, "unavailable")?;
    let report = engine.force_refresh().await?;
    assert_eq!(report.failing_roles, vec![Role::Frequency]);

    Ok(())
}

#[tokio::test]
async fn components_start_and_stop() -> Result<()> {
    common_setup();

    let config = ConfigWrapper::from_config(Config::from_str(CONFIG)?);
    let components = Components::new(config, Channels::new())?;
    let handle = components.engine.handle();

    components
        .engine
        .start(Duration::from_millis(50))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // nothing feeds the store, so the meter refuses to serve
    let status = handle.status()?;
    assert_eq!(status.health, HealthState::Failed);
    assert_eq!(status.mapped_roles, 3);
    assert_eq!(status.sequence, 0);

    components.stop().await;
    assert_eq!(handle.status(), Err(MeterError::EngineStopped));

    Ok(())
}

#[tokio::test]
async fn run_exits_after_runtime_limit() -> Result<()> {
    common_setup();

    let config = ConfigWrapper::from_config(Config::from_str(CONFIG)?);

    tokio::time::timeout(
        Duration::from_secs(5),
        dtsu666_emulator::run(config, Some(Duration::from_millis(100))),
    )
    .await??;

    Ok(())
}
