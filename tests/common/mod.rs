#![allow(dead_code)]

pub use dtsu666_emulator::prelude::*;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const POWER_TOPIC: &str = "home/grid/power";
pub const VOLTAGE_TOPIC: &str = "home/grid/voltage";
pub const FREQUENCY_TOPIC: &str = "home/grid/frequency";

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Wraps a `ValueStore` and lets tests make individual sources hang or error.
#[derive(Clone, Default)]
pub struct ScriptedResolver {
    pub store: ValueStore,
    hung: Arc<Mutex<HashSet<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl ScriptedResolver {
    pub fn new(store: ValueStore) -> Self {
        Self {
            store,
            ..Default::default()
        }
    }

    pub fn hang(&self, source_id: &str) {
        self.hung.lock().unwrap().insert(source_id.to_string());
    }

    pub fn fail(&self, source_id: &str) {
        self.failing.lock().unwrap().insert(source_id.to_string());
    }

    pub fn heal(&self, source_id: &str) {
        self.hung.lock().unwrap().remove(source_id);
        self.failing.lock().unwrap().remove(source_id);
    }
}

#[async_trait]
impl MeasurementResolver for ScriptedResolver {
    async fn sample(&self, source_id: &str) -> Result<MeasurementSample> {
        if self.hung.lock().unwrap().contains(source_id) {
            futures::future::pending::<()>().await;
        }
        if self.failing.lock().unwrap().contains(source_id) {
            bail!("{} exploded", source_id);
        }
        self.store.sample(source_id).await
    }
}

pub struct Factory;

impl Factory {
    pub fn map() -> Arc<RegisterMap> {
        Arc::new(RegisterMap::dtsu666().unwrap())
    }

    pub fn settings() -> EngineSettings {
        EngineSettings {
            interval: Duration::from_millis(100),
            sample_timeout: Duration::from_millis(50),
            failure_threshold: 1,
            derive_missing: false,
        }
    }

    /// power in W, voltage and frequency in the register's own units
    pub fn mappings() -> RoleMappings {
        RoleMappings::new()
            .with(
                Role::PowerTotal,
                RoleMapping::new(POWER_TOPIC).with_unit(Unit::Watt),
            )
            .with(Role::VoltageL1, RoleMapping::new(VOLTAGE_TOPIC))
            .with(Role::Frequency, RoleMapping::new(FREQUENCY_TOPIC))
    }

    /// power=1500 W, voltage=231.4 V, frequency=50.02 Hz
    pub fn healthy_store() -> ValueStore {
        let store = ValueStore::default();
        store.set(POWER_TOPIC, MeasurementSample::Valid(1500.0)).unwrap();
        store.set(VOLTAGE_TOPIC, MeasurementSample::Valid(231.4)).unwrap();
        store.set(FREQUENCY_TOPIC, MeasurementSample::Valid(50.02)).unwrap();
        store
    }

    pub fn engine(
        resolver: impl MeasurementResolver + 'static,
        mappings: SharedMappings,
        settings: EngineSettings,
    ) -> RefreshEngine {
        RefreshEngine::new(Self::map(), Arc::new(resolver), Arc::new(mappings), settings)
    }

    /// Engine over `healthy_store()` and `mappings()`.
    pub fn healthy_engine() -> (RefreshEngine, ValueStore, SharedMappings) {
        let store = Self::healthy_store();
        let mappings = SharedMappings::new(Self::mappings());
        let engine = Self::engine(store.clone(), mappings.clone(), Self::settings());
        (engine, store, mappings)
    }

    pub fn encoded_default(role: Role) -> Vec<u16> {
        let map = Self::map();
        let descriptor = map.descriptor(role).unwrap();
        descriptor.encode(descriptor.default)
    }
}
