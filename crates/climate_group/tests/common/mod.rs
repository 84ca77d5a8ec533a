#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use climate_group::config::GroupConfig;
use climate_group::engine::Behaviour;
use climate_group::engine::Engine;
use climate_group::engine::EntityState;
use climate_group::engine::Host;
use climate_group::engine::MemoryHost;
use climate_group::engine::Service;
use climate_group::engine::ServiceCall;
use climate_group::GroupHandle;
use serde_json::json;
use tokio::task::JoinHandle;

pub struct Harness {
    pub host: Arc<MemoryHost>,
    pub engine: Arc<Engine>,
    runner: JoinHandle<()>,
}

impl Harness {
    /// Start an engine running `groups` against the devices already in `host`.
    pub async fn start(host: Arc<MemoryHost>, groups: Vec<GroupConfig>) -> Self {
        let mut engine = Engine::new(host.clone(), None);
        for group in groups {
            engine.register_group(group);
        }
        let engine = Arc::new(engine);
        let runner = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });

        let harness = Self {
            host,
            engine,
            runner,
        };
        harness.settle().await;
        harness
    }

    pub fn group(&self, key: &str) -> GroupHandle {
        self.engine.group(key).cloned().unwrap()
    }

    pub fn state(&self, entity_id: &str) -> EntityState {
        self.host.get_state(entity_id).unwrap()
    }

    /// Let every task run until it is waiting on a timer or a channel.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pub fn calls_of(&self, service: Service) -> Vec<ServiceCall> {
        self.host
            .calls()
            .into_iter()
            .filter(|c| c.service == service)
            .collect()
    }

    pub async fn stop(self) {
        self.runner.abort();
        self.engine.shutdown().await;
    }
}

/// A heating/cooling thermostat with fan modes.
pub fn thermostat(id: &str, mode: &str, temperature: f64) -> EntityState {
    EntityState::new(id, mode)
        .with_attribute("temperature", temperature)
        .with_attribute("current_temperature", 19.0)
        .with_attribute("hvac_modes", json!(["off", "heat", "cool"]))
        .with_attribute("fan_modes", json!(["low", "high"]))
        .with_attribute("fan_mode", "low")
        .with_attribute("supported_features", 1 | 8 | 128 | 256)
}

pub fn host_with(devices: &[(EntityState, Behaviour)]) -> Arc<MemoryHost> {
    let host = Arc::new(MemoryHost::new());
    for (state, behaviour) in devices {
        host.insert(state.clone(), *behaviour);
    }
    host
}
