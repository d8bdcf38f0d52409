//! Test helpers for mvirt-reconcile integration tests.
//!
//! The fakes replay a scripted sequence of remote states (the last entry
//! repeats forever) and record every mutation they receive.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mvirt_reconcile::ApiError;
use mvirt_reconcile::ReconcileConfig;
use mvirt_reconcile::resource::cluster::{
    Cluster, ClusterApi, ClusterState, CreateClusterRequest, PowerState,
};
use mvirt_reconcile::resource::router::{Route, RouterApi};
use mvirt_reconcile::resource::volume::{CreateVolumeRequest, Volume, VolumeApi, VolumeState};
use tracing_subscriber::EnvFilter;

/// Route test logs through the test writer. Set RUST_LOG to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// One-second polls and one-minute timeouts, for paused-clock tests.
pub fn fast_config() -> ReconcileConfig {
    ReconcileConfig {
        create_timeout: 60,
        update_timeout: 60,
        delete_timeout: 60,
        initial_delay: 1,
        poll_interval: 1,
        mutation_attempts: 3,
    }
}

/// Replays remote read results in order, repeating the last one.
pub struct Script<T> {
    steps: Mutex<VecDeque<Result<T, ApiError>>>,
}

impl<T: Clone> Script<T> {
    pub fn new(steps: impl IntoIterator<Item = Result<T, ApiError>>) -> Self {
        let steps: VecDeque<_> = steps.into_iter().collect();
        assert!(!steps.is_empty(), "script needs at least one step");
        Self {
            steps: Mutex::new(steps),
        }
    }

    pub fn states(states: impl IntoIterator<Item = T>) -> Self {
        Self::new(states.into_iter().map(Ok))
    }

    pub fn next(&self) -> Result<T, ApiError> {
        let mut steps = self.steps.lock().unwrap();
        if steps.len() > 1 {
            steps.pop_front().unwrap()
        } else {
            steps[0].clone()
        }
    }
}

/// Records mutations and fails the next ones on request.
#[derive(Default)]
pub struct Mutations {
    calls: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<ApiError>>,
}

impl Mutations {
    pub fn fail_next(&self, err: ApiError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn record(&self, call: String) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

pub struct FakeClusters {
    pub states: Script<ClusterState>,
    pub mutations: Mutations,
}

impl FakeClusters {
    pub fn new(states: impl IntoIterator<Item = ClusterState>) -> Self {
        Self::scripted(Script::states(states))
    }

    pub fn scripted(states: Script<ClusterState>) -> Self {
        Self {
            states,
            mutations: Mutations::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.mutations.calls()
    }
}

#[async_trait]
impl ClusterApi for FakeClusters {
    async fn get_cluster(&self, id: &str) -> Result<Cluster, ApiError> {
        let state = self.states.next()?;
        Ok(Cluster {
            id: id.to_string(),
            name: "prod".to_string(),
            state,
            template: "k8s-1.30".to_string(),
            master_flavor: "m1.medium".to_string(),
            node_count: 3,
        })
    }

    async fn create_cluster(&self, req: &CreateClusterRequest) -> Result<String, ApiError> {
        self.mutations.record(format!("create {}", req.name))?;
        Ok("c-1".to_string())
    }

    async fn upgrade_template(&self, id: &str, template: &str) -> Result<(), ApiError> {
        self.mutations
            .record(format!("upgrade_template {} {}", id, template))
    }

    async fn resize_master_flavor(&self, id: &str, flavor: &str) -> Result<(), ApiError> {
        self.mutations
            .record(format!("resize_master_flavor {} {}", id, flavor))
    }

    async fn resize_nodes(&self, id: &str, count: u32) -> Result<(), ApiError> {
        self.mutations.record(format!("resize_nodes {} {}", id, count))
    }

    async fn set_power(&self, id: &str, power: PowerState) -> Result<(), ApiError> {
        self.mutations.record(format!("set_power {} {:?}", id, power))
    }

    async fn delete_cluster(&self, id: &str) -> Result<(), ApiError> {
        self.mutations.record(format!("delete {}", id))
    }
}

pub struct FakeVolumes {
    pub states: Script<VolumeState>,
    pub mutations: Mutations,
}

impl FakeVolumes {
    pub fn new(states: impl IntoIterator<Item = VolumeState>) -> Self {
        Self::scripted(Script::states(states))
    }

    pub fn scripted(states: Script<VolumeState>) -> Self {
        Self {
            states,
            mutations: Mutations::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.mutations.calls()
    }
}

#[async_trait]
impl VolumeApi for FakeVolumes {
    async fn get_volume(&self, id: &str) -> Result<Volume, ApiError> {
        let state = self.states.next()?;
        Ok(Volume {
            id: id.to_string(),
            name: "data".to_string(),
            size_gb: 10,
            state,
        })
    }

    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<String, ApiError> {
        self.mutations
            .record(format!("create {} {}", req.name, req.size_gb))?;
        Ok("v-1".to_string())
    }

    async fn extend_volume(&self, id: &str, size_gb: u64) -> Result<(), ApiError> {
        self.mutations.record(format!("extend {} {}", id, size_gb))
    }

    async fn delete_volume(&self, id: &str) -> Result<(), ApiError> {
        self.mutations.record(format!("delete {}", id))
    }
}

/// Router holding its route list in memory. With `latency` set, reads take
/// that long, which widens the window between read and write.
#[derive(Default)]
pub struct FakeRouter {
    pub routes: Mutex<Vec<Route>>,
    pub mutations: Mutations,
    pub latency: Option<Duration>,
}

impl FakeRouter {
    pub fn slow(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouterApi for FakeRouter {
    async fn get_routes(&self, _router_id: &str) -> Result<Vec<Route>, ApiError> {
        let routes = self.routes();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(routes)
    }

    async fn set_routes(&self, router_id: &str, routes: &[Route]) -> Result<(), ApiError> {
        self.mutations
            .record(format!("set_routes {} {}", router_id, routes.len()))?;
        *self.routes.lock().unwrap() = routes.to_vec();
        Ok(())
    }
}
