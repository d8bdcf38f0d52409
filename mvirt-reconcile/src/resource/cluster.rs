//! Managed container clusters.
//!
//! A cluster is the composite object of the family: a single update may
//! need a template upgrade, a master flavor resize, a node count change
//! and a power change. All of them move the cluster through `reconciling`,
//! so they must never overlap. [`update_cluster`] declares them as phases
//! and lets the [`PhaseRunner`] sequence them.
//!
//! ```text
//! provisioning → running ⇄ shutoff
//!                   ↓ ↑
//!               reconciling          error / deleting / deleted: no changes
//! ```

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::info;

use crate::classify::{ApiError, Classifier, Outcome};
use crate::config::ReconcileConfig;
use crate::error::{Result, Subject};
use crate::label::Label;
use crate::phase::{Phase, PhaseRunner};
use crate::retry::retry_mutation;
use crate::wait::{Observation, WaitSpec, wait_for_state};

pub const UPGRADE_TEMPLATE: &str = "upgrade-template";
pub const RESIZE_MASTER_FLAVOR: &str = "resize-master-flavor";
pub const RESIZE_NODES: &str = "resize-nodes";
pub const POWER_ON: &str = "power-on";
pub const POWER_OFF: &str = "power-off";

/// Conflict subtype returned while another operation holds the cluster.
pub const OPERATION_IN_PROGRESS: &str = "operation_in_progress";

/// Cluster lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClusterState {
    Provisioning,
    Running,
    Shutoff,
    Reconciling,
    Error,
    Deleting,
    Deleted,
    /// A state this version does not know about.
    Other(String),
}

impl ClusterState {
    pub fn as_str(&self) -> &str {
        match self {
            ClusterState::Provisioning => "provisioning",
            ClusterState::Running => "running",
            ClusterState::Shutoff => "shutoff",
            ClusterState::Reconciling => "reconciling",
            ClusterState::Error => "error",
            ClusterState::Deleting => "deleting",
            ClusterState::Deleted => "deleted",
            ClusterState::Other(s) => s,
        }
    }

    /// Template upgrades, flavor resizes and power changes are only legal
    /// while the cluster is at rest.
    pub fn allows_changes(&self) -> bool {
        matches!(self, ClusterState::Running | ClusterState::Shutoff)
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterState {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "provisioning" => ClusterState::Provisioning,
            "running" => ClusterState::Running,
            "shutoff" => ClusterState::Shutoff,
            "reconciling" => ClusterState::Reconciling,
            "error" => ClusterState::Error,
            "deleting" => ClusterState::Deleting,
            "deleted" => ClusterState::Deleted,
            _ => ClusterState::Other(s.to_string()),
        })
    }
}

impl Label for ClusterState {
    fn deleted() -> Self {
        ClusterState::Deleted
    }
}

/// Requested power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    /// The state a cluster settles in once the power change is done.
    pub fn settled_state(self) -> ClusterState {
        match self {
            PowerState::On => ClusterState::Running,
            PowerState::Off => ClusterState::Shutoff,
        }
    }

    fn phase_name(self) -> &'static str {
        match self {
            PowerState::On => POWER_ON,
            PowerState::Off => POWER_OFF,
        }
    }
}

/// Cluster as reported by the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub state: ClusterState,
    pub template: String,
    pub master_flavor: String,
    pub node_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateClusterRequest {
    pub name: String,
    pub template: String,
    pub master_flavor: String,
    pub node_count: u32,
}

/// Desired changes for one update call. `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterUpdate {
    pub template: Option<String>,
    pub master_flavor: Option<String>,
    pub node_count: Option<u32>,
    pub power: Option<PowerState>,
}

impl ClusterUpdate {
    pub fn is_empty(&self) -> bool {
        self.template.is_none()
            && self.master_flavor.is_none()
            && self.node_count.is_none()
            && self.power.is_none()
    }
}

/// Remote calls the cluster family needs.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_cluster(&self, id: &str) -> std::result::Result<Cluster, ApiError>;

    /// Returns the new cluster's ID.
    async fn create_cluster(
        &self,
        req: &CreateClusterRequest,
    ) -> std::result::Result<String, ApiError>;

    async fn upgrade_template(
        &self,
        id: &str,
        template: &str,
    ) -> std::result::Result<(), ApiError>;

    async fn resize_master_flavor(
        &self,
        id: &str,
        flavor: &str,
    ) -> std::result::Result<(), ApiError>;

    async fn resize_nodes(&self, id: &str, count: u32) -> std::result::Result<(), ApiError>;

    async fn set_power(&self, id: &str, power: PowerState) -> std::result::Result<(), ApiError>;

    async fn delete_cluster(&self, id: &str) -> std::result::Result<(), ApiError>;
}

/// Conflict subtypes the cluster API resolves on its own.
pub fn classifier() -> Classifier {
    Classifier::new().retry_conflict(OPERATION_IN_PROGRESS)
}

type ClusterRefresh<'a> = Box<
    dyn FnMut() -> BoxFuture<'a, std::result::Result<Observation<Cluster, ClusterState>, ApiError>>
        + Send
        + 'a,
>;

fn refresh<'a, A>(api: &'a A, id: &'a str) -> ClusterRefresh<'a>
where
    A: ClusterApi + ?Sized,
{
    Box::new(move || {
        async move {
            let cluster = api.get_cluster(id).await?;
            let state = cluster.state.clone();
            Ok::<_, ApiError>(Observation::new(cluster, state))
        }
        .boxed()
    })
}

fn object(id: &str) -> String {
    format!("cluster {}", id)
}

/// Create a cluster and wait until it is running.
pub async fn create_cluster<A>(
    api: &A,
    config: &ReconcileConfig,
    req: &CreateClusterRequest,
) -> Result<Cluster>
where
    A: ClusterApi + ?Sized,
{
    let classifier = classifier();
    let subject = Subject::new(object(&req.name), "create");

    info!("Creating cluster {}", req.name);
    let id = retry_mutation(&config.retry(), &classifier, &subject, || {
        api.create_cluster(req)
    })
    .await?;

    let subject = Subject::new(object(&id), "create");
    let spec = WaitSpec::new(subject.clone(), [ClusterState::Running], refresh(api, &id))
        .pending([ClusterState::Provisioning])
        .timeout(config.create_timeout())
        .initial_delay(config.initial_delay())
        .poll_interval(config.poll_interval())
        .classifier(classifier);

    wait_for_state(spec).await?.ok_or_else(|| {
        subject.remote(
            Outcome::NotFound,
            ApiError::not_found(format!("cluster {} vanished while provisioning", id)),
        )
    })
}

/// Wait for a mutating phase to pass through `reconciling` back to `target`.
fn settle<'a, A>(
    api: &'a A,
    id: &'a str,
    config: &ReconcileConfig,
    operation: &'static str,
    pending: Vec<ClusterState>,
    target: ClusterState,
) -> WaitSpec<'a, Cluster, ClusterState>
where
    A: ClusterApi + ?Sized,
{
    WaitSpec::new(Subject::new(object(id), operation), [target], refresh(api, id))
        .pending(pending)
        .timeout(config.update_timeout())
        .initial_delay(config.initial_delay())
        .poll_interval(config.poll_interval())
        .classifier(classifier())
}

/// Build the ordered phase list for `update`.
///
/// Order: template upgrade, master flavor resize, node count resize, power
/// change. The first three require a cluster at rest (node resizes a
/// running one); a power change is skipped when the cluster is already in
/// the requested state.
pub fn plan_update<'a, A>(
    api: &'a A,
    config: &ReconcileConfig,
    id: &'a str,
    update: &'a ClusterUpdate,
) -> Vec<Phase<'a, Cluster, ClusterState>>
where
    A: ClusterApi + ?Sized,
{
    let retry = config.retry();
    let mut phases = Vec::new();
    // A shutoff cluster may still report shutoff on the first poll.
    let from_rest = vec![ClusterState::Shutoff, ClusterState::Reconciling];

    if let Some(template) = update.template.as_deref() {
        phases.push(
            Phase::new(
                UPGRADE_TEMPLATE,
                move || api.upgrade_template(id, template),
                settle(
                    api,
                    id,
                    config,
                    UPGRADE_TEMPLATE,
                    from_rest.clone(),
                    ClusterState::Running,
                ),
            )
            .when(ClusterState::allows_changes)
            .retry(retry.clone()),
        );
    }

    if let Some(flavor) = update.master_flavor.as_deref() {
        phases.push(
            Phase::new(
                RESIZE_MASTER_FLAVOR,
                move || api.resize_master_flavor(id, flavor),
                settle(
                    api,
                    id,
                    config,
                    RESIZE_MASTER_FLAVOR,
                    from_rest.clone(),
                    ClusterState::Running,
                ),
            )
            .when(ClusterState::allows_changes)
            .retry(retry.clone()),
        );
    }

    if let Some(count) = update.node_count {
        phases.push(
            Phase::new(
                RESIZE_NODES,
                move || api.resize_nodes(id, count),
                settle(
                    api,
                    id,
                    config,
                    RESIZE_NODES,
                    vec![ClusterState::Reconciling],
                    ClusterState::Running,
                ),
            )
            .when(|state| *state == ClusterState::Running)
            .retry(retry.clone()),
        );
    }

    if let Some(power) = update.power {
        let name = power.phase_name();
        let settled = power.settled_state();
        let from = match power {
            PowerState::On => ClusterState::Shutoff,
            PowerState::Off => ClusterState::Running,
        };
        phases.push(
            Phase::new(
                name,
                move || api.set_power(id, power),
                settle(
                    api,
                    id,
                    config,
                    name,
                    vec![from, ClusterState::Reconciling],
                    settled.clone(),
                ),
            )
            .when(ClusterState::allows_changes)
            .unless(move |state| *state == settled)
            .retry(retry),
        );
    }

    phases
}

/// Apply `update` to cluster `id`, one phase at a time.
///
/// Returns the names of the phases that were applied. On failure the
/// cluster is left in whatever state the last completed phase produced.
pub async fn update_cluster<A>(
    api: &A,
    config: &ReconcileConfig,
    id: &str,
    update: &ClusterUpdate,
) -> Result<Vec<&'static str>>
where
    A: ClusterApi + ?Sized,
{
    if update.is_empty() {
        return Ok(Vec::new());
    }

    info!("Updating cluster {}: {:?}", id, update);
    let phases = plan_update(api, config, id, update);
    PhaseRunner::new(object(id), move || {
        async move { api.get_cluster(id).await.map(|c| c.state) }
    })
    .classifier(classifier())
    .run(phases)
    .await
}

/// Delete cluster `id` and wait until it is gone.
///
/// A cluster that is already gone counts as deleted.
pub async fn delete_cluster<A>(api: &A, config: &ReconcileConfig, id: &str) -> Result<()>
where
    A: ClusterApi + ?Sized,
{
    let classifier = classifier();
    let subject = Subject::new(object(id), "delete");

    let current = match api.get_cluster(id).await {
        Ok(cluster) => cluster.state,
        Err(err) => match classifier.classify(&err) {
            Outcome::NotFound => {
                info!("Cluster {} already deleted", id);
                return Ok(());
            }
            outcome => return Err(subject.remote(outcome, err)),
        },
    };

    if current == ClusterState::Deleted {
        info!("Cluster {} already deleted", id);
        return Ok(());
    }

    info!("Deleting cluster {} (state {})", id, current);
    match retry_mutation(&config.retry(), &classifier, &subject, || {
        api.delete_cluster(id)
    })
    .await
    {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err),
    }

    // The API may keep reporting the pre-delete state for a while.
    let mut pending = vec![ClusterState::Deleting, current];
    pending.dedup();
    let spec = WaitSpec::new(subject, [ClusterState::Deleted], refresh(api, id))
        .pending(pending)
        .timeout(config.delete_timeout())
        .initial_delay(config.initial_delay())
        .poll_interval(config.poll_interval())
        .classifier(classifier);

    wait_for_state(spec).await?;
    Ok(())
}
