//! Block storage volumes.

use std::fmt;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::info;

use crate::classify::{ApiError, Classifier, Outcome};
use crate::config::ReconcileConfig;
use crate::error::{Result, Subject};
use crate::label::Label;
use crate::retry::retry_mutation;
use crate::wait::{Observation, WaitSpec, wait_for_state};

/// Conflict subtype returned when deleting a volume that is still being
/// detached from an instance.
pub const STILL_ATTACHED: &str = "volume_still_attached";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VolumeState {
    Creating,
    Available,
    Attaching,
    InUse,
    Detaching,
    Extending,
    Deleting,
    Error,
    ErrorDeleting,
    ErrorExtending,
    Deleted,
    Other(String),
}

impl VolumeState {
    pub fn as_str(&self) -> &str {
        match self {
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::Attaching => "attaching",
            VolumeState::InUse => "in-use",
            VolumeState::Detaching => "detaching",
            VolumeState::Extending => "extending",
            VolumeState::Deleting => "deleting",
            VolumeState::Error => "error",
            VolumeState::ErrorDeleting => "error_deleting",
            VolumeState::ErrorExtending => "error_extending",
            VolumeState::Deleted => "deleted",
            VolumeState::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "creating" => VolumeState::Creating,
            "available" => VolumeState::Available,
            "attaching" => VolumeState::Attaching,
            "in-use" => VolumeState::InUse,
            "detaching" => VolumeState::Detaching,
            "extending" => VolumeState::Extending,
            "deleting" => VolumeState::Deleting,
            "error" => VolumeState::Error,
            "error_deleting" => VolumeState::ErrorDeleting,
            "error_extending" => VolumeState::ErrorExtending,
            "deleted" => VolumeState::Deleted,
            other => VolumeState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Label for VolumeState {
    fn deleted() -> Self {
        VolumeState::Deleted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_gb: u64,
    pub state: VolumeState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub size_gb: u64,
    /// Clone from this template instead of creating an empty volume.
    pub template_id: Option<String>,
}

#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn get_volume(&self, id: &str) -> std::result::Result<Volume, ApiError>;

    /// Returns the new volume's ID.
    async fn create_volume(
        &self,
        req: &CreateVolumeRequest,
    ) -> std::result::Result<String, ApiError>;

    async fn extend_volume(&self, id: &str, size_gb: u64) -> std::result::Result<(), ApiError>;

    async fn delete_volume(&self, id: &str) -> std::result::Result<(), ApiError>;
}

pub fn classifier() -> Classifier {
    Classifier::new().retry_conflict(STILL_ATTACHED)
}

type VolumeRefresh<'a> = Box<
    dyn FnMut() -> BoxFuture<'a, std::result::Result<Observation<Volume, VolumeState>, ApiError>>
        + Send
        + 'a,
>;

fn refresh<'a, A>(api: &'a A, id: &'a str) -> VolumeRefresh<'a>
where
    A: VolumeApi + ?Sized,
{
    Box::new(move || {
        async move {
            let volume = api.get_volume(id).await?;
            let state = volume.state.clone();
            Ok::<_, ApiError>(Observation::new(volume, state))
        }
        .boxed()
    })
}

/// Create a volume and wait until it is available.
pub async fn create_volume<A>(
    api: &A,
    config: &ReconcileConfig,
    req: &CreateVolumeRequest,
) -> Result<Volume>
where
    A: VolumeApi + ?Sized,
{
    let classifier = classifier();
    let subject = Subject::new(format!("volume {}", req.name), "create");

    info!("Creating volume {} ({}GB)", req.name, req.size_gb);
    let id = retry_mutation(&config.retry(), &classifier, &subject, || {
        api.create_volume(req)
    })
    .await?;

    let subject = Subject::new(format!("volume {}", id), "create");
    let spec = WaitSpec::new(subject.clone(), [VolumeState::Available], refresh(api, &id))
        .pending([VolumeState::Creating])
        .timeout(config.create_timeout())
        .initial_delay(config.initial_delay())
        .poll_interval(config.poll_interval())
        .classifier(classifier);

    wait_for_state(spec).await?.ok_or_else(|| {
        subject.remote(
            Outcome::NotFound,
            ApiError::not_found(format!("volume {} vanished while creating", id)),
        )
    })
}

/// Grow a volume. Attached volumes settle back to `in-use`.
pub async fn extend_volume<A>(
    api: &A,
    config: &ReconcileConfig,
    id: &str,
    size_gb: u64,
) -> Result<Volume>
where
    A: VolumeApi + ?Sized,
{
    let classifier = classifier();
    let subject = Subject::new(format!("volume {}", id), "extend");

    info!("Extending volume {} to {}GB", id, size_gb);
    retry_mutation(&config.retry(), &classifier, &subject, || {
        api.extend_volume(id, size_gb)
    })
    .await?;

    let spec = WaitSpec::new(
        subject.clone(),
        [VolumeState::Available, VolumeState::InUse],
        refresh(api, id),
    )
    .pending([VolumeState::Extending])
    .timeout(config.update_timeout())
    .initial_delay(config.initial_delay())
    .poll_interval(config.poll_interval())
    .classifier(classifier);

    wait_for_state(spec).await?.ok_or_else(|| {
        subject.remote(
            Outcome::NotFound,
            ApiError::not_found(format!("volume {} vanished while extending", id)),
        )
    })
}

/// Delete a volume and wait until it is gone.
///
/// The delete call is retried while the volume is still detaching.
pub async fn delete_volume<A>(api: &A, config: &ReconcileConfig, id: &str) -> Result<()>
where
    A: VolumeApi + ?Sized,
{
    let classifier = classifier();
    let subject = Subject::new(format!("volume {}", id), "delete");

    info!("Deleting volume {}", id);
    match retry_mutation(&config.retry(), &classifier, &subject, || {
        api.delete_volume(id)
    })
    .await
    {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {
            info!("Volume {} already deleted", id);
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    let spec = WaitSpec::new(subject, [VolumeState::Deleted], refresh(api, id))
        .pending([
            VolumeState::Available,
            VolumeState::Detaching,
            VolumeState::Deleting,
        ])
        .timeout(config.delete_timeout())
        .initial_delay(config.initial_delay())
        .poll_interval(config.poll_interval())
        .classifier(classifier);

    wait_for_state(spec).await?;
    Ok(())
}
