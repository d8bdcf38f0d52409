//! mvirt reconciliation core
//!
//! Drives remote objects that change state asynchronously: classify API
//! failures, poll an object until it reaches a target state, serialize
//! mutations of a shared parent, and run composite updates as ordered,
//! state-gated phases.
//!
//! # Example
//! ```ignore
//! use mvirt_reconcile::resource::cluster::{self, ClusterUpdate, PowerState};
//! use mvirt_reconcile::ReconcileConfig;
//!
//! let update = ClusterUpdate {
//!     master_flavor: Some("m1.large".into()),
//!     power: Some(PowerState::Off),
//!     ..Default::default()
//! };
//! let applied = cluster::update_cluster(&api, &ReconcileConfig::default(), "c-1", &update).await?;
//! ```

pub mod classify;
pub mod config;
pub mod error;
pub mod label;
pub mod lock;
pub mod phase;
pub mod resource;
pub mod retry;
pub mod wait;

pub use classify::{ApiError, Classifier, Outcome};
pub use config::ReconcileConfig;
pub use error::{ReconcileError, Result, Subject};
pub use label::Label;
pub use lock::{LockHandle, LockRegistry};
pub use phase::{Phase, PhaseRunner};
pub use retry::{RetryConfig, retry_mutation};
pub use wait::{Observation, WaitSpec, wait_for_state};
