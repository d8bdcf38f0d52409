//! Static routes on a router.
//!
//! The API only exposes the full route list, so adding or removing one route
//! is a read-modify-write of the whole list. Both operations hold the
//! router's lock in the [`LockRegistry`] for the entire cycle.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classify::{ApiError, Classifier};
use crate::config::ReconcileConfig;
use crate::error::{Result, Subject};
use crate::lock::LockRegistry;
use crate::retry::retry_mutation;

/// Conflict subtype returned while the router applies a previous change.
pub const ROUTER_BUSY: &str = "router_busy";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    pub nexthop: String,
}

impl Route {
    pub fn new(destination: impl Into<String>, nexthop: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            nexthop: nexthop.into(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.destination, self.nexthop)
    }
}

#[async_trait]
pub trait RouterApi: Send + Sync {
    async fn get_routes(&self, router_id: &str) -> std::result::Result<Vec<Route>, ApiError>;

    /// Replace the router's route list.
    async fn set_routes(
        &self,
        router_id: &str,
        routes: &[Route],
    ) -> std::result::Result<(), ApiError>;
}

pub fn classifier() -> Classifier {
    Classifier::new().retry_conflict(ROUTER_BUSY)
}

/// Lock key shared by every mutation of one router's routes.
pub fn lock_key(router_id: &str) -> String {
    format!("router/{}", router_id)
}

/// Add `route` unless the router already has it. Returns `false` if it was
/// already present.
pub async fn add_route<A>(
    api: &A,
    locks: &LockRegistry,
    config: &ReconcileConfig,
    router_id: &str,
    route: &Route,
) -> Result<bool>
where
    A: RouterApi + ?Sized,
{
    let subject = Subject::new(format!("router {}", router_id), "add-route");
    info!("Adding route {} to router {}", route, router_id);

    update_routes(api, locks, config, &subject, router_id, |routes| {
        if routes.contains(route) {
            return false;
        }
        routes.push(route.clone());
        true
    })
    .await
}

/// Remove `route`. Returns `false` if the router did not have it.
pub async fn remove_route<A>(
    api: &A,
    locks: &LockRegistry,
    config: &ReconcileConfig,
    router_id: &str,
    route: &Route,
) -> Result<bool>
where
    A: RouterApi + ?Sized,
{
    let subject = Subject::new(format!("router {}", router_id), "remove-route");
    info!("Removing route {} from router {}", route, router_id);

    update_routes(api, locks, config, &subject, router_id, |routes| {
        let before = routes.len();
        routes.retain(|r| r != route);
        routes.len() != before
    })
    .await
}

/// Read the route list, apply `edit`, and write it back if `edit` reports a
/// change. The router's lock is held from the read until the write returns.
async fn update_routes<A, E>(
    api: &A,
    locks: &LockRegistry,
    config: &ReconcileConfig,
    subject: &Subject,
    router_id: &str,
    edit: E,
) -> Result<bool>
where
    A: RouterApi + ?Sized,
    E: Fn(&mut Vec<Route>) -> bool,
{
    let classifier = classifier();
    let retry = config.retry();
    let edit = &edit;

    locks
        .with_lock(&lock_key(router_id), || async move {
            retry_mutation(&retry, &classifier, subject, || async move {
                let mut routes = api.get_routes(router_id).await?;
                if !edit(&mut routes) {
                    debug!("{}: route list unchanged", subject);
                    return Ok::<_, ApiError>(false);
                }
                api.set_routes(router_id, &routes).await?;
                Ok(true)
            })
            .await
        })
        .await
}
