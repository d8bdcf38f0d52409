//! Resource families built on the reconciliation core.
//!
//! Each family declares its closed set of states, the conflict subtypes its
//! API resolves on its own, and an async trait for the remote calls it
//! needs. The transport behind the trait is supplied by the caller.

pub mod cluster;
pub mod router;
pub mod volume;
