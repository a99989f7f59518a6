//! Durable scheduler state.
//!
//! Built on a [`PersistentStore`](esfm_store::PersistentStore):
//! - Framework state: the instance id of the current registration
//! - Cluster state: the registry of tasks the scheduler has launched
//!
//! Cluster state lives under a key scoped to the instance id, so a
//! scheduler that re-registers under its previous id reloads its tasks.

mod cluster;
mod framework;

pub(crate) use cluster::next_node_id;
pub use cluster::{ClusterState, ClusterStateError};
pub use framework::{FrameworkState, FrameworkStateError};
