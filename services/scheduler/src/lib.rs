//! # esfm-scheduler
//!
//! A cluster-resource framework scheduler that keeps a fleet of
//! Elasticsearch nodes at a configured size.
//!
//! ## Architecture
//!
//! - **Scheduler**: single-owner state machine fed by a bounded mailbox of
//!   orchestrator events
//! - **Offer strategy**: ordered decline rules deciding which offers to take
//! - **Task factory**: turns an accepted offer into a launchable task
//! - **Cluster state**: the persisted task registry for one framework instance
//! - **Cluster monitor**: per-task liveness check and reconciliation ping
//! - **Task reaper**: kills tasks above the desired node count
//!
//! The orchestrator itself sits behind [`driver::OrchestratorDriver`].

pub mod codec;
pub mod config;
pub mod driver;
pub mod model;
pub mod monitor;
pub mod offer_strategy;
pub mod reaper;
pub mod scheduler;
pub mod state;
pub mod task_factory;

pub use config::{ConfigError, Configuration};
pub use driver::{DriverCall, DriverError, OrchestratorDriver, RecordingDriver};
pub use model::{
    ClusterTask, FrameworkInfo, PortRange, ResourceOffer, ResourceRequest, Resources,
    TaskDescriptor, TaskState, TaskStatus,
};
pub use monitor::ClusterMonitor;
pub use offer_strategy::{OfferResult, OfferStrategy};
pub use reaper::TaskReaper;
pub use scheduler::{mailbox, Scheduler, SchedulerError, SchedulerEvent, SchedulerHandle};
pub use state::{ClusterState, FrameworkState};
pub use task_factory::TaskFactory;
