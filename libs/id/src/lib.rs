//! # esfm-id
//!
//! Typed identifiers for the Elasticsearch fleet scheduler.
//!
//! Two families of identifiers exist:
//!
//! - **Generated IDs** are minted by the scheduler itself and use a prefixed
//!   ULID format, `{prefix}_{ulid}` (for example
//!   `exec_01HV4Z2WQXKJNM8GPQY6VBKC3D`). They are unique per launch.
//! - **Assigned IDs** are handed to us by the orchestrator (agent, offer and
//!   framework instance identities) or built from human-readable parts (task
//!   IDs embed the hostname and a timestamp). They are opaque, non-empty
//!   strings that must not contain `/`, since they are used as store path
//!   segments.
//!
//! Both families are typed so an agent ID can never be passed where a task
//! ID is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
