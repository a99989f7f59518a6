//! Typed ID definitions.

use crate::{define_id, define_name};

// =============================================================================
// Generated by the scheduler
// =============================================================================

define_id!(ExecutorId, "exec");

// =============================================================================
// Assigned by the orchestrator
// =============================================================================

define_name!(InstanceId);
define_name!(AgentId);
define_name!(OfferId);

// =============================================================================
// Tasks
// =============================================================================

// Task IDs are built by the task factory as `elasticsearch_{host}_{timestamp}`
// so they stay readable in orchestrator UIs; they are opaque once created.
define_name!(TaskId);

// =============================================================================
// Tests
// =============================================================================
