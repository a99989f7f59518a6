//! Registry of running cluster tasks.
//!
//! The whole collection is one blob under `{namespace}/{instance}/stateList`.
//! Every mutation is a full read-modify-write under a per-instance mutex.

use std::sync::{Arc, Mutex, MutexGuard};

use esfm_id::{AgentId, ExecutorId, InstanceId, TaskId};
use esfm_store::{PersistentStore, StoreError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{self, CodecError};
use crate::model::{ClusterTask, TaskStatus};

/// Errors from cluster state operations.
#[derive(Debug, Error)]
pub enum ClusterStateError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("cluster state lock poisoned")]
    LockPoisoned,
}

/// Durable registry of cluster tasks for one scheduler instance.
pub struct ClusterState {
    store: Arc<dyn PersistentStore>,
    key: String,
    lock: Mutex<()>,
}

impl ClusterState {
    pub fn new(store: Arc<dyn PersistentStore>, namespace: &str, instance_id: &InstanceId) -> Self {
        Self {
            store,
            key: format!("{namespace}/{instance_id}/stateList"),
            lock: Mutex::new(()),
        }
    }

    /// Store key holding the task collection.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// All tasks, in persisted order.
    pub fn get_all(&self) -> Result<Vec<ClusterTask>, ClusterStateError> {
        let _guard = self.lock()?;
        self.load()
    }

    pub fn get(&self, task_id: &TaskId) -> Result<Option<ClusterTask>, ClusterStateError> {
        Ok(self
            .get_all()?
            .into_iter()
            .find(|task| task.task_id() == task_id))
    }

    pub fn exists(&self, task_id: &TaskId) -> Result<bool, ClusterStateError> {
        Ok(self.get(task_id)?.is_some())
    }

    pub fn len(&self) -> Result<usize, ClusterStateError> {
        Ok(self.get_all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, ClusterStateError> {
        Ok(self.len()? == 0)
    }

    /// Task launched with the given executor.
    pub fn find_by_executor(
        &self,
        executor_id: &ExecutorId,
    ) -> Result<Option<ClusterTask>, ClusterStateError> {
        Ok(self
            .get_all()?
            .into_iter()
            .find(|task| task.descriptor.executor.executor_id == *executor_id))
    }

    /// Tasks placed on the given agent.
    pub fn find_by_agent(&self, agent_id: &AgentId) -> Result<Vec<ClusterTask>, ClusterStateError> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|task| task.descriptor.agent_id == *agent_id)
            .collect())
    }

    /// Append a task. A task id that is already present is left as-is.
    pub fn add(&self, task: ClusterTask) -> Result<(), ClusterStateError> {
        let _guard = self.lock()?;
        let mut tasks = self.load()?;

        if tasks.iter().any(|t| t.task_id() == task.task_id()) {
            warn!(task_id = %task.task_id(), "Task already in cluster state, not adding");
            return Ok(());
        }

        debug!(task_id = %task.task_id(), "Adding task to cluster state");
        tasks.push(task);
        self.save(&tasks)
    }

    /// Replace the status of a known task, returning the updated task.
    pub fn update(&self, status: &TaskStatus) -> Result<ClusterTask, ClusterStateError> {
        let _guard = self.lock()?;
        let mut tasks = self.load()?;

        let Some(task) = tasks.iter_mut().find(|t| *t.task_id() == status.task_id) else {
            return Err(ClusterStateError::UnknownTask(status.task_id.clone()));
        };
        task.status = status.clone();
        let updated = task.clone();

        debug!(
            task_id = %status.task_id,
            state = %status.state,
            "Updated task status in cluster state"
        );
        self.save(&tasks)?;
        Ok(updated)
    }

    /// Remove a task, returning it if it was present.
    pub fn remove(&self, task_id: &TaskId) -> Result<Option<ClusterTask>, ClusterStateError> {
        let _guard = self.lock()?;
        let mut tasks = self.load()?;

        let Some(idx) = tasks.iter().position(|t| t.task_id() == task_id) else {
            warn!(task_id = %task_id, "Task not in cluster state, nothing to remove");
            return Ok(None);
        };
        let removed = tasks.remove(idx);

        debug!(task_id = %task_id, "Removed task from cluster state");
        self.save(&tasks)?;
        Ok(Some(removed))
    }

    /// Smallest external-volume node id not assigned to any task.
    pub fn elastic_node_id(&self) -> Result<u32, ClusterStateError> {
        Ok(next_node_id(&self.get_all()?))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, ClusterStateError> {
        self.lock.lock().map_err(|_| ClusterStateError::LockPoisoned)
    }

    fn load(&self) -> Result<Vec<ClusterTask>, ClusterStateError> {
        match self.store.get(&self.key)? {
            Some(bytes) => Ok(codec::decode_task_list(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, tasks: &[ClusterTask]) -> Result<(), ClusterStateError> {
        let bytes = codec::encode_task_list(tasks)?;
        self.store.set(&self.key, &bytes)?;
        Ok(())
    }
}

/// Smallest node id not tagged on any of `tasks`.
pub(crate) fn next_node_id(tasks: &[ClusterTask]) -> u32 {
    esfm_reconcile::lowest_free_ordinal(tasks.iter().filter_map(|t| t.descriptor.node_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{fixtures, TaskState};
    use esfm_store::MemoryStore;

    fn state() -> (Arc<MemoryStore>, ClusterState) {
        let store = Arc::new(MemoryStore::new());
        let instance = InstanceId::parse("fw-1").unwrap();
        let state = ClusterState::new(store.clone(), "elasticsearch/mesos-ha", &instance);
        (store, state)
    }

    fn running(task: &ClusterTask) -> TaskStatus {
        TaskStatus {
            state: TaskState::Running,
            timestamp: 1_442_836_800.5,
            message: "running".to_string(),
            ..task.status.clone()
        }
    }

    #[test]
    fn test_never_written_reads_empty() {
        let (_, state) = state();
        assert!(state.get_all().unwrap().is_empty());
        assert_eq!(state.key(), "elasticsearch/mesos-ha/fw-1/stateList");
    }

    #[test]
    fn test_add_is_idempotent() {
        let (store, state) = state();
        let task = fixtures::task("task-1", "agent-1");

        state.add(task.clone()).unwrap();
        let writes = store.write_count();
        state.add(task.clone()).unwrap();

        assert_eq!(state.len().unwrap(), 1);
        assert_eq!(store.write_count(), writes);
    }

    #[test]
    fn test_update_known_task() {
        let (_, state) = state();
        let task = fixtures::task("task-1", "agent-1");
        state.add(task.clone()).unwrap();

        let updated = state.update(&running(&task)).unwrap();
        assert_eq!(updated.status.state, TaskState::Running);

        let stored = state.get(task.task_id()).unwrap().unwrap();
        assert_eq!(stored.status.state, TaskState::Running);
        assert_eq!(stored.descriptor, task.descriptor);
    }

    #[test]
    fn test_update_unknown_task_errors() {
        let (_, state) = state();
        let task = fixtures::task("task-1", "agent-1");

        let err = state.update(&task.status).unwrap_err();
        assert!(matches!(err, ClusterStateError::UnknownTask(id) if id == *task.task_id()));
    }

    #[test]
    fn test_remove_tolerates_absent() {
        let (_, state) = state();
        let task = fixtures::task("task-1", "agent-1");
        state.add(task.clone()).unwrap();

        assert!(state.remove(task.task_id()).unwrap().is_some());
        assert!(state.remove(task.task_id()).unwrap().is_none());
        assert!(state.is_empty().unwrap());
    }

    #[test]
    fn test_find_by_agent_and_executor() {
        let (_, state) = state();
        let a = fixtures::task("task-1", "agent-1");
        let b = fixtures::task("task-2", "agent-2");
        state.add(a.clone()).unwrap();
        state.add(b.clone()).unwrap();

        let on_agent = state.find_by_agent(&b.descriptor.agent_id).unwrap();
        assert_eq!(on_agent, vec![b.clone()]);

        let by_exec = state
            .find_by_executor(&a.descriptor.executor.executor_id)
            .unwrap();
        assert_eq!(by_exec, Some(a));
    }

    #[test]
    fn test_elastic_node_id_fills_gaps() {
        let (_, state) = state();
        assert_eq!(state.elastic_node_id().unwrap(), 0);

        state.add(fixtures::tagged_task("task-0", "agent-0", 0)).unwrap();
        state.add(fixtures::tagged_task("task-2", "agent-2", 2)).unwrap();
        assert_eq!(state.elastic_node_id().unwrap(), 1);

        state.add(fixtures::tagged_task("task-1", "agent-1", 1)).unwrap();
        assert_eq!(state.elastic_node_id().unwrap(), 3);
    }

    #[test]
    fn test_corrupted_blob_is_an_error() {
        let (store, state) = state();
        store.put_raw(state.key(), b"not a task list").unwrap();

        let err = state.get_all().unwrap_err();
        assert!(matches!(err, ClusterStateError::Codec(ref e) if e.is_corrupted()));

        let err = state.add(fixtures::task("task-1", "agent-1")).unwrap_err();
        assert!(matches!(err, ClusterStateError::Codec(_)));
    }

    #[test]
    fn test_persists_across_instances() {
        let (store, state) = state();
        state.add(fixtures::task("task-1", "agent-1")).unwrap();

        let instance = InstanceId::parse("fw-1").unwrap();
        let reloaded = ClusterState::new(store, "elasticsearch/mesos-ha", &instance);
        assert_eq!(reloaded.len().unwrap(), 1);
    }
}
