//! Persisted framework identity.

use std::sync::Arc;

use esfm_id::{IdError, InstanceId};
use esfm_store::{PersistentStore, StoreError};
use thiserror::Error;
use tracing::info;

/// Errors from framework state operations.
#[derive(Debug, Error)]
pub enum FrameworkStateError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("stored instance id is invalid: {0}")]
    InvalidInstanceId(#[from] IdError),

    #[error("stored instance id is not UTF-8")]
    NotUtf8,
}

/// Instance id of the current registration, kept at `{namespace}/frameworkId`.
pub struct FrameworkState {
    store: Arc<dyn PersistentStore>,
    key: String,
}

impl FrameworkState {
    pub fn new(store: Arc<dyn PersistentStore>, namespace: &str) -> Self {
        Self {
            store,
            key: format!("{namespace}/frameworkId"),
        }
    }

    /// The stored instance id, or `None` if the scheduler never registered.
    pub fn instance_id(&self) -> Result<Option<InstanceId>, FrameworkStateError> {
        let Some(bytes) = self.store.get(&self.key)? else {
            return Ok(None);
        };
        let raw = String::from_utf8(bytes).map_err(|_| FrameworkStateError::NotUtf8)?;
        Ok(Some(InstanceId::parse(&raw)?))
    }

    pub fn set_instance_id(&self, instance_id: &InstanceId) -> Result<(), FrameworkStateError> {
        self.store.set(&self.key, instance_id.as_str().as_bytes())?;
        info!(instance_id = %instance_id, "Persisted framework instance id");
        Ok(())
    }
}
