//! Versioned encoding of persisted entities.
//!
//! Every blob is a JSON envelope `{"version", "kind", "body"}`. Decoding
//! checks the version and kind before touching the body, so a foreign or
//! damaged blob is reported as [`CodecError`] and never mistaken for an
//! absent value.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ClusterTask, TaskDescriptor, TaskStatus};

/// Current envelope version.
pub const CODEC_VERSION: u32 = 1;

const KIND_DESCRIPTOR: &str = "task_descriptor";
const KIND_STATUS: &str = "task_status";
const KIND_TASK_LIST: &str = "task_list";

/// Errors from encoding or decoding persisted entities.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("corrupted {kind} blob: {reason}")]
    Corrupted { kind: &'static str, reason: String },

    #[error("unsupported {kind} version {found} (supported: {supported})")]
    UnsupportedVersion {
        kind: &'static str,
        found: u32,
        supported: u32,
    },

    #[error("failed to encode {kind}: {reason}")]
    Encode { kind: &'static str, reason: String },
}

impl CodecError {
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a, T> {
    version: u32,
    kind: &'a str,
    body: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    version: u32,
    kind: String,
    body: serde_json::Value,
}

fn encode<T: Serialize>(kind: &'static str, body: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(&EnvelopeOut {
        version: CODEC_VERSION,
        kind,
        body,
    })
    .map_err(|e| CodecError::Encode {
        kind,
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(kind: &'static str, bytes: &[u8]) -> Result<T, CodecError> {
    let corrupted = |reason: String| CodecError::Corrupted { kind, reason };

    let envelope: EnvelopeIn =
        serde_json::from_slice(bytes).map_err(|e| corrupted(e.to_string()))?;

    if envelope.version != CODEC_VERSION {
        return Err(CodecError::UnsupportedVersion {
            kind,
            found: envelope.version,
            supported: CODEC_VERSION,
        });
    }
    if envelope.kind != kind {
        return Err(corrupted(format!("unexpected kind {:?}", envelope.kind)));
    }

    serde_json::from_value(envelope.body).map_err(|e| corrupted(e.to_string()))
}

pub fn encode_descriptor(descriptor: &TaskDescriptor) -> Result<Vec<u8>, CodecError> {
    encode(KIND_DESCRIPTOR, descriptor)
}

pub fn decode_descriptor(bytes: &[u8]) -> Result<TaskDescriptor, CodecError> {
    decode(KIND_DESCRIPTOR, bytes)
}

pub fn encode_status(status: &TaskStatus) -> Result<Vec<u8>, CodecError> {
    encode(KIND_STATUS, status)
}

pub fn decode_status(bytes: &[u8]) -> Result<TaskStatus, CodecError> {
    decode(KIND_STATUS, bytes)
}

/// Encode the full cluster task collection, preserving order.
pub fn encode_task_list(tasks: &[ClusterTask]) -> Result<Vec<u8>, CodecError> {
    encode(KIND_TASK_LIST, &tasks)
}

pub fn decode_task_list(bytes: &[u8]) -> Result<Vec<ClusterTask>, CodecError> {
    decode(KIND_TASK_LIST, bytes)
}
