use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::upload::Slot;

/// Stages a comparison request moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ReceivingUpload,
    Validating,
    Persisting,
    Hashing,
    Comparing,
    CleaningUp,
    Responding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric { Ssim, Keypoints }

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompareEvent {
    Stage { request_id: Uuid, stage: Stage },
    Persisted {
        request_id: Uuid,
        slot: Slot,
        path: PathBuf,
        bytes: u64,
        sniffed: Option<String>,
        format_mismatch: bool,
    },
    Hashed { request_id: Uuid, hash1: String, hash2: String },
    MetricFailed { request_id: Uuid, metric: Metric, error: String },
    CleanupWarning { request_id: Uuid, path: PathBuf, error: String },
    Succeeded { request_id: Uuid, identical: bool },
    Failed { request_id: Uuid, stage: Stage, error: String },
}

/// Receives the events a comparison emits. Kept separate from the service so
/// the core runs without any logging backend.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CompareEvent);
}

pub struct NullSink;
impl EventSink for NullSink {
    fn emit(&self, _event: CompareEvent) {}
}

/// Writes each event as a structured `tracing` record.
pub struct TracingSink;
impl EventSink for TracingSink {
    fn emit(&self, event: CompareEvent) {
        match event {
            CompareEvent::Stage { request_id, stage } => {
                tracing::debug!(%request_id, ?stage, "stage");
            }
            CompareEvent::Persisted { request_id, slot, path, bytes, sniffed, format_mismatch } => {
                if format_mismatch {
                    tracing::warn!(%request_id, %slot, path = %path.display(), bytes, ?sniffed, "content does not match file extension");
                } else {
                    tracing::info!(%request_id, %slot, path = %path.display(), bytes, ?sniffed, "saved upload");
                }
            }
            CompareEvent::Hashed { request_id, hash1, hash2 } => {
                tracing::info!(%request_id, %hash1, %hash2, "computed digests");
            }
            CompareEvent::MetricFailed { request_id, metric, error } => {
                tracing::warn!(%request_id, ?metric, %error, "metric not computed");
            }
            CompareEvent::CleanupWarning { request_id, path, error } => {
                tracing::error!(%request_id, path = %path.display(), %error, "failed to delete scratch file");
            }
            CompareEvent::Succeeded { request_id, identical } => {
                tracing::info!(%request_id, identical, "comparison finished");
            }
            CompareEvent::Failed { request_id, stage, error } => {
                tracing::error!(%request_id, ?stage, %error, "comparison failed");
            }
        }
    }
}

/// Keeps events in memory; handy for asserting on the transition sequence.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<CompareEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<CompareEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CompareEvent::Stage { stage, .. } => Some(stage),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn emit(&self, event: CompareEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
