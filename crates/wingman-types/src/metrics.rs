//! Telemetry emitted periodically by a running inference process.
//!
//! The engine owns the content; we only relay it. Every block is lenient
//! (`#[serde(default)]`) so an engine that omits a field does not break the
//! feed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSnapshot {
    /// Alias of the process that produced the snapshot. Stamped by the relay.
    pub alias: String,
    pub meta: ModelMeta,
    pub system: SystemMetrics,
    /// Tensor name -> size in bytes.
    pub tensors: BTreeMap<String, u64>,
    pub timings: Timings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelMeta {
    pub architecture: String,
    pub context_length: u32,
    pub vocab_size: u32,
    pub embedding_length: u32,
    pub quantization: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemMetrics {
    pub context_size: u32,
    pub vram_used_mb: f64,
    pub vram_total_mb: f64,
    pub ram_used_mb: f64,
    pub gpu_layers: i32,
    pub offloaded_layers: i32,
    pub has_next_token: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timings {
    pub tokens_per_second: f64,
    pub ms_per_token: f64,
    pub predicted_count: u64,
    pub prompt_count: u64,
    pub sample_count: u64,
    pub sample_ms: f64,
}

impl MetricsSnapshot {
    /// Parse one frame from the engine. Unknown fields are ignored.
    pub fn from_frame(frame: &str, alias: &str) -> Result<Self, serde_json::Error> {
        let mut snapshot: MetricsSnapshot = serde_json::from_str(frame)?;
        if snapshot.alias.is_empty() {
            snapshot.alias = alias.to_string();
        }
        Ok(snapshot)
    }
}
