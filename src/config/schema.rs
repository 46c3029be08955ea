//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the sidecar.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the sidecar.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SidecarConfig {
    /// Downstream listener (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Where receive-chain output is sent.
    pub upstream: UpstreamConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Context and buffer pool sizing.
    pub pool: PoolConfig,

    /// Filters installed on every stream, in registration order.
    pub filters: FilterChainConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:15001").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:15001".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Upstream the sidecar forwards to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// `host:port` of the local application.
    pub address: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// A connection that moves no bytes in either direction for this long
    /// resets its stream. Zero disables the check.
    pub idle_secs: u64,

    /// How long shutdown waits for open streams before giving up.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            idle_secs: 300,
            drain_secs: 30,
        }
    }
}

/// Sizing of the process-wide pools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of shards per pool; 0 means one per available CPU.
    pub shards: usize,

    /// Context storages allocated per shard at startup.
    pub prewarm_per_shard: usize,

    /// Idle items a shard keeps; surplus returned items are dropped.
    pub max_idle_per_shard: usize,

    /// Initial slot count of a fresh context.
    pub context_capacity: usize,

    /// Default capacity of a pooled byte buffer.
    pub buffer_capacity: usize,

    /// Byte buffers allocated per shard at startup.
    pub buffer_prewarm_per_shard: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            shards: 0,
            prewarm_per_shard: 16,
            max_idle_per_shard: 1024,
            context_capacity: 8,
            buffer_capacity: 16 * 1024,
            buffer_prewarm_per_shard: 4,
        }
    }
}

/// Filters per direction.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FilterChainConfig {
    /// Request path filters (downstream → upstream).
    pub receive: Vec<FilterConfig>,

    /// Response path filters (upstream → downstream).
    pub send: Vec<FilterConfig>,
}

/// One built-in filter, selected by `kind`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterConfig {
    HeaderInject(HeaderInjectConfig),
    FaultInject(FaultInjectConfig),
    BodyBuffer(BodyBufferConfig),
}

impl FilterConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            FilterConfig::HeaderInject(_) => "header_inject",
            FilterConfig::FaultInject(_) => "fault_inject",
            FilterConfig::BodyBuffer(_) => "body_buffer",
        }
    }
}

/// Headers set (replacing existing values) during the headers phase.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HeaderInjectConfig {
    pub headers: BTreeMap<String, String>,
}

/// Delay the headers phase of a share of streams.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FaultInjectConfig {
    /// Share of streams delayed, 0–100.
    pub percentage: f64,

    /// Delay before the chain resumes.
    pub delay_ms: u64,
}

impl Default for FaultInjectConfig {
    fn default() -> Self {
        Self {
            percentage: 100.0,
            delay_ms: 100,
        }
    }
}

/// Hold the body until end of stream or `max_bytes`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BodyBufferConfig {
    pub max_bytes: usize,
}

impl Default for BodyBufferConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pretty for development, JSON for log shipping.
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}
