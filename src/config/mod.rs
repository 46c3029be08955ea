//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → SidecarConfig (validated, immutable)
//!     → pool sizing to StreamPools, filter lists to FilterFactory,
//!       listener/upstream/timeouts to the server
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    FilterChainConfig, FilterConfig, ListenerConfig, ObservabilityConfig, PoolConfig, SidecarConfig,
    TimeoutConfig, UpstreamConfig,
};
