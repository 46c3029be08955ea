//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limit)
//!     → server.rs (spawn per connection, track for drain)
//!     → connection.rs (connect upstream, L4 codec, one ActiveStream)
//!
//! Connection lifecycle:
//!     Accepted → Connected upstream → Streaming → Torn down
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - The codec only frames bytes; all policy lives in the filter chains

pub mod connection;
pub mod listener;
pub mod server;

pub use connection::{ConnectionContext, ConnectionError};
pub use listener::{Listener, ListenerError};
pub use server::SidecarServer;
