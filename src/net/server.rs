//! Sidecar server: accept loop, per-connection tasks and shutdown drain.
//!
//! # Responsibilities
//! - Build the process-wide pools and filter factory from configuration
//! - Accept downstream connections and spawn one task per connection
//! - Track open connections and drain them on shutdown
//!
//! # Design Decisions
//! - Transient accept errors are logged and the loop keeps going
//! - Drain waits on a notification instead of polling

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::Instrument;

use crate::buffer::StreamPools;
use crate::config::SidecarConfig;
use crate::filter::builtin::FilterFactory;
use crate::lifecycle::Shutdown;
use crate::net::connection::{serve_connection, ConnectionContext};
use crate::net::listener::{Listener, ListenerError};

/// Counts open connections so shutdown can wait for them.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
    idle: Arc<Notify>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection. The count drops when the guard does.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            tracker: self.clone(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Resolve once no connection is open.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a connection counted while alive.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.active_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// The sidecar data plane.
pub struct SidecarServer {
    context: Arc<ConnectionContext>,
    shutdown: Arc<Shutdown>,
    tracker: ConnectionTracker,
    drain_timeout: Duration,
}

impl SidecarServer {
    pub fn new(config: &SidecarConfig) -> Self {
        let idle_timeout = match config.timeouts.idle_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let context = ConnectionContext {
            pools: Arc::new(StreamPools::new(&config.pool)),
            filters: FilterFactory::new(&config.filters),
            upstream: config.upstream.address.clone(),
            connect_timeout: Duration::from_secs(config.timeouts.connect_secs),
            idle_timeout,
        };

        Self {
            context: Arc::new(context),
            shutdown: Arc::new(Shutdown::new()),
            tracker: ConnectionTracker::new(),
            drain_timeout: Duration::from_secs(config.timeouts.drain_secs),
        }
    }

    /// Handle used to stop [`run`](Self::run) from another task.
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    pub fn pools(&self) -> Arc<StreamPools> {
        Arc::clone(&self.context.pools)
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept and proxy connections until shutdown, then drain.
    pub async fn run(self, listener: Listener) -> Result<(), ListenerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(
            address = %local_addr,
            upstream = %self.context.upstream,
            filters = !self.context.filters.is_empty(),
            "Sidecar serving"
        );

        while !self.shutdown.is_triggered() {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer, permit)) => {
                        let _ = socket.set_nodelay(true);
                        let guard = self.tracker.track();
                        let context = Arc::clone(&self.context);
                        tokio::spawn(
                            async move {
                                let _permit = permit;
                                let _guard = guard;
                                if let Err(err) = serve_connection(socket, peer, context).await {
                                    tracing::warn!(error = %err, "Connection closed with error");
                                }
                            }
                            .instrument(connection_span(peer)),
                        );
                    }
                    Err(ListenerError::Accept(err)) => {
                        tracing::warn!(error = %err, "Accept failed");
                    }
                    Err(err) => return Err(err),
                },
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        let open = self.tracker.active_count();
        tracing::info!(open, timeout_secs = self.drain_timeout.as_secs(), "Draining connections");
        match tokio::time::timeout(self.drain_timeout, self.tracker.wait_idle()).await {
            Ok(()) => tracing::info!("All connections drained"),
            Err(_) => tracing::warn!(
                remaining = self.tracker.active_count(),
                "Drain timeout elapsed, abandoning open connections"
            ),
        }
    }
}

fn connection_span(peer: SocketAddr) -> tracing::Span {
    tracing::info_span!("connection", peer = %peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let first = tracker.track();
        let second = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(first);
        assert_eq!(tracker.active_count(), 1);
        drop(second);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_after_last_guard() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::task::yield_now().await;
        drop(guard);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
