//! Layer-4 passthrough codec: one TCP connection is one stream.
//!
//! # Responsibilities
//! - Connect the upstream for every accepted downstream connection
//! - Turn each side's socket into stream events: synthetic headers first,
//!   then one data event per read, end of stream on EOF
//! - Write chain output back to the sockets through channel sinks
//! - Tear the stream down when both directions finish or anything fails
//!
//! # Data Flow
//! ```text
//! downstream read ─▶ receive_data ─▶ receive chain ─▶ ChannelSink ─▶ writer ─▶ upstream socket
//! upstream read   ─▶ append_data  ─▶ send chain    ─▶ ChannelSink ─▶ writer ─▶ downstream socket
//! ```
//!
//! # Design Decisions
//! - Sinks never block: chain output goes into an unbounded channel and a
//!   writer future owns the socket half
//! - Reads land directly in pooled buffers, which go back to the pool as
//!   soon as the chain has forwarded them
//! - Idle detection is per connection: any byte read or written in either
//!   direction resets one shared clock, and a watchdog resets the stream
//!   only when the whole connection has been quiet for `idle_timeout`
//! - Headers carry connection metadata only; nothing is added on the wire

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::buffer::{IoBuffer, StreamPools};
use crate::error::StreamError;
use crate::filter::builtin::FilterFactory;
use crate::filter::chain::StageSink;
use crate::filter::status::Direction;
use crate::observability::metrics;
use crate::stream::{ActiveStream, HeaderMap, InvalidHeader, ResetReason};

pub const HEADER_STREAM_ID: &str = "x-stream-id";
pub const HEADER_DOWNSTREAM_ADDR: &str = "x-downstream-addr";
pub const HEADER_UPSTREAM_ADDR: &str = "x-upstream-addr";

/// Why a connection ended early.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connect to upstream {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to upstream {address} timed out")]
    ConnectTimeout { address: String },

    #[error("downstream i/o failed: {0}")]
    Downstream(#[source] io::Error),

    #[error("upstream i/o failed: {0}")]
    Upstream(#[source] io::Error),

    #[error("no traffic for {0:?}")]
    Idle(Duration),

    #[error("synthetic header rejected: {0}")]
    Header(#[from] InvalidHeader),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl ConnectionError {
    pub fn reset_reason(&self) -> ResetReason {
        match self {
            ConnectionError::Connect { .. }
            | ConnectionError::ConnectTimeout { .. }
            | ConnectionError::Upstream(_) => ResetReason::UpstreamFailure,
            ConnectionError::Downstream(_) => ResetReason::DownstreamClosed,
            ConnectionError::Idle(_) => ResetReason::Timeout,
            ConnectionError::Header(_) | ConnectionError::Stream(_) => ResetReason::LocalReset,
        }
    }
}

/// Everything a connection needs, shared by all connections of a server.
pub struct ConnectionContext {
    pub pools: Arc<StreamPools>,
    pub filters: FilterFactory,
    pub upstream: String,
    pub connect_timeout: Duration,
    /// `None` disables idle detection.
    pub idle_timeout: Option<Duration>,
}

enum Frame {
    Data(Bytes),
    End,
}

/// Chain output for one socket.
struct ChannelSink {
    direction: Direction,
    tx: mpsc::UnboundedSender<Frame>,
    ended: bool,
}

impl ChannelSink {
    fn new(direction: Direction) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            direction,
            tx,
            ended: false,
        };
        (sink, rx)
    }

    fn send(&mut self, frame: Frame) {
        if self.ended {
            return;
        }
        if matches!(frame, Frame::End) {
            self.ended = true;
        }
        // The writer is gone only when the connection is already failing.
        let _ = self.tx.send(frame);
    }
}

impl StageSink for ChannelSink {
    fn forward_headers(&mut self, headers: &mut HeaderMap, end_stream: bool) {
        tracing::trace!(
            direction = %self.direction,
            stream_id = headers.get(HEADER_STREAM_ID).unwrap_or("-"),
            headers = headers.len(),
            "Headers passed the chain"
        );
        if end_stream {
            self.send(Frame::End);
        }
    }

    fn forward_data(&mut self, data: &mut IoBuffer, end_stream: bool) {
        if !data.is_empty() {
            metrics::record_connection_bytes(self.direction, data.len());
            self.send(Frame::Data(data.drain_to_bytes()));
        }
        if end_stream {
            self.send(Frame::End);
        }
    }

    fn forward_trailers(&mut self, _trailers: &mut HeaderMap) {
        self.send(Frame::End);
    }
}

/// Proxy one downstream connection until both directions are finished.
pub async fn serve_connection(
    downstream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ConnectionContext>,
) -> Result<(), ConnectionError> {
    let upstream = connect_upstream(&ctx).await?;
    let upstream_addr = upstream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| ctx.upstream.clone());

    let (to_upstream, upstream_rx) = ChannelSink::new(Direction::Receive);
    let (to_downstream, downstream_rx) = ChannelSink::new(Direction::Send);
    let stream = ActiveStream::new(&ctx.pools, Box::new(to_upstream), Box::new(to_downstream));
    let stream_id = stream.id();

    let outcome = run_stream(
        &stream,
        downstream,
        upstream,
        peer,
        &upstream_addr,
        upstream_rx,
        downstream_rx,
        &ctx,
    )
    .await;
    if let Err(err) = outcome {
        tracing::debug!(%stream_id, error = %err, "Connection failed");
        stream.reset(err.reset_reason());
        return Err(err);
    }

    tracing::debug!(%stream_id, peer = %peer, upstream = %upstream_addr, "Connection finished");
    stream.reset(ResetReason::Completed);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_stream(
    stream: &ActiveStream,
    downstream: TcpStream,
    upstream: TcpStream,
    peer: SocketAddr,
    upstream_addr: &str,
    upstream_rx: mpsc::UnboundedReceiver<Frame>,
    downstream_rx: mpsc::UnboundedReceiver<Frame>,
    ctx: &ConnectionContext,
) -> Result<(), ConnectionError> {
    ctx.filters.install(stream)?;

    let stream_id = stream.id().to_string();
    let peer_addr = peer.to_string();
    let request_headers = HeaderMap::from_pairs([
        (HEADER_STREAM_ID, stream_id.as_str()),
        (HEADER_DOWNSTREAM_ADDR, peer_addr.as_str()),
        (HEADER_UPSTREAM_ADDR, upstream_addr),
    ])?;
    let response_headers = HeaderMap::from_pairs([(HEADER_STREAM_ID, stream_id.as_str())])?;
    stream.receive_headers(request_headers, false)?;
    stream.append_headers(response_headers, false)?;

    let (down_read, down_write) = downstream.into_split();
    let (up_read, up_write) = upstream.into_split();
    let activity = Activity::new();

    let transfer = async {
        tokio::try_join!(
            async {
                read_side(down_read, stream, &ctx.pools, Direction::Receive, &activity)
                    .await
                    .map_err(ConnectionError::Downstream)
            },
            async {
                read_side(up_read, stream, &ctx.pools, Direction::Send, &activity)
                    .await
                    .map_err(ConnectionError::Upstream)
            },
            async {
                write_side(up_write, upstream_rx, &activity)
                    .await
                    .map_err(ConnectionError::Upstream)
            },
            async {
                write_side(down_write, downstream_rx, &activity)
                    .await
                    .map_err(ConnectionError::Downstream)
            },
        )
    };

    tokio::select! {
        finished = transfer => finished.map(|_| ()),
        idle = idle_watchdog(&activity, ctx.idle_timeout) => Err(idle),
    }
}

/// When the connection last moved bytes, in either direction.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Resolve once the connection has been quiet for `limit`; never without one.
async fn idle_watchdog(activity: &Activity, limit: Option<Duration>) -> ConnectionError {
    let Some(limit) = limit else {
        return std::future::pending().await;
    };
    loop {
        let deadline = activity.last() + limit;
        if Instant::now() >= deadline {
            return ConnectionError::Idle(limit);
        }
        tokio::time::sleep_until(deadline).await;
    }
}

async fn connect_upstream(ctx: &ConnectionContext) -> Result<TcpStream, ConnectionError> {
    match tokio::time::timeout(ctx.connect_timeout, TcpStream::connect(&ctx.upstream)).await {
        Ok(Ok(socket)) => {
            // Latency matters more than packet count for proxied traffic.
            let _ = socket.set_nodelay(true);
            Ok(socket)
        }
        Ok(Err(source)) => Err(ConnectionError::Connect {
            address: ctx.upstream.clone(),
            source,
        }),
        Err(_) => Err(ConnectionError::ConnectTimeout {
            address: ctx.upstream.clone(),
        }),
    }
}

/// Feed one socket into one chain until EOF.
async fn read_side(
    mut reader: OwnedReadHalf,
    stream: &ActiveStream,
    pools: &StreamPools,
    direction: Direction,
    activity: &Activity,
) -> io::Result<()> {
    loop {
        let mut buf = pools.buffers.take(0);
        let read = reader.read_buf(buf.bytes_mut()).await?;
        activity.touch();
        let end_stream = read == 0;

        let delivered = match direction {
            Direction::Receive => stream.receive_data(buf, end_stream),
            Direction::Send => stream.append_data(buf, end_stream),
        };
        if delivered.is_err() || end_stream {
            return Ok(());
        }
    }
}

/// Drain chain output into one socket until end of stream.
async fn write_side(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    activity: &Activity,
) -> io::Result<()> {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Data(bytes) => {
                writer.write_all(&bytes).await?;
                activity.touch();
            }
            Frame::End => {
                writer.shutdown().await?;
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_sends_end_once() {
        let (mut sink, mut rx) = ChannelSink::new(Direction::Receive);

        sink.forward_data(&mut IoBuffer::detached("abc"), true);
        sink.forward_trailers(&mut HeaderMap::new());

        assert!(matches!(rx.try_recv(), Ok(Frame::Data(bytes)) if &bytes[..] == b"abc"));
        assert!(matches!(rx.try_recv(), Ok(Frame::End)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sink_drains_forwarded_buffer() {
        let (mut sink, _rx) = ChannelSink::new(Direction::Send);
        let mut data = IoBuffer::detached("payload");

        sink.forward_data(&mut data, false);

        assert!(data.is_empty());
    }

    #[test]
    fn test_error_maps_to_reset_reason() {
        let err = ConnectionError::Idle(Duration::from_secs(1));
        assert_eq!(err.reset_reason(), ResetReason::Timeout);

        let err = ConnectionError::Downstream(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(err.reset_reason(), ResetReason::DownstreamClosed);
    }

    #[tokio::test]
    async fn test_watchdog_fires_only_after_quiet_period() {
        let activity = Activity::new();
        let watchdog = idle_watchdog(&activity, Some(Duration::from_millis(200)));
        tokio::pin!(watchdog);

        for _ in 0..5 {
            tokio::select! {
                _ = &mut watchdog => panic!("watchdog fired while bytes were moving"),
                _ = tokio::time::sleep(Duration::from_millis(100)) => activity.touch(),
            }
        }

        let err = tokio::time::timeout(Duration::from_secs(1), watchdog).await.unwrap();
        assert!(matches!(err, ConnectionError::Idle(limit) if limit == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_watchdog_without_limit_never_fires() {
        let activity = Activity::new();
        let outcome = tokio::time::timeout(Duration::from_millis(50), idle_watchdog(&activity, None)).await;
        assert!(outcome.is_err());
    }
}
