//! Active stream: both filter chains, both next stages and the resource
//! context of one request/response exchange.
//!
//! # Responsibilities
//! - Route codec events into the receive chain and upstream responses into
//!   the send chain
//! - Serialize every entry into the chains, including re-entrant and
//!   cross-task resumptions
//! - Tear down exactly once: `on_destroy` on every filter, then release the
//!   resource context
//!
//! # Design Decisions
//! - Every call becomes a [`Command`] on a per-stream FIFO. Whoever wins the
//!   `driving` flag drains the queue under the state lock; everyone else
//!   enqueues and returns. A filter resuming itself from inside its handler
//!   therefore never deadlocks, and never runs nested.
//! - Handles hold a `Weak` reference; dropping the last [`ActiveStream`]
//!   tears the stream down even if timers are still pending
//! - Resources never outlive their owner silently: a registration the
//!   stream can no longer hold frees them on the spot, and a rejected
//!   command frees whatever it carried
//! - Handing the context to a retry stream is itself a command on the
//!   previous stream's queue, so it is safe from inside a filter handler
//! - Chain errors are reported through logs and metrics, not returned,
//!   because the submitter may not be the one applying the command

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::reusable::free_all;
use crate::buffer::{transfer, IoBuffer, ResourceContext, Reusable, StreamPools};
use crate::error::StreamError;
use crate::filter::chain::{Delivery, FilterChain, StageSink};
use crate::filter::status::{Direction, Phase};
use crate::filter::StreamFilter;
use crate::observability::metrics;
use crate::stream::handle::FilterHandle;
use crate::stream::payload::{HeaderMap, StreamEvent};

/// Relaxed ordering is enough; ids only need to be unique.
static STREAM_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a stream, used in logs and synthetic headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub fn next() -> Self {
        Self(STREAM_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Why a stream was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Both directions finished normally.
    Completed,
    /// A filter or the codec aborted the stream.
    LocalReset,
    /// The downstream peer went away.
    DownstreamClosed,
    /// Connecting to or talking to the upstream failed.
    UpstreamFailure,
    Timeout,
    /// The last owner dropped the stream without resetting it.
    Dropped,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetReason::Completed => "completed",
            ResetReason::LocalReset => "local_reset",
            ResetReason::DownstreamClosed => "downstream_closed",
            ResetReason::UpstreamFailure => "upstream_failure",
            ResetReason::Timeout => "timeout",
            ResetReason::Dropped => "dropped",
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work item applied to the stream state by the current driver.
pub(crate) enum Command {
    Event(Direction, StreamEvent),
    Resume { direction: Direction, index: usize },
    Register(Vec<Box<dyn Reusable>>),
    /// Move this stream's context into the target stream.
    HandOver(Arc<StreamShared>),
    Adopt(ResourceContext),
    Reset(ResetReason),
}

impl Command {
    /// Dispose of a command the stream refused.
    fn discard(self) {
        match self {
            Command::Register(resources) => free_all(resources),
            // Dropping the context releases it.
            Command::Adopt(ctx) => drop(ctx),
            _ => {}
        }
    }
}

struct StreamState {
    id: StreamId,
    receive: FilterChain,
    send: FilterChain,
    upstream: Box<dyn StageSink>,
    downstream: Box<dyn StageSink>,
    resources: Option<ResourceContext>,
    torn_down: bool,
}

impl StreamState {
    fn lane(&mut self, direction: Direction) -> (&mut FilterChain, Delivery<'_>) {
        let (chain, sink) = match direction {
            Direction::Receive => (&mut self.receive, &mut self.upstream),
            Direction::Send => (&mut self.send, &mut self.downstream),
        };
        (chain, Delivery::new(&mut **sink, self.resources.as_mut()))
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Event(direction, event) => {
                let id = self.id;
                let phase = event.phase();
                let (chain, mut out) = self.lane(direction);
                if let Err(err) = chain.on_event(event, &mut out) {
                    tracing::warn!(stream_id = %id, %direction, %phase, error = %err, "Event rejected");
                }
            }
            Command::Resume { direction, index } => {
                let id = self.id;
                let (chain, mut out) = self.lane(direction);
                if let Err(err) = chain.resume(index, &mut out) {
                    tracing::warn!(stream_id = %id, %direction, index, error = %err, "Resumption ignored");
                    metrics::record_invalid_resumption(direction);
                }
            }
            Command::Register(resources) => match self.resources.as_mut() {
                Some(ctx) => ctx.append(resources),
                None => {
                    tracing::debug!(stream_id = %self.id, count = resources.len(), "No context, freeing registration");
                    free_all(resources);
                }
            },
            Command::HandOver(target) => {
                let Some(ctx) = self.resources.take() else {
                    return;
                };
                tracing::debug!(
                    stream_id = %target.id(),
                    previous = %self.id,
                    resources = ctx.len(),
                    "Inheriting resources"
                );
                // A closed target refuses the context and releases it.
                let _ = target.submit(Command::Adopt(ctx));
            }
            Command::Adopt(previous) => {
                let mut previous = Some(previous);
                transfer(&mut previous, self.resources.as_mut());
            }
            Command::Reset(reason) => self.teardown(reason),
        }
    }

    fn teardown(&mut self, reason: ResetReason) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.receive.destroy(self.resources.as_mut());
        self.send.destroy(self.resources.as_mut());
        let released = self.resources.as_ref().map_or(0, ResourceContext::len);
        if let Some(ctx) = self.resources.take() {
            ctx.release();
        }

        metrics::record_stream_closed(reason);
        tracing::debug!(stream_id = %self.id, %reason, released, "Stream torn down");
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        self.teardown(ResetReason::Dropped);
    }
}

pub(crate) struct StreamShared {
    id: StreamId,
    state: Mutex<StreamState>,
    queue: Mutex<VecDeque<Command>>,
    driving: AtomicBool,
    closed: AtomicBool,
    handed_over: AtomicBool,
}

impl StreamShared {
    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn submit(&self, command: Command) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            command.discard();
            return Err(StreamError::StreamClosed);
        }
        self.queue.lock().push_back(command);
        self.drive();
        Ok(())
    }

    /// Queue resources for the context. Fails with
    /// [`StreamError::NoContext`], after freeing them, once the stream is
    /// closed or its context has been handed over.
    pub(crate) fn register(&self, resources: Vec<Box<dyn Reusable>>) -> Result<(), StreamError> {
        if self.handed_over.load(Ordering::Acquire) {
            free_all(resources);
            return Err(StreamError::NoContext);
        }
        self.submit(Command::Register(resources))
            .map_err(|_| StreamError::NoContext)
    }

    /// Queue teardown. Later submissions are rejected; commands already
    /// queued run first.
    pub(crate) fn reset(&self, reason: ResetReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.lock().push_back(Command::Reset(reason));
        self.drive();
    }

    fn drive(&self) {
        loop {
            if self
                .driving
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return;
            }

            {
                let mut state = self.state.lock();
                loop {
                    // The queue lock must not be held while a filter runs.
                    let next = self.queue.lock().pop_front();
                    let Some(command) = next else {
                        break;
                    };
                    state.apply(command);
                }
            }

            self.driving.store(false, Ordering::Release);
            // A command queued between the last pop and the store above has
            // no driver yet.
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }
}

/// One request/response exchange flowing through the sidecar.
///
/// Clones share the stream. Dropping the last clone tears it down.
#[derive(Clone)]
pub struct ActiveStream {
    shared: Arc<StreamShared>,
}

impl ActiveStream {
    /// Open a stream whose receive chain forwards to `upstream` and whose
    /// send chain forwards to `downstream`.
    pub fn new(pools: &StreamPools, upstream: Box<dyn StageSink>, downstream: Box<dyn StageSink>) -> Self {
        let id = StreamId::next();
        let state = StreamState {
            id,
            receive: FilterChain::new(Direction::Receive),
            send: FilterChain::new(Direction::Send),
            upstream,
            downstream,
            resources: Some(pools.contexts.create()),
            torn_down: false,
        };
        metrics::record_stream_opened();
        tracing::debug!(stream_id = %id, "Stream opened");

        Self {
            shared: Arc::new(StreamShared {
                id,
                state: Mutex::new(state),
                queue: Mutex::new(VecDeque::new()),
                driving: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                handed_over: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// Append a filter to the receive chain. Must not be called from inside
    /// a filter handler of the same stream.
    pub fn add_receiver_filter(&self, filter: Box<dyn StreamFilter>) -> Result<usize, StreamError> {
        self.add_filter(Direction::Receive, filter)
    }

    /// Append a filter to the send chain. Same restriction as
    /// [`add_receiver_filter`](Self::add_receiver_filter).
    pub fn add_sender_filter(&self, filter: Box<dyn StreamFilter>) -> Result<usize, StreamError> {
        self.add_filter(Direction::Send, filter)
    }

    fn add_filter(&self, direction: Direction, filter: Box<dyn StreamFilter>) -> Result<usize, StreamError> {
        if self.is_closed() {
            return Err(StreamError::StreamClosed);
        }
        let weak = Arc::downgrade(&self.shared);
        let mut state = self.shared.state.lock();
        let chain = match direction {
            Direction::Receive => &mut state.receive,
            Direction::Send => &mut state.send,
        };
        chain.add_filter(filter, |index| FilterHandle::new(weak, direction, index))
    }

    pub fn receive_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), StreamError> {
        self.event(Direction::Receive, StreamEvent::Headers { headers, end_stream })
    }

    pub fn receive_data(&self, data: IoBuffer, end_stream: bool) -> Result<(), StreamError> {
        self.event(Direction::Receive, StreamEvent::Data { data, end_stream })
    }

    pub fn receive_trailers(&self, trailers: HeaderMap) -> Result<(), StreamError> {
        self.event(Direction::Receive, StreamEvent::Trailers { trailers })
    }

    pub fn append_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), StreamError> {
        self.event(Direction::Send, StreamEvent::Headers { headers, end_stream })
    }

    pub fn append_data(&self, data: IoBuffer, end_stream: bool) -> Result<(), StreamError> {
        self.event(Direction::Send, StreamEvent::Data { data, end_stream })
    }

    pub fn append_trailers(&self, trailers: HeaderMap) -> Result<(), StreamError> {
        self.event(Direction::Send, StreamEvent::Trailers { trailers })
    }

    fn event(&self, direction: Direction, event: StreamEvent) -> Result<(), StreamError> {
        self.shared.submit(Command::Event(direction, event))
    }

    /// Resume the chain of `direction` halted at `index`.
    pub fn resume(&self, direction: Direction, index: usize) -> Result<(), StreamError> {
        self.shared.submit(Command::Resume { direction, index })
    }

    /// Hand resources to this stream's context. Fails with
    /// [`StreamError::NoContext`] once the stream is closed or its context
    /// was inherited by another stream; the resources are freed right away.
    pub fn register<I>(&self, resources: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = Box<dyn Reusable>>,
    {
        self.shared.register(resources.into_iter().collect())
    }

    /// Take over the resources of a previous attempt, e.g. when a request is
    /// retried on a new stream. The previous stream is left without context
    /// and later registrations on it fail with [`StreamError::NoContext`].
    ///
    /// The move is queued on the previous stream, so this may be called from
    /// inside a filter handler of either stream.
    pub fn inherit_resources(&self, previous: &ActiveStream) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::StreamClosed);
        }
        if Arc::ptr_eq(&self.shared, &previous.shared) {
            return Ok(());
        }
        previous.shared.handed_over.store(true, Ordering::Release);
        // A closed previous stream releases its own context at teardown.
        let _ = previous.shared.submit(Command::HandOver(Arc::clone(&self.shared)));
        Ok(())
    }

    /// Tear the stream down. Idempotent, valid while a chain is halted.
    pub fn reset(&self, reason: ResetReason) {
        self.shared.reset(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// The halted phase and filter index of one direction, if any. Must not
    /// be called from inside a filter handler of the same stream.
    pub fn halted(&self, direction: Direction) -> Option<(Phase, usize)> {
        let state = self.shared.state.lock();
        match direction {
            Direction::Receive => state.receive.halted(),
            Direction::Send => state.send.halted(),
        }
    }

    /// Resources currently owned by the stream's context; `None` once the
    /// context has been released or handed over. Same restriction as
    /// [`halted`](Self::halted).
    pub fn resources(&self) -> Option<usize> {
        self.shared.state.lock().resources.as_ref().map(ResourceContext::len)
    }
}

impl fmt::Debug for ActiveStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveStream")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
