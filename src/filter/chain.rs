//! Filter chain engine for one direction of one stream.
//!
//! # Responsibilities
//! - Invoke registered filters in order for headers, data and trailers
//! - Halt on Stop / StopAndBuffer and hold (or accumulate) the payload
//! - Re-enter at `halted + 1` on resume, and only there
//! - Keep phases ordered: events behind a halted phase wait their turn
//! - Recycle data buffers as soon as they are forwarded or merged; retire
//!   header maps into the stream's resource context
//!
//! # State Machine (per phase)
//! ```text
//! Idle ──event──▶ Running(0) ──all Continue──▶ Completed   (data: back to Idle)
//!                     │
//!                     └─Stop/StopAndBuffer at i──▶ Halted(i) ──resume(i)──▶ Running(i + 1)
//! ```
//!
//! # Design Decisions
//! - The chain is a plain `&mut` state machine; serializing re-entry is the
//!   orchestrator's job
//! - A new data chunk always starts a fresh pass at index 0, even while the
//!   data phase is halted; the pass merges accumulated content in front of
//!   the chunk when it continues past the halted filter
//! - Content accumulated by StopAndBuffer is never discarded; a plain Stop
//!   hold superseded by a newer chunk is recycled unforwarded
//! - Trailers arriving behind a StopAndBuffer hold end the body: the holding
//!   filter gets one empty chunk with `end_stream` set, and if it continues
//!   the accumulated body flows on ahead of the trailers
//! - Data buffers never pile up in the resource context, so a long-lived
//!   stream carrying many chunks holds at most the chunk in flight

use std::collections::VecDeque;
use std::fmt;

use crate::buffer::{IoBuffer, ResourceContext, Reusable};
use crate::error::StreamError;
use crate::filter::status::{Direction, Flow, Phase};
use crate::filter::StreamFilter;
use crate::observability::metrics;
use crate::stream::handle::FilterHandle;
use crate::stream::payload::{HeaderMap, StreamEvent};

/// The stage after a chain: upstream send for receive chains, downstream
/// write for send chains.
///
/// Payloads are lent. Once the sink returns, data buffers go straight back to
/// their pool and header maps are retired into the resource context. Sinks
/// may drain them.
pub trait StageSink: Send {
    fn forward_headers(&mut self, headers: &mut HeaderMap, end_stream: bool);

    fn forward_data(&mut self, data: &mut IoBuffer, end_stream: bool);

    fn forward_trailers(&mut self, trailers: &mut HeaderMap);
}

/// Where a chain pass delivers and retires payloads.
pub struct Delivery<'a> {
    sink: &'a mut dyn StageSink,
    resources: Option<&'a mut ResourceContext>,
}

impl<'a> Delivery<'a> {
    pub fn new(sink: &'a mut dyn StageSink, resources: Option<&'a mut ResourceContext>) -> Self {
        Self { sink, resources }
    }

    fn headers(&mut self, mut headers: HeaderMap, end_stream: bool) {
        self.sink.forward_headers(&mut headers, end_stream);
        self.retire(Box::new(headers));
    }

    fn data(&mut self, mut data: IoBuffer, end_stream: bool) {
        self.sink.forward_data(&mut data, end_stream);
        recycle(data);
    }

    fn trailers(&mut self, mut trailers: HeaderMap) {
        self.sink.forward_trailers(&mut trailers);
        self.retire(Box::new(trailers));
    }

    /// Hand a finished payload to the resource context. Without a context
    /// (moved away during a retry, or already released) it is freed here.
    fn retire(&mut self, resource: Box<dyn Reusable>) {
        match self.resources.as_deref_mut() {
            Some(ctx) => ctx.append([resource]),
            None => resource.free(),
        }
    }
}

/// Give a data buffer's storage back to its pool.
fn recycle(data: IoBuffer) {
    Box::new(data).free();
}

/// Progress of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    Halted(usize),
    Completed,
}

struct HeldData {
    data: IoBuffer,
    end_stream: bool,
    buffered: bool,
}

/// Ordered filters plus per-phase cursor state for one direction.
pub struct FilterChain {
    direction: Direction,
    filters: Vec<Box<dyn StreamFilter>>,
    started: bool,
    destroyed: bool,
    headers_seen: bool,
    trailers_seen: bool,
    headers: PhaseState,
    held_headers: Option<(HeaderMap, bool)>,
    data: PhaseState,
    held_data: Option<HeldData>,
    trailers: PhaseState,
    held_trailers: Option<HeaderMap>,
    deferred: VecDeque<StreamEvent>,
}

impl FilterChain {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            filters: Vec::new(),
            started: false,
            destroyed: false,
            headers_seen: false,
            trailers_seen: false,
            headers: PhaseState::Idle,
            held_headers: None,
            data: PhaseState::Idle,
            held_data: None,
            trailers: PhaseState::Idle,
            held_trailers: None,
            deferred: VecDeque::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Register a filter at the end of the chain.
    ///
    /// `callbacks` receives the filter's index and builds the handle passed to
    /// [`StreamFilter::set_callbacks`]. Fails once the first event arrived.
    pub fn add_filter<F>(
        &mut self,
        mut filter: Box<dyn StreamFilter>,
        callbacks: F,
    ) -> Result<usize, StreamError>
    where
        F: FnOnce(usize) -> FilterHandle,
    {
        if self.started || self.destroyed {
            return Err(StreamError::ChainSealed {
                direction: self.direction,
            });
        }
        let index = self.filters.len();
        filter.set_callbacks(callbacks(index));
        tracing::trace!(direction = %self.direction, index, filter = filter.name(), "Filter registered");
        self.filters.push(filter);
        Ok(index)
    }

    pub fn state(&self, phase: Phase) -> PhaseState {
        match phase {
            Phase::Headers => self.headers,
            Phase::Data => self.data,
            Phase::Trailers => self.trailers,
        }
    }

    /// The phase currently waiting for a resume, if any. At most one phase
    /// can be halted since later phases wait behind it.
    pub fn halted(&self) -> Option<(Phase, usize)> {
        [Phase::Headers, Phase::Data, Phase::Trailers]
            .into_iter()
            .find_map(|phase| match self.state(phase) {
                PhaseState::Halted(index) => Some((phase, index)),
                _ => None,
            })
    }

    /// Number of events waiting behind a halted phase.
    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Bytes currently held by a halted data phase.
    pub fn buffered_bytes(&self) -> usize {
        self.held_data.as_ref().map_or(0, |held| held.data.len())
    }

    /// Feed one event into the chain.
    pub fn on_event(&mut self, event: StreamEvent, out: &mut Delivery<'_>) -> Result<(), StreamError> {
        if self.destroyed {
            out.retire(event.into_resource());
            return Err(StreamError::StreamClosed);
        }
        self.started = true;

        let phase = event.phase();
        let repeated = match phase {
            Phase::Headers => std::mem::replace(&mut self.headers_seen, true),
            Phase::Trailers => std::mem::replace(&mut self.trailers_seen, true),
            Phase::Data => false,
        };
        if repeated {
            out.retire(event.into_resource());
            return Err(StreamError::UnexpectedEvent {
                direction: self.direction,
                phase,
            });
        }

        if !self.deferred.is_empty() || self.blocked(phase) {
            tracing::trace!(direction = %self.direction, %phase, "Event deferred behind halted phase");
            self.deferred.push_back(event);
            if phase == Phase::Trailers {
                self.drain_deferred(out);
            }
            return Ok(());
        }

        self.dispatch(event, out);
        Ok(())
    }

    /// Resume the chain halted at `index`, re-entering at `index + 1`.
    ///
    /// Fails with [`StreamError::InvalidResumption`] and leaves the chain
    /// untouched if no phase is halted at `index`.
    pub fn resume(&mut self, index: usize, out: &mut Delivery<'_>) -> Result<(), StreamError> {
        if self.destroyed {
            return Err(StreamError::StreamClosed);
        }

        let invalid = StreamError::InvalidResumption {
            direction: self.direction,
            index,
        };
        let phase = match self.halted() {
            Some((phase, halted)) if halted == index => phase,
            _ => return Err(invalid),
        };

        tracing::trace!(direction = %self.direction, %phase, index, "Resuming filter chain");
        match phase {
            Phase::Headers => {
                let Some((headers, end_stream)) = self.held_headers.take() else {
                    return Err(invalid);
                };
                self.headers = PhaseState::Idle;
                self.run_headers(index + 1, headers, end_stream, out);
            }
            Phase::Data => {
                let Some(held) = self.held_data.take() else {
                    return Err(invalid);
                };
                self.data = PhaseState::Idle;
                self.run_data(index + 1, held.data, held.end_stream, out);
            }
            Phase::Trailers => {
                let Some(trailers) = self.held_trailers.take() else {
                    return Err(invalid);
                };
                self.trailers = PhaseState::Idle;
                self.run_trailers(index + 1, trailers, out);
            }
        }

        self.drain_deferred(out);
        Ok(())
    }

    /// Notify every filter that the stream is going away and retire held and
    /// deferred payloads. Safe to call more than once.
    pub fn destroy(&mut self, resources: Option<&mut ResourceContext>) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        for filter in self.filters.iter_mut() {
            filter.on_destroy();
        }

        let mut leftovers: Vec<Box<dyn Reusable>> = Vec::new();
        if let Some((headers, _)) = self.held_headers.take() {
            leftovers.push(Box::new(headers));
        }
        if let Some(held) = self.held_data.take() {
            leftovers.push(Box::new(held.data));
        }
        if let Some(trailers) = self.held_trailers.take() {
            leftovers.push(Box::new(trailers));
        }
        leftovers.extend(self.deferred.drain(..).map(StreamEvent::into_resource));

        tracing::debug!(
            direction = %self.direction,
            filters = self.filters.len(),
            halted = ?self.halted(),
            retired = leftovers.len(),
            "Filter chain destroyed"
        );

        if let Some(ctx) = resources {
            ctx.append(leftovers);
        }
    }

    fn blocked(&self, phase: Phase) -> bool {
        let headers_halted = matches!(self.headers, PhaseState::Halted(_));
        let data_halted = matches!(self.data, PhaseState::Halted(_));
        match phase {
            Phase::Headers => false,
            Phase::Data => headers_halted,
            Phase::Trailers => headers_halted || data_halted,
        }
    }

    fn dispatch(&mut self, event: StreamEvent, out: &mut Delivery<'_>) {
        match event {
            StreamEvent::Headers { headers, end_stream } => self.run_headers(0, headers, end_stream, out),
            StreamEvent::Data { data, end_stream } => self.run_data(0, data, end_stream, out),
            StreamEvent::Trailers { trailers } => self.run_trailers(0, trailers, out),
        }
    }

    fn drain_deferred(&mut self, out: &mut Delivery<'_>) {
        while let Some(phase) = self.deferred.front().map(StreamEvent::phase) {
            if self.blocked(phase) {
                if phase == Phase::Trailers && self.end_buffered_body(out) {
                    continue;
                }
                break;
            }
            if let Some(event) = self.deferred.pop_front() {
                self.dispatch(event, out);
            }
        }
    }

    fn halt(&mut self, phase: Phase, index: usize, flow: Flow) {
        let state = PhaseState::Halted(index);
        match phase {
            Phase::Headers => self.headers = state,
            Phase::Data => self.data = state,
            Phase::Trailers => self.trailers = state,
        }
        tracing::trace!(
            direction = %self.direction,
            %phase,
            index,
            filter = self.filters[index].name(),
            buffered = flow == Flow::StopAndBuffer,
            "Filter chain halted"
        );
        metrics::record_filter_halt(self.direction, phase);
    }

    fn run_headers(&mut self, start: usize, mut headers: HeaderMap, end_stream: bool, out: &mut Delivery<'_>) {
        for index in start..self.filters.len() {
            let flow = Flow::from(self.filters[index].on_headers(&mut headers, end_stream));
            if flow != Flow::Continue {
                self.held_headers = Some((headers, end_stream));
                self.halt(Phase::Headers, index, flow);
                return;
            }
        }
        self.headers = PhaseState::Completed;
        out.headers(headers, end_stream);
    }

    fn run_trailers(&mut self, start: usize, mut trailers: HeaderMap, out: &mut Delivery<'_>) {
        for index in start..self.filters.len() {
            let flow = Flow::from(self.filters[index].on_trailers(&mut trailers));
            if flow != Flow::Continue {
                self.held_trailers = Some(trailers);
                self.halt(Phase::Trailers, index, flow);
                return;
            }
        }
        self.trailers = PhaseState::Completed;
        out.trailers(trailers);
    }

    fn run_data(&mut self, start: usize, mut data: IoBuffer, mut end_stream: bool, out: &mut Delivery<'_>) {
        // Set only on a fresh pass arriving while an earlier chunk is held.
        let mut pending = match self.data {
            PhaseState::Halted(index) => Some(index),
            _ => None,
        };

        for index in start..self.filters.len() {
            let flow = Flow::from(self.filters[index].on_data(&mut data, end_stream));
            if flow != Flow::Continue {
                self.hold_data(data, end_stream, flow == Flow::StopAndBuffer);
                self.halt(Phase::Data, index, flow);
                return;
            }
            if pending == Some(index) {
                pending = None;
                end_stream = self.merge_held(&mut data, end_stream);
                self.data = PhaseState::Idle;
            }
        }

        if pending.is_some() {
            end_stream = self.merge_held(&mut data, end_stream);
        }
        self.data = PhaseState::Idle;
        out.data(data, end_stream);
    }

    /// Put held content in front of `data` once the pass has moved past the
    /// filter that was holding it. Returns the combined end-of-stream flag.
    fn merge_held(&mut self, data: &mut IoBuffer, end_stream: bool) -> bool {
        let Some(held) = self.held_data.take() else {
            return end_stream;
        };
        if !held.buffered {
            tracing::debug!(
                direction = %self.direction,
                bytes = held.data.len(),
                "Held data chunk superseded by newer chunk"
            );
            recycle(held.data);
            return end_stream;
        }

        let mut merged = held.data;
        merged.append(data);
        recycle(std::mem::replace(data, merged));
        end_stream || held.end_stream
    }

    fn hold_data(&mut self, mut data: IoBuffer, end_stream: bool, buffered: bool) {
        self.held_data = match self.held_data.take() {
            Some(mut held) if held.buffered => {
                held.data.append(&mut data);
                held.end_stream = end_stream;
                recycle(data);
                Some(held)
            }
            Some(stale) => {
                tracing::debug!(
                    direction = %self.direction,
                    bytes = stale.data.len(),
                    "Held data chunk superseded by newer chunk"
                );
                recycle(stale.data);
                Some(HeldData {
                    data,
                    end_stream,
                    buffered,
                })
            }
            None => Some(HeldData {
                data,
                end_stream,
                buffered,
            }),
        };
    }

    /// Tell the filter accumulating the body that no more data will come,
    /// because trailers are waiting behind it.
    ///
    /// Returns true if the filter continued and the body moved on, which may
    /// unblock the trailers.
    fn end_buffered_body(&mut self, out: &mut Delivery<'_>) -> bool {
        if matches!(self.headers, PhaseState::Halted(_)) {
            return false;
        }
        let PhaseState::Halted(index) = self.data else {
            return false;
        };
        if !self.held_data.as_ref().is_some_and(|held| held.buffered) {
            return false;
        }

        let mut tail = IoBuffer::detached(b"");
        let flow = Flow::from(self.filters[index].on_data(&mut tail, true));
        if flow != Flow::Continue {
            return false;
        }
        let Some(mut held) = self.held_data.take() else {
            return false;
        };
        held.data.append(&mut tail);
        recycle(tail);

        tracing::trace!(
            direction = %self.direction,
            index,
            bytes = held.data.len(),
            "Trailers ended buffered body"
        );
        self.data = PhaseState::Idle;
        self.run_data(index + 1, held.data, held.end_stream, out);
        true
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("direction", &self.direction)
            .field("filters", &self.filters.len())
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("trailers", &self.trailers)
            .field("deferred", &self.deferred.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
