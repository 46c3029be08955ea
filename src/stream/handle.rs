//! Callback handle given to each registered filter.

use std::fmt;
use std::sync::Weak;

use crate::buffer::reusable::free_all;
use crate::buffer::Reusable;
use crate::error::StreamError;
use crate::filter::status::Direction;
use crate::stream::active::{Command, ResetReason, StreamId, StreamShared};

/// Identifies one filter position in one stream.
///
/// Cheap to clone and safe to move to other tasks. The handle does not keep
/// the stream alive; once the stream is torn down every call fails with
/// [`StreamError::NoContext`].
#[derive(Clone)]
pub struct FilterHandle {
    stream: Weak<StreamShared>,
    direction: Direction,
    index: usize,
}

impl FilterHandle {
    pub(crate) fn new(stream: Weak<StreamShared>, direction: Direction, index: usize) -> Self {
        Self {
            stream,
            direction,
            index,
        }
    }

    /// A handle bound to no stream, for driving a chain directly.
    pub fn detached(direction: Direction, index: usize) -> Self {
        Self::new(Weak::new(), direction, index)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream.upgrade().map(|shared| shared.id())
    }

    /// Continue the chain after this filter.
    ///
    /// The resumption is queued; if no other caller is driving the stream it
    /// runs before this returns. A resumption that does not match the halted
    /// position is logged and ignored.
    pub fn resume(&self) -> Result<(), StreamError> {
        self.submit(Command::Resume {
            direction: self.direction,
            index: self.index,
        })
    }

    /// Hand resources to the stream's context for release at teardown.
    ///
    /// Without a context to hold them (stream gone, closed or handed over)
    /// the resources are freed immediately and [`StreamError::NoContext`] is
    /// returned.
    pub fn register<I>(&self, resources: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = Box<dyn Reusable>>,
    {
        let resources: Vec<_> = resources.into_iter().collect();
        match self.stream.upgrade() {
            Some(shared) => shared.register(resources),
            None => {
                free_all(resources);
                Err(StreamError::NoContext)
            }
        }
    }

    /// Tear the stream down from inside a filter.
    pub fn reset(&self, reason: ResetReason) -> Result<(), StreamError> {
        let shared = self.stream.upgrade().ok_or(StreamError::NoContext)?;
        shared.reset(reason);
        Ok(())
    }

    fn submit(&self, command: Command) -> Result<(), StreamError> {
        let shared = self.stream.upgrade().ok_or(StreamError::NoContext)?;
        shared.submit(command).map_err(|_| StreamError::NoContext)
    }
}

impl fmt::Debug for FilterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterHandle")
            .field("stream", &self.stream_id())
            .field("direction", &self.direction)
            .field("index", &self.index)
            .finish()
    }
}
