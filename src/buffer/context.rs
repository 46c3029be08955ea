//! Per-stream resource context.
//!
//! # Responsibilities
//! - Own every disposable resource created while a stream is processed
//! - Free each of them exactly once, in insertion order, at teardown
//! - Hand live resources over to a sibling context (internal retries)
//!
//! # Design Decisions
//! - `release` and `move_into` take `self`; after either, the context no
//!   longer exists, so it cannot be released twice
//! - `Drop` performs the release as well, so a stream that forgets to call
//!   it still frees its resources
//! - "Absent context" is modelled as `Option`, which is what callers outside
//!   any active stream hold

use std::fmt;
use std::sync::Arc;

use crate::buffer::pool::{ContextPoolInner, FreeList};
use crate::buffer::reusable::{free_all, Reusable};
use crate::error::StreamError;

/// Ordered list of resources owned by one stream.
pub struct ResourceContext {
    free_list: FreeList,
    home: Arc<ContextPoolInner>,
}

impl ResourceContext {
    pub(crate) fn from_parts(free_list: FreeList, home: Arc<ContextPoolInner>) -> Self {
        debug_assert!(free_list.is_empty());
        Self { free_list, home }
    }

    /// Add resources; they are released after those already present.
    pub fn append<I>(&mut self, resources: I)
    where
        I: IntoIterator<Item = Box<dyn Reusable>>,
    {
        self.free_list.extend(resources);
    }

    /// Add a single resource.
    pub fn push<R>(&mut self, resource: R)
    where
        R: Reusable + 'static,
    {
        self.free_list.push(Box::new(resource));
    }

    pub fn len(&self) -> usize {
        self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free_list.is_empty()
    }

    /// Free every resource in insertion order and return the context to its pool.
    pub fn release(self) {
        tracing::trace!(resources = self.free_list.len(), "Releasing resource context");
        drop(self);
    }

    /// Append this context's resources to `dst` and return this context to its pool.
    ///
    /// `dst` keeps its own resources first; ownership of ours passes to it.
    pub fn move_into(mut self, dst: &mut ResourceContext) {
        tracing::trace!(
            moved = self.free_list.len(),
            existing = dst.free_list.len(),
            "Moving resource context"
        );
        dst.free_list.append(&mut self.free_list);
    }

    fn free_all(&mut self) {
        for resource in self.free_list.drain(..) {
            resource.free();
        }
    }
}

impl Drop for ResourceContext {
    fn drop(&mut self) {
        self.free_all();
        let storage = std::mem::take(&mut self.free_list);
        self.home.recycle(storage);
    }
}

impl fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContext")
            .field("resources", &self.free_list.len())
            .finish()
    }
}

/// Append resources to a context that may be absent.
///
/// Fails with [`StreamError::NoContext`] when `context` is `None`. No context
/// is touched; the resources are freed on the spot so none of them leak.
pub fn append<I>(context: Option<&mut ResourceContext>, resources: I) -> Result<(), StreamError>
where
    I: IntoIterator<Item = Box<dyn Reusable>>,
{
    match context {
        Some(ctx) => {
            ctx.append(resources);
            Ok(())
        }
        None => {
            free_all(resources);
            Err(StreamError::NoContext)
        }
    }
}

/// Move the context in `src` into `dst`.
///
/// No-op when either side is absent. On success `src` becomes `None`.
pub fn transfer(src: &mut Option<ResourceContext>, dst: Option<&mut ResourceContext>) {
    let Some(dst) = dst else {
        return;
    };
    if let Some(ctx) = src.take() {
        ctx.move_into(dst);
    }
}
