//! The "release itself" capability.

/// A resource whose lifetime is bound to a stream.
///
/// Implementors hand their storage back to wherever it came from (a pool, a
/// filter-private arena) when `free` is called. The [`ResourceContext`] that
/// owns the resource guarantees `free` runs exactly once.
///
/// [`ResourceContext`]: crate::buffer::ResourceContext
pub trait Reusable: Send {
    /// Release the resource.
    fn free(self: Box<Self>);
}

/// Wraps a closure so it runs when the owning context releases it.
///
/// Useful for filter-private scratch state that has no pool of its own.
pub fn on_free<F>(f: F) -> Box<dyn Reusable>
where
    F: FnOnce() + Send + 'static,
{
    Box::new(OnFree(f))
}

/// Free resources that have no context to wait in.
pub(crate) fn free_all<I>(resources: I)
where
    I: IntoIterator<Item = Box<dyn Reusable>>,
{
    for resource in resources {
        resource.free();
    }
}

struct OnFree<F>(F);

impl<F> Reusable for OnFree<F>
where
    F: FnOnce() + Send,
{
    fn free(self: Box<Self>) {
        (self.0)()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Reusable;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records the order in which resources are freed.
    #[derive(Clone, Default)]
    pub struct FreeLog {
        pub order: Arc<Mutex<Vec<u32>>>,
        pub count: Arc<AtomicUsize>,
    }

    impl FreeLog {
        pub fn resource(&self, id: u32) -> Box<dyn Reusable> {
            Box::new(Tracked { id, log: self.clone() })
        }

        pub fn freed(&self) -> Vec<u32> {
            self.order.lock().unwrap().clone()
        }
    }

    struct Tracked {
        id: u32,
        log: FreeLog,
    }

    impl Reusable for Tracked {
        fn free(self: Box<Self>) {
            self.log.count.fetch_add(1, Ordering::SeqCst);
            self.log.order.lock().unwrap().push(self.id);
        }
    }
}
