//! Resource context and pool behaviour under concurrent streams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use mesh_sidecar::buffer::{append, transfer, ResourceContext, StreamPools};
use mesh_sidecar::config::PoolConfig;
use mesh_sidecar::{ActiveStream, IoBuffer, ResetReason, StreamError};

mod common;
use common::{counted_resource, RecordingSink};

fn pools(shards: usize, prewarm: usize) -> Arc<StreamPools> {
    Arc::new(StreamPools::new(&PoolConfig {
        shards,
        prewarm_per_shard: prewarm,
        max_idle_per_shard: 64,
        context_capacity: 4,
        buffer_capacity: 256,
        buffer_prewarm_per_shard: prewarm,
    }))
}

#[test]
fn test_concurrent_streams_free_each_resource_once() {
    const THREADS: usize = 8;
    const STREAMS_PER_THREAD: usize = 50;
    const RESOURCES_PER_STREAM: usize = 5;

    let pools = pools(4, 2);
    let freed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let pools = Arc::clone(&pools);
            let freed = Arc::clone(&freed);
            thread::spawn(move || {
                for _ in 0..STREAMS_PER_THREAD {
                    let mut ctx = pools.contexts.create();
                    assert!(ctx.is_empty());
                    ctx.append((0..RESOURCES_PER_STREAM).map(|_| counted_resource(&freed)));
                    ctx.push(pools.buffers.take_from(b"payload"));
                    ctx.release();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(
        freed.load(Ordering::SeqCst),
        THREADS * STREAMS_PER_THREAD * RESOURCES_PER_STREAM
    );
    let contexts = pools.contexts.stats();
    assert_eq!(contexts.hits + contexts.misses, (THREADS * STREAMS_PER_THREAD) as u64);
    assert_eq!(
        contexts.recycled + contexts.discarded,
        (THREADS * STREAMS_PER_THREAD) as u64
    );
}

#[test]
fn test_exhausted_pool_still_creates_contexts() {
    let pools = pools(1, 0);
    let held: Vec<ResourceContext> = (0..32).map(|_| pools.contexts.create()).collect();

    assert!(held.iter().all(ResourceContext::is_empty));
    assert_eq!(pools.contexts.stats().misses, 32);

    drop(held);
    assert_eq!(pools.contexts.stats().idle, 32);
}

#[test]
fn test_pooled_buffers_return_through_context() {
    let pools = pools(1, 0);
    let mut ctx = pools.contexts.create();
    ctx.push(pools.buffers.take(0));
    ctx.push(pools.buffers.take(1024));
    assert_eq!(pools.buffers.stats().idle, 0);

    ctx.release();

    assert_eq!(pools.buffers.stats().idle, 2);
    let reused = pools.buffers.take(1000);
    assert!(reused.capacity() >= 1024);
    assert_eq!(pools.buffers.stats().hits, 1);
}

#[test]
fn test_retry_moves_resources_to_new_context() {
    let pools = pools(1, 1);
    let freed = Arc::new(AtomicUsize::new(0));

    let mut first = Some(pools.contexts.create());
    if let Some(ctx) = first.as_mut() {
        ctx.append([counted_resource(&freed), counted_resource(&freed)]);
    }
    let mut retry = pools.contexts.create();
    retry.append([counted_resource(&freed)]);

    transfer(&mut first, Some(&mut retry));
    transfer(&mut first, Some(&mut retry));
    assert!(first.is_none());
    assert_eq!(retry.len(), 3);
    assert_eq!(freed.load(Ordering::SeqCst), 0);

    retry.release();
    assert_eq!(freed.load(Ordering::SeqCst), 3);
}

#[test]
fn test_append_without_context_reports_no_context() {
    let freed = Arc::new(AtomicUsize::new(0));
    assert_eq!(append(None, [counted_resource(&freed)]), Err(StreamError::NoContext));
    assert_eq!(freed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_long_stream_keeps_context_bounded() {
    let pools = pools(1, 0);
    let upstream = RecordingSink::default();
    let stream = ActiveStream::new(&pools, Box::new(upstream.clone()), Box::new(RecordingSink::default()));

    for _ in 0..10_000 {
        let mut chunk = pools.buffers.take(0);
        chunk.extend_from_slice(b"x");
        stream.receive_data(chunk, false).unwrap();
    }
    stream.receive_data(IoBuffer::detached("!"), true).unwrap();

    assert_eq!(stream.resources(), Some(0));
    let buffers = pools.buffers.stats();
    assert_eq!(buffers.misses, 1);
    assert_eq!(buffers.hits, 9_999);
    assert_eq!(buffers.idle, 1);

    stream.reset(ResetReason::Completed);
    assert_eq!(upstream.body().len(), 10_001);
}

#[test]
fn test_retried_stream_frees_late_registrations_once() {
    let pools = pools(1, 0);
    let freed = Arc::new(AtomicUsize::new(0));
    let first = ActiveStream::new(&pools, Box::new(RecordingSink::default()), Box::new(RecordingSink::default()));
    let retry = ActiveStream::new(&pools, Box::new(RecordingSink::default()), Box::new(RecordingSink::default()));
    first.register([counted_resource(&freed)]).unwrap();

    retry.inherit_resources(&first).unwrap();
    assert_eq!(retry.resources(), Some(1));

    // The first attempt no longer owns a context to hold this.
    assert_eq!(first.register([counted_resource(&freed)]), Err(StreamError::NoContext));
    assert_eq!(freed.load(Ordering::SeqCst), 1);

    first.reset(ResetReason::UpstreamFailure);
    retry.reset(ResetReason::Completed);
    assert_eq!(freed.load(Ordering::SeqCst), 2);
}
