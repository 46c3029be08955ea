//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_sidecar::buffer::{on_free, Reusable};
use mesh_sidecar::config::SidecarConfig;
use mesh_sidecar::lifecycle::Shutdown;
use mesh_sidecar::net::{Listener, SidecarServer};
use mesh_sidecar::{
    DataStatus, FilterHandle, HeaderMap, HeadersStatus, IoBuffer, StageSink, StreamFilter, TrailersStatus,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// What reached a stage sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forwarded {
    Headers { end_stream: bool },
    Data { body: Vec<u8>, end_stream: bool },
    Trailers,
}

/// Stage sink recording everything it receives.
#[derive(Clone, Default)]
pub struct RecordingSink {
    seen: Arc<Mutex<Vec<Forwarded>>>,
}

impl RecordingSink {
    pub fn seen(&self) -> Vec<Forwarded> {
        self.seen.lock().unwrap().clone()
    }

    /// All forwarded data bytes concatenated.
    pub fn body(&self) -> Vec<u8> {
        self.seen()
            .into_iter()
            .filter_map(|f| match f {
                Forwarded::Data { body, .. } => Some(body),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl StageSink for RecordingSink {
    fn forward_headers(&mut self, _headers: &mut HeaderMap, end_stream: bool) {
        self.seen.lock().unwrap().push(Forwarded::Headers { end_stream });
    }

    fn forward_data(&mut self, data: &mut IoBuffer, end_stream: bool) {
        self.seen.lock().unwrap().push(Forwarded::Data {
            body: data.to_vec(),
            end_stream,
        });
    }

    fn forward_trailers(&mut self, _trailers: &mut HeaderMap) {
        self.seen.lock().unwrap().push(Forwarded::Trailers);
    }
}

/// Ordered log of filter invocations shared by several filters.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Filter answering from fixed statuses and exposing its handle.
pub struct ScriptedFilter {
    pub name: &'static str,
    pub headers: HeadersStatus,
    pub data: DataStatus,
    pub trailers: TrailersStatus,
    pub log: CallLog,
    pub handle: Arc<Mutex<Option<FilterHandle>>>,
    pub destroyed: Arc<AtomicUsize>,
}

impl ScriptedFilter {
    pub fn new(name: &'static str, log: &CallLog) -> Self {
        Self {
            name,
            headers: HeadersStatus::Continue,
            data: DataStatus::Continue,
            trailers: TrailersStatus::Continue,
            log: log.clone(),
            handle: Arc::new(Mutex::new(None)),
            destroyed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn headers(mut self, status: HeadersStatus) -> Self {
        self.headers = status;
        self
    }

    pub fn data(mut self, status: DataStatus) -> Self {
        self.data = status;
        self
    }

    pub fn trailers(mut self, status: TrailersStatus) -> Self {
        self.trailers = status;
        self
    }

    /// Handle slot and destroy counter, to keep after the filter is boxed.
    pub fn observers(&self) -> (Arc<Mutex<Option<FilterHandle>>>, Arc<AtomicUsize>) {
        (self.handle.clone(), self.destroyed.clone())
    }
}

impl StreamFilter for ScriptedFilter {
    fn set_callbacks(&mut self, handle: FilterHandle) {
        *self.handle.lock().unwrap() = Some(handle);
    }

    fn on_headers(&mut self, _headers: &mut HeaderMap, _end_stream: bool) -> HeadersStatus {
        self.log.push(format!("{}:headers", self.name));
        self.headers
    }

    fn on_data(&mut self, _data: &mut IoBuffer, _end_stream: bool) -> DataStatus {
        self.log.push(format!("{}:data", self.name));
        self.data
    }

    fn on_trailers(&mut self, _trailers: &mut HeaderMap) -> TrailersStatus {
        self.log.push(format!("{}:trailers", self.name));
        self.trailers
    }

    fn on_destroy(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

pub fn handle_of(slot: &Arc<Mutex<Option<FilterHandle>>>) -> FilterHandle {
    slot.lock().unwrap().clone().expect("filter was never registered")
}

/// Resource that counts how often it is freed.
pub fn counted_resource(counter: &Arc<AtomicUsize>) -> Box<dyn Reusable> {
    let counter = counter.clone();
    on_free(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

/// Start an upstream that echoes each connection back and closes after EOF.
pub async fn start_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut received = Vec::new();
                        if socket.read_to_end(&mut received).await.is_ok() {
                            let _ = socket.write_all(&received).await;
                        }
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start a sidecar on an ephemeral port in front of `upstream`.
pub async fn start_sidecar(
    mut config: SidecarConfig,
    upstream: SocketAddr,
) -> (SocketAddr, Arc<Shutdown>, JoinHandle<()>) {
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.upstream.address = upstream.to_string();
    config.timeouts.drain_secs = 2;

    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SidecarServer::new(&config);
    let shutdown = server.shutdown_handle();

    let task = tokio::spawn(async move {
        server.run(listener).await.unwrap();
    });

    (addr, shutdown, task)
}

/// Wait until `check` holds, polling briefly.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
