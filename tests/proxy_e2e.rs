//! End-to-end tests through a real listener and upstream.

use std::collections::BTreeMap;
use std::time::Duration;

use mesh_sidecar::config::schema::{BodyBufferConfig, FaultInjectConfig, FilterConfig, HeaderInjectConfig};
use mesh_sidecar::SidecarConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

mod common;
use common::{start_echo_upstream, start_sidecar};

async fn round_trip(proxy: std::net::SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(payload).await.unwrap();
    client.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    echoed
}

#[tokio::test]
async fn test_bytes_pass_through_without_filters() {
    let upstream = start_echo_upstream().await;
    let (proxy, shutdown, task) = start_sidecar(SidecarConfig::default(), upstream).await;

    let echoed = round_trip(proxy, b"plain passthrough").await;
    assert_eq!(echoed, b"plain passthrough");

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bytes_survive_a_full_filter_chain() {
    let upstream = start_echo_upstream().await;
    let mut config = SidecarConfig::default();
    let mut headers = BTreeMap::new();
    headers.insert("x-mesh".to_string(), "on".to_string());
    config.filters.receive = vec![
        FilterConfig::HeaderInject(HeaderInjectConfig { headers }),
        FilterConfig::FaultInject(FaultInjectConfig {
            percentage: 100.0,
            delay_ms: 10,
        }),
        FilterConfig::BodyBuffer(BodyBufferConfig { max_bytes: 1 << 20 }),
    ];
    config.filters.send = vec![FilterConfig::BodyBuffer(BodyBufferConfig { max_bytes: 64 })];
    let (proxy, shutdown, task) = start_sidecar(config, upstream).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let echoed = round_trip(proxy, &payload).await;
    assert_eq!(echoed.len(), payload.len());
    assert_eq!(echoed, payload);

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_connections_stay_separate() {
    let upstream = start_echo_upstream().await;
    let (proxy, shutdown, task) = start_sidecar(SidecarConfig::default(), upstream).await;

    let clients: Vec<_> = (0..16u8)
        .map(|i| {
            tokio::spawn(async move {
                let payload = vec![i; 1024 + i as usize];
                (round_trip(proxy, &payload).await, payload)
            })
        })
        .collect();
    for client in clients {
        let (echoed, payload) = client.await.unwrap();
        assert_eq!(echoed, payload);
    }

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unreachable_upstream_closes_downstream() {
    // Bind then drop to get a port nothing listens on.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = unused.local_addr().unwrap();
    drop(unused);

    let (proxy, shutdown, task) = start_sidecar(SidecarConfig::default(), dead).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut received = Vec::new();
    let outcome = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .unwrap();
    // Either a clean EOF or a reset, but never data.
    if outcome.is_ok() {
        assert!(received.is_empty());
    }

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

/// Upstream that ignores its input and streams `chunks` small writes, one
/// every `gap`, then closes.
async fn start_trickling_upstream(chunks: usize, gap: Duration) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                for _ in 0..chunks {
                    tokio::time::sleep(gap).await;
                    if socket.write_all(b"chunk").await.is_err() {
                        return;
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_slow_download_survives_silent_client() {
    // Eight chunks 300ms apart outlast a 1s idle limit several times over,
    // but the connection is never quiet for a full second.
    let upstream = start_trickling_upstream(8, Duration::from_millis(300)).await;
    let mut config = SidecarConfig::default();
    config.timeouts.idle_secs = 1;
    let (proxy, shutdown, task) = start_sidecar(config, upstream).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"chunk".repeat(8));

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_quiet_connection_is_closed_after_idle_limit() {
    let upstream = start_echo_upstream().await;
    let mut config = SidecarConfig::default();
    config.timeouts.idle_secs = 1;
    let (proxy, shutdown, task) = start_sidecar(config, upstream).await;

    // Connect and say nothing; the echo upstream waits for input forever.
    let mut client = TcpStream::connect(proxy).await.unwrap();
    let started = std::time::Instant::now();
    let mut received = Vec::new();
    let outcome = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .expect("idle connection should be closed by the sidecar");
    if outcome.is_ok() {
        assert!(received.is_empty());
    }
    assert!(started.elapsed() >= Duration::from_millis(900));

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}
