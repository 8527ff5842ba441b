//! Black-box reaper properties (spec.md §8 properties 5, 6; scenarios S3, S4).

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use daemond::reaper::Reaper;

/// S3: with monitoring enabled and no traffic at all, the connection is
/// closed within `timeout + interval` of being accepted.
#[tokio::test]
async fn idle_connection_is_closed_within_bound() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let reaper = Reaper::new(Duration::from_millis(500), Duration::from_millis(250));
    let wrapped = reaper.wrap_listener(listener);

    let server = tokio::spawn(async move {
        let mut conn = wrapped.accept().await.unwrap();
        conn.set_monitor_enabled(true).unwrap();
        let mut buf = [0u8; 8];
        let started = tokio::time::Instant::now();
        let result = conn.read(&mut buf).await;
        (result, started.elapsed())
    });

    let _client = TcpStream::connect(addr).await.unwrap();
    let (result, elapsed) = server.await.unwrap();

    // A closed-from-under-us read surfaces either as Ok(0) (EOF after
    // shutdown) or an I/O error, depending on timing; either is acceptable,
    // only the timing bound is being asserted here.
    assert!(matches!(result, Ok(0) | Err(_)));
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed <= Duration::from_millis(1500));
}

/// S4: steady traffic keeps a monitored connection alive; once it stops,
/// the connection is still closed within the liveness bound.
#[tokio::test]
async fn steady_traffic_keeps_connection_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let reaper = Reaper::new(Duration::from_millis(400), Duration::from_millis(100));
    let wrapped = reaper.wrap_listener(listener);

    let server = tokio::spawn(async move {
        let mut conn = wrapped.accept().await.unwrap();
        conn.set_monitor_enabled(true).unwrap();
        let mut buf = [0u8; 1];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let _ = conn.write_all(&buf).await;
                }
            }
        }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    for _ in 0..10 {
        client.write_all(&[1]).await.unwrap();
        let mut echo = [0u8; 1];
        client.read_exact(&mut echo).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Traffic stops here; the reaper should close the connection within
    // timeout + interval of the last successful read/write.
    let closed = tokio::time::timeout(Duration::from_millis(900), server).await;
    assert!(closed.is_ok(), "connection was not closed after traffic stopped");
}

/// Property 6: with monitoring disabled, inactivity never causes a close.
#[tokio::test]
async fn disabled_monitoring_never_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let reaper = Reaper::new(Duration::from_millis(100), Duration::from_millis(50));
    let wrapped = reaper.wrap_listener(listener);

    let server = tokio::spawn(async move {
        let mut conn = wrapped.accept().await.unwrap();
        // Monitoring left disabled (the default).
        let mut buf = [0u8; 1];
        tokio::time::timeout(Duration::from_millis(500), conn.read(&mut buf)).await
    });

    let _client = TcpStream::connect(addr).await.unwrap();
    let outcome = server.await.unwrap();
    assert!(outcome.is_err(), "read should still be pending: reaper must not have closed it");
}
