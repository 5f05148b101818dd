//! End-to-end relay tests over loopback TCP

use ktun_cli::relay::{Relay, RelayConfig};
use ktun_connection::ConnectionConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

async fn start_relay(
    target: String,
    connection: ConnectionConfig,
) -> (Arc<Relay>, SocketAddr, CancellationToken, JoinHandle<()>) {
    let relay = Relay::bind(RelayConfig {
        listen: "127.0.0.1:0".to_string(),
        target,
        connection,
        connect_timeout: Duration::from_secs(2),
    })
    .await
    .unwrap();
    let relay = Arc::new(relay);
    let addr = relay.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let handle = {
        let relay = relay.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            relay.run(shutdown).await;
        })
    };

    (relay, addr, shutdown, handle)
}

/// Reads until EOF or error, failing if the peer keeps the connection open
async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let result = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("connection should have been closed");
    assert!(matches!(result, Ok(0) | Err(_)), "unexpected data: {:?}", result);
}

#[tokio::test]
async fn test_relay_echoes_through_guarded_legs() {
    let echo = spawn_echo_server().await;
    let (relay, addr, shutdown, handle) =
        start_relay(echo.to_string(), ConnectionConfig::default()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello through the tunnel").await.unwrap();

    let mut buf = vec![0u8; 24];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello through the tunnel");
    assert_eq!(relay.connection_count(), 1);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_relay_counts_each_upstream_connection() {
    let echo = spawn_echo_server().await;
    let (relay, addr, shutdown, handle) =
        start_relay(echo.to_string(), ConnectionConfig::default()).await;

    for i in 0..3u8 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[i]).await.unwrap();
        let mut byte = [0u8; 1];
        client.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], i);
    }

    assert_eq!(relay.connection_count(), 3);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_idle_client_is_disconnected() {
    let echo = spawn_echo_server().await;
    let idle = ConnectionConfig::with_idle_timeout(Duration::from_millis(200))
        .with_check_interval(Duration::from_millis(50));
    let (_relay, addr, shutdown, handle) = start_relay(echo.to_string(), idle).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    // Stay silent past the idle timeout
    expect_closed(&mut client).await;

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_target_closes_client() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (relay, addr, shutdown, handle) =
        start_relay(dead.to_string(), ConnectionConfig::default()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    expect_closed(&mut client).await;
    assert_eq!(relay.connection_count(), 0);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_active_connections() {
    let echo = spawn_echo_server().await;
    let (_relay, addr, shutdown, handle) =
        start_relay(echo.to_string(), ConnectionConfig::default()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut byte = [0u8; 1];
    client.read_exact(&mut byte).await.unwrap();

    shutdown.cancel();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("relay should stop")
        .unwrap();

    expect_closed(&mut client).await;
}

/// Upstream that sends `count` single bytes, `gap` apart, then hangs up
async fn spawn_trickle_server(count: u8, gap: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for i in 0..count {
            tokio::time::sleep(gap).await;
            if stream.write_all(&[i]).await.is_err() {
                return;
            }
        }
    });

    addr
}

#[tokio::test]
async fn test_one_way_stream_outlives_idle_timeout() {
    // 20 bytes over ~1s, far longer than the idle timeout
    let upstream = spawn_trickle_server(20, Duration::from_millis(50)).await;
    let idle = ConnectionConfig::with_idle_timeout(Duration::from_millis(200))
        .with_check_interval(Duration::from_millis(50));
    let (_relay, addr, shutdown, handle) = start_relay(upstream.to_string(), idle).await;

    // The client never writes
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut received = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .expect("stream should end once the upstream hangs up")
        .unwrap();

    assert_eq!(received, (0..20).collect::<Vec<u8>>());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_relay_keeps_accepting_after_aborted_clients() {
    let echo = spawn_echo_server().await;
    let (relay, addr, shutdown, handle) =
        start_relay(echo.to_string(), ConnectionConfig::default()).await;

    for _ in 0..10 {
        drop(TcpStream::connect(addr).await.unwrap());
    }

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"still here");
    assert!(!handle.is_finished());
    assert!(relay.connection_count() >= 1);

    shutdown.cancel();
    handle.await.unwrap();
}
