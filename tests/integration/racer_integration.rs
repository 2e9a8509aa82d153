//! Connection racer integration tests
//!
//! Races run against real loopback listeners. `127.0.0.2` is routed to the
//! loopback interface on Linux but nothing listens there, so it serves as
//! the dead candidate next to a live `127.0.0.1`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use racing_proxy::error::DialError;
use racing_proxy::racer::{
    AddressQualityTracker, ConnectionRacer, DialOptions, QualitySettings, RacerSettings, SelectionPolicy, TcpDialer,
};

use super::{closed_port, StaticResolver};

fn tcp_racer(ips: Vec<IpAddr>) -> ConnectionRacer<TcpDialer> {
    ConnectionRacer::new(
        TcpDialer::new(Duration::from_secs(2)),
        Arc::new(StaticResolver(ips)),
        Arc::new(AddressQualityTracker::new(QualitySettings::default())),
        SelectionPolicy::Tcp,
        RacerSettings {
            connect_timeout: Duration::from_secs(2),
            ..RacerSettings::default()
        },
    )
}

/// Accept forever, echoing whatever each connection sends
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_live_address_wins_race() {
    let addr = echo_server().await;
    let racer = tcp_racer(vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), IpAddr::V4(Ipv4Addr::LOCALHOST)]);

    let conn = racer
        .dial_best("origin.test", addr.port(), Duration::from_secs(2), DialOptions::with_retry(2))
        .await
        .unwrap();

    assert_eq!(conn.peer, addr);
    assert!(!conn.from_cache);
    assert_eq!(racer.tracker().snapshot().good, 1);
}

#[tokio::test]
async fn test_dead_host_exhausts_rounds() {
    let addr = closed_port().await;
    let racer = tcp_racer(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);

    let err = racer
        .dial_best("dead.test", addr.port(), Duration::from_secs(1), DialOptions::with_retry(2))
        .await
        .unwrap_err();

    assert!(
        matches!(err, DialError::ConnectionFailed { .. } | DialError::Timeout { .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(racer.tracker().snapshot().good, 0);
}

#[tokio::test]
async fn test_no_addresses() {
    let racer = tcp_racer(Vec::new());
    let err = racer
        .dial_best("empty.test", 80, Duration::from_secs(1), DialOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DialError::NoAddress { .. }));
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let addr = echo_server().await;
    let racer = tcp_racer(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    let opts = DialOptions {
        cache_key: Some("origin.test:80".into()),
        ..DialOptions::with_retry(1)
    };

    let first = racer
        .dial_best("origin.test", addr.port(), Duration::from_secs(2), opts.clone())
        .await
        .unwrap();
    assert!(!first.from_cache);
    let first_local = first.stream.local_addr().unwrap();
    racer.release("origin.test:80", first.stream, first.peer);

    let second = racer
        .dial_best("origin.test", addr.port(), Duration::from_secs(2), opts)
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(second.stream.local_addr().unwrap(), first_local);
}

#[tokio::test]
async fn test_early_data_reply_reaches_caller() {
    let addr = echo_server().await;
    let racer = tcp_racer(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    let opts = DialOptions {
        early_data: Some(Bytes::from_static(b"hello")),
        ..DialOptions::with_retry(1)
    };

    let mut conn = racer
        .dial_best("origin.test", addr.port(), Duration::from_secs(2), opts)
        .await
        .unwrap();

    let mut buf = [0u8; 5];
    conn.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}
