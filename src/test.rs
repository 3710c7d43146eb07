#![cfg(test)]
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::connector::test::RedirectConnector;
use crate::model::Endpoint;
use crate::*;

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Starts both halves over loopback, routing `routes` to local addresses.
async fn proxy(routes: Vec<(Endpoint, SocketAddr)>) -> (Frontend, Backend, SocketAddr) {
    let connector: RedirectConnector = routes.into_iter().map(|(e, a)| (e, Ok(a))).collect();
    let mut config = BackendConfig::default();
    config.set_allow_non_unicast(true);
    let backend = Backend::with_connector(
        config,
        Some("alice".to_owned()),
        Arc::new(SessionLimiter::default()),
        Arc::new(connector),
    );
    let (a, b) = loopback::pair();
    backend.start(b).await.unwrap();
    let frontend = Frontend::new(FrontendConfig::new("127.0.0.1".parse().unwrap(), 0));
    let endpoint = frontend.start(a).await.unwrap();
    let addr = endpoint.socket_addr().unwrap();
    (frontend, backend, addr)
}

async fn shutdown(frontend: Frontend, backend: Backend) {
    frontend.stop();
    frontend.once_stopped().await;
    backend.once_stopped().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn socks5_client_through_both_halves() {
    let echo = echo_server().await;
    let target = Endpoint::new("echo.test", 7);
    let (frontend, backend, addr) = proxy(vec![(target, echo)]).await;

    let received = tokio::task::spawn_blocking(move || {
        use socks::*;
        use std::io::prelude::*;

        let mut conn =
            Socks5Stream::connect(addr, TargetAddr::Domain("echo.test".to_owned(), 7)).unwrap();
        conn.write_all(b"hello over socks5").unwrap();
        let mut buf = vec![0u8; 17];
        conn.read_exact(&mut buf).unwrap();
        buf
    })
    .await
    .unwrap();
    assert_eq!(received, b"hello over socks5".to_vec());

    shutdown(frontend, backend).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn socks4a_client_through_both_halves() {
    let echo = echo_server().await;
    let target = Endpoint::new("echo.test", 7);
    let (frontend, backend, addr) = proxy(vec![(target, echo)]).await;

    let received = tokio::task::spawn_blocking(move || {
        use socks::*;
        use std::io::prelude::*;

        let mut conn =
            Socks4Stream::connect(addr, TargetAddr::Domain("echo.test".to_owned(), 7), "")
                .unwrap();
        conn.write_all(b"socks4a").unwrap();
        let mut buf = vec![0u8; 7];
        conn.read_exact(&mut buf).unwrap();
        buf
    })
    .await
    .unwrap();
    assert_eq!(received, b"socks4a".to_vec());

    shutdown(frontend, backend).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_host_is_reported() {
    let (frontend, backend, addr) = proxy(vec![]).await;

    let res = tokio::task::spawn_blocking(move || {
        use socks::*;
        Socks5Stream::connect(addr, TargetAddr::Domain("nowhere.test".to_owned(), 80)).map(|_| ())
    })
    .await
    .unwrap();
    assert!(res.is_err());

    shutdown(frontend, backend).await;
}

#[tokio::test]
async fn raw_socks5_bytes() {
    let echo = echo_server().await;
    let target = Endpoint::new("93.184.216.34", 80);
    let (frontend, backend, addr) = proxy(vec![(target, echo)]).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[5, 1, 0]).await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [5, 0]);

    client
        .write_all(&[5, 1, 0, 1, 93, 184, 216, 34, 0, 80])
        .await
        .unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 0, 0, 1]);
    // bound address
    let mut bound = [0u8; 6];
    client.read_exact(&mut bound).await.unwrap();
    assert_eq!(&bound[..4], &[127, 0, 0, 1]);

    client.write_all(b"abc").await.unwrap();
    let mut data = [0u8; 3];
    client.read_exact(&mut data).await.unwrap();
    assert_eq!(&data, b"abc");

    drop(client);
    shutdown(frontend, backend).await;
}

#[tokio::test]
async fn byte_counts_do_not_pile_up() {
    let echo = echo_server().await;
    let target = Endpoint::new("93.184.216.34", 80);
    let (frontend, backend, addr) = proxy(vec![(target, echo)]).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[5, 1, 0]).await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    client
        .write_all(&[5, 1, 0, 1, 93, 184, 216, 34, 0, 80])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0);

    // one round trip per byte, so every byte is its own buffer
    for i in 0..200u8 {
        client.write_all(&[i]).await.unwrap();
        let mut echoed = [0u8; 1];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed[0], i);
    }

    for _ in 0..200 {
        if frontend.traffic().total_received_from_peer() == 200
            && backend.traffic().total_received_from_peer() == 200
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    for traffic in [frontend.traffic(), backend.traffic()] {
        assert_eq!(traffic.bytes_sent_to_peer.len(), 0);
        assert_eq!(traffic.bytes_received_from_peer.len(), 0);
        assert_eq!(traffic.total_sent_to_peer(), 200);
        assert_eq!(traffic.total_received_from_peer(), 200);
    }

    drop(client);
    shutdown(frontend, backend).await;
}

#[tokio::test]
async fn stopping_backend_stops_frontend() {
    let (frontend, backend, _addr) = proxy(vec![]).await;
    backend.stop();
    backend.once_stopped().await;
    frontend.once_stopped().await;
}
