//! End to end: application -> tunnel client -> relay -> tunnel server -> service.

use natrelay::crypto::Cipher;
use natrelay::tcp::{Client, Relay, RelayOpts, Server};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const KEY: &[u8] = b"passphrasewhichneedstobe32bytes!";

async fn echo_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut s, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let n = s.read(&mut buf).await.unwrap_or(0);
                if n > 0 {
                    let mut resp = b"echo: ".to_vec();
                    resp.extend_from_slice(&buf[..n]);
                    let _ = s.write_all(&resp).await;
                }
            });
        }
    });

    addr
}

/// returns the address applications connect to
async fn start_tunnel(client_key: &[u8], server_key: &[u8]) -> SocketAddr {
    let service = echo_service().await;

    let opts = RelayOpts {
        match_timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    let relay = Relay::bind("127.0.0.1:0", "127.0.0.1:0", opts).await.unwrap();
    let relay_client = relay.client_addr().unwrap().to_string();
    let relay_server = relay.server_addr().unwrap().to_string();
    tokio::spawn(relay.run());

    let server = Server::new(
        &relay_server,
        &service.to_string(),
        Cipher::new(server_key, 1024).unwrap(),
    )
    .with_retry(Duration::from_millis(50));
    tokio::spawn(server.run());

    let client = Client::new(
        "127.0.0.1:0",
        &relay_client,
        Cipher::new(client_key, 1024).unwrap(),
    )
    .await
    .unwrap();
    let addr = client.local_addr().unwrap();
    tokio::spawn(client.run());

    addr
}

async fn exchange(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut s = TcpStream::connect(addr).await.unwrap();
    s.write_all(payload).await.unwrap();

    let mut buf = Vec::new();
    timeout(Duration::from_secs(5), s.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

#[tokio::test]
async fn test_tunnel_round_trip() {
    let addr = start_tunnel(KEY, KEY).await;

    assert_eq!(exchange(addr, b"hello").await, b"echo: hello");
    assert_eq!(exchange(addr, b"again").await, b"echo: again");
}

#[tokio::test]
async fn test_tunnel_key_mismatch_returns_nothing() {
    let addr = start_tunnel(KEY, &[9u8; 32]).await;

    assert!(exchange(addr, b"hello").await.is_empty());
}
