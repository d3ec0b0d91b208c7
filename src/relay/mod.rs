//! Rendezvous relay.
//!
//! use [`RelayServer`] to pair connections into sessions by identifier and
//! copy bytes between them.
//!
//! use [`Client`] to join a session from behind a NAT or firewall.

mod session;
pub use session::{JoinOutcome, SessionRegistry};

#[cfg(feature = "server")]
mod http;
#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::RelayServer;

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::Client;

// Handshake literals exchanged over the relay transports.
pub const ACK_WAITING: &[u8] = b"WAITING";
pub const ACK_CONNECTED: &[u8] = b"CONNECTED";
pub const ACK_SESSION_FULL: &[u8] = b"SESSION_FULL";

#[cfg(all(test, feature = "server", feature = "client"))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::stats::Stats;
    use crate::transport::{BodyFrame, Transport};
    use axum::body::Body;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc::channel;
    use tokio::task;
    use tokio::time::sleep;
    use tokio_stream::wrappers::ReceiverStream;

    async fn start_server() -> (SocketAddr, Arc<SessionRegistry>) {
        let server = RelayServer::new("127.0.0.1:0", None, Config::default())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        task::spawn(async move {
            let _ = server.run().await;
        });
        (addr, registry)
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, dialed) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            TcpStream::connect(addr)
        );
        (accepted, dialed.unwrap())
    }

    fn test_registry(config: Config) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(config, Arc::new(Stats::new(16))))
    }

    #[tokio::test]
    async fn pairs_two_connections_and_relays() {
        let (addr, registry) = start_server().await;
        let mut buf = [0u8; 64];

        let mut c1 = TcpStream::connect(addr).await.unwrap();
        c1.write_all(b"abc").await.unwrap();
        let n = c1.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], ACK_WAITING);
        assert_eq!(registry.len(), 1);

        let mut c2 = TcpStream::connect(addr).await.unwrap();
        c2.write_all(b"abc").await.unwrap();
        let n = c2.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], ACK_CONNECTED);

        let n = c1.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], ACK_CONNECTED);

        c1.write_all(b"hello").await.unwrap();
        let n = c2.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        c2.write_all(b"hi back").await.unwrap();
        let n = c1.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi back");
    }

    #[tokio::test]
    async fn third_connection_is_rejected() {
        let (addr, registry) = start_server().await;
        let mut buf = [0u8; 64];

        let mut c1 = TcpStream::connect(addr).await.unwrap();
        c1.write_all(b"full").await.unwrap();
        c1.read(&mut buf).await.unwrap();

        let mut c2 = TcpStream::connect(addr).await.unwrap();
        c2.write_all(b"full").await.unwrap();
        c2.read(&mut buf).await.unwrap();
        c1.read(&mut buf).await.unwrap();

        let mut c3 = TcpStream::connect(addr).await.unwrap();
        c3.write_all(b"full").await.unwrap();
        let n = c3.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], ACK_SESSION_FULL);
        assert_eq!(registry.len(), 1);

        // the refused connection never disturbs the paired one
        c1.write_all(b"still here").await.unwrap();
        let n = c2.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still here");
    }

    #[tokio::test]
    async fn session_tears_down_when_either_side_leaves() {
        let (addr, registry) = start_server().await;
        let mut buf = [0u8; 64];

        let mut c1 = TcpStream::connect(addr).await.unwrap();
        c1.write_all(b"gone").await.unwrap();
        c1.read(&mut buf).await.unwrap();

        let mut c2 = TcpStream::connect(addr).await.unwrap();
        c2.write_all(b"gone").await.unwrap();
        c2.read(&mut buf).await.unwrap();
        c1.read(&mut buf).await.unwrap();

        drop(c1);
        let n = c2.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn client_drives_the_handshake() {
        let (addr, _registry) = start_server().await;

        let waiter = task::spawn(async move {
            Client::new(&addr.to_string(), "xyz").connect().await
        });
        sleep(Duration::from_millis(50)).await;

        let mut c2 = Client::new(&addr.to_string(), "xyz").connect().await.unwrap();
        let mut c1 = waiter.await.unwrap().unwrap();

        c1.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        let n = c2.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_the_id_is_reusable() {
        let registry = test_registry(Config::default());

        let (a, _peer) = tcp_pair().await;
        let outcome = registry.create_or_join("stale", Transport::Tcp(a)).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Waiting));
        assert_eq!(registry.len(), 1);

        sleep(Duration::from_millis(20)).await;
        registry.evict_idle(Duration::from_millis(1)).await;
        assert_eq!(registry.len(), 0);

        let (b, _peer2) = tcp_pair().await;
        let outcome = registry.create_or_join("stale", Transport::Tcp(b)).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Waiting));
    }

    #[tokio::test]
    async fn fresh_sessions_survive_the_sweep() {
        let registry = test_registry(Config::default());

        let (a, _peer) = tcp_pair().await;
        registry.create_or_join("young", Transport::Tcp(a)).await.unwrap();
        registry.evict_idle(Duration::from_secs(60)).await;
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn closing_twice_is_a_noop() {
        let registry = test_registry(Config::default());

        let (a, _peer) = tcp_pair().await;
        registry.create_or_join("once", Transport::Tcp(a)).await.unwrap();
        registry.close("once").await;
        registry.close("once").await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn http_transport_joins_a_session() {
        let registry = test_registry(Config::default());

        // streaming request body so the read side stays open
        let (req_tx, req_rx) = channel::<BodyFrame>(8);
        let (resp_tx, mut resp_rx) = channel::<BodyFrame>(8);
        let conn = Transport::http(
            Body::from_stream(ReceiverStream::new(req_rx)),
            resp_tx,
            "10.0.0.9:1234".to_owned(),
            "relay.test".to_owned(),
        );

        let outcome = registry.create_or_join("mix", conn).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Waiting));
        let frame = resp_rx.recv().await.unwrap().unwrap();
        assert_eq!(&frame[..], ACK_WAITING);

        let (a, mut peer) = tcp_pair().await;
        let outcome = registry.create_or_join("mix", Transport::Tcp(a)).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Connected));

        let frame = resp_rx.recv().await.unwrap().unwrap();
        assert_eq!(&frame[..], ACK_CONNECTED);
        let mut ack = [0u8; 9];
        peer.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack[..], ACK_CONNECTED);

        // http -> tcp
        req_tx
            .send(Ok(bytes::Bytes::from_static(b"hi from http")))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi from http");

        // tcp -> http
        peer.write_all(b"pong").await.unwrap();
        let frame = resp_rx.recv().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"pong");

        // ending the request body tears the session down
        drop(req_tx);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn status_page_reports_active_sessions() {
        let server = RelayServer::new("127.0.0.1:0", Some("127.0.0.1:0"), Config::default())
            .await
            .unwrap();
        let http_addr = server.http_addr().unwrap();
        task::spawn(async move {
            let _ = server.run().await;
        });
        sleep(Duration::from_millis(50)).await;

        let mut s = TcpStream::connect(http_addr).await.unwrap();
        s.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        s.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.contains("Active sessions: 0"));
    }
}
