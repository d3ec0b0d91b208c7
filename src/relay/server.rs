use crate::config::{Config, MESSAGE_BUFFER_SIZE, SESSION_ID_LIMIT};
use crate::relay::session::{JoinOutcome, SessionRegistry};
use crate::relay::ACK_SESSION_FULL;
use crate::stats::Stats;
use crate::transport::Transport;
use std::io::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task;
use tokio::time::timeout;

/// Rendezvous relay server
///
/// pairs incoming TCP and HTTP connections into sessions and copies bytes
/// between the two endpoints of each.
pub struct RelayServer {
    config: Config,
    registry: Arc<SessionRegistry>,
    stats: Arc<Stats>,
    tcp_listener: TcpListener,
    http_listener: Option<TcpListener>,
}

impl RelayServer {
    pub async fn new<A: ToSocketAddrs>(
        listen_addr: A,
        http_addr: Option<A>,
        config: Config,
    ) -> Result<Self> {
        let tcp_listener = TcpListener::bind(listen_addr).await?;
        let http_listener = match http_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let stats = Arc::new(Stats::new(MESSAGE_BUFFER_SIZE));
        let registry = Arc::new(SessionRegistry::new(config.clone(), stats.clone()));

        Ok(Self {
            config,
            registry,
            stats,
            tcp_listener,
            http_listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.tcp_listener.local_addr()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub async fn run(self) -> Result<()> {
        self.registry.clone().start_sweeper();

        if let Some(http_listener) = self.http_listener {
            let registry = self.registry.clone();
            let stats = self.stats.clone();
            task::spawn(async move {
                if let Err(e) = super::http::serve(http_listener, registry, stats).await {
                    log::warn!("http relay exited: {}", e);
                }
            });
        }

        log::info!("tcp relay listening on {}", self.tcp_listener.local_addr()?);

        loop {
            let (stream, addr) = match self.tcp_listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    continue;
                }
            };

            if self.registry.len() >= self.config.max_connections {
                log::warn!("session limit reached, dropping {}", addr);
                continue;
            }

            let registry = self.registry.clone();
            task::spawn(handle_tcp(registry, stream));
        }
    }
}

async fn handle_tcp(registry: Arc<SessionRegistry>, mut stream: TcpStream) {
    // the session identifier is the first frame, read once
    let mut buf = [0u8; SESSION_ID_LIMIT];
    let n = match timeout(Duration::from_secs(30), stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            log::debug!("error reading session id: {}", e);
            return;
        }
        Err(_) => {
            log::debug!("timed out waiting for session id");
            return;
        }
    };
    if n == 0 {
        return;
    }

    let id = String::from_utf8_lossy(&buf[..n]).into_owned();
    join_session(registry, Transport::Tcp(stream), id).await;
}

pub(crate) async fn join_session(registry: Arc<SessionRegistry>, conn: Transport, id: String) {
    let peer = conn.peer_addr();
    match registry.create_or_join(&id, conn).await {
        Ok(JoinOutcome::Waiting) => {
            log::debug!("session {}: {} waiting for peer", id, peer)
        }
        Ok(JoinOutcome::Connected) => {
            log::debug!("session {}: {} completed the pair", id, peer)
        }
        Ok(JoinOutcome::SessionFull(mut conn)) => {
            log::info!("session {} is full, rejecting {}", id, peer);
            let _ = conn.write_all(ACK_SESSION_FULL).await;
            let _ = conn.close().await;
        }
        Err(e) => log::debug!("session {}: join failed: {}", id, e),
    }
}
