//! Multiplexed connection manager.
//!
//! Owns any number of named connections and applies per-connection
//! compression on top of them. Payloads are compressed on send and
//! classified by their leading magic bytes on receive, so the wire format
//! stays identical to the uncompressed case and compressed and plain peers
//! interoperate on the same socket.

use crate::codec::{Compression, Decoder, Encoder};
use crate::config::BUFFER_SIZE;
use crate::stats::Stats;
use crate::transport::{Transport, TransportReader, TransportWriter};
use futures::future::join_all;
use std::collections::HashMap;
use std::io::{Error, ErrorKind::InvalidData, ErrorKind::Other, Result};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, Notify};
use tokio::{select, task};

/// Callback invoked with every payload a receive loop dispatches.
pub type RecvHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct Entry {
    reader: Arc<Mutex<TransportReader>>,
    writer: Arc<Mutex<TransportWriter>>,
    closed: Arc<Notify>,
    peer: String,
    local: String,
    encoder: Option<Encoder>,
    decoder: Option<Decoder>,
}

/// Registry of named connections with transparent compression.
///
/// Codec state lives next to its connection and is only touched under the
/// registry lock; socket I/O happens outside it, behind per-connection
/// mutexes on the split halves.
pub struct Multiplexer {
    conns: RwLock<HashMap<String, Entry>>,
    compression: Compression,
    level: u32,
    stats: Arc<Stats>,
}

impl Multiplexer {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            conns: Default::default(),
            compression: Compression::None,
            level: 6,
            stats,
        }
    }

    /// Select the codec applied to outgoing payloads.
    pub fn set_compression(&mut self, compression: Compression, level: u32) {
        self.compression = compression;
        self.level = level;
    }

    pub fn len(&self) -> usize {
        self.conns.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.conns.read().unwrap().keys().cloned().collect()
    }

    /// Register a connection. An id collision replaces the prior entry
    /// without closing its connection; that is the caller's job.
    pub fn add_connection(&self, id: &str, conn: Transport) {
        let peer = conn.peer_addr();
        let local = conn.local_addr();
        let (reader, writer) = conn.into_split();

        let entry = Entry {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            closed: Arc::new(Notify::new()),
            peer: peer.clone(),
            local,
            encoder: None,
            decoder: None,
        };
        self.conns.write().unwrap().insert(id.to_owned(), entry);

        self.stats.record_event(&format!("connection {} added ({})", id, peer));
        log::info!("multiplex: added connection {} ({})", id, peer);
    }

    /// Close a connection and discard its codec state, all in one step.
    pub async fn remove_connection(&self, id: &str) {
        let entry = { self.conns.write().unwrap().remove(id) };
        if let Some(entry) = entry {
            entry.closed.notify_waiters();
            let _ = entry.writer.lock().await.close().await;

            self.stats.record_event(&format!("connection {} removed", id));
            log::info!("multiplex: removed connection {}", id);
        }
    }

    /// Send a payload to one connection, compressing it if configured.
    pub async fn send_to(&self, id: &str, data: &[u8]) -> Result<()> {
        let (writer, wire, peer, local) = {
            let mut conns = self.conns.write().unwrap();
            let entry = conns
                .get_mut(id)
                .ok_or_else(|| Error::new(Other, format!("connection {} not found", id)))?;

            let wire = match self.compression {
                Compression::None => data.to_vec(),
                codec => {
                    let level = self.level;
                    let encoder = entry.encoder.get_or_insert_with(|| Encoder::new(codec, level));
                    encoder.encode(data)?
                }
            };
            (entry.writer.clone(), wire, entry.peer.clone(), entry.local.clone())
        };

        writer.lock().await.write_all(&wire).await?;
        self.stats.record_sent(wire.len(), &local, &peer);
        log::trace!("multiplex: sent {} bytes to {}", wire.len(), id);
        Ok(())
    }

    /// Send a payload to every connection. Individual failures are logged
    /// and do not abort the rest.
    pub async fn send_to_all(&self, data: &[u8]) {
        let ids = self.ids();
        let results = join_all(ids.iter().map(|id| self.send_to(id, data))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                log::warn!("multiplex: send to {} failed: {}", id, e);
            }
        }
    }

    /// Read one payload, decompressing when the leading bytes identify a
    /// known codec regardless of how this manager is configured.
    ///
    /// Returns the payload length, or an error when the decompressed data
    /// does not fit `buf`.
    pub async fn receive_from(&self, id: &str, buf: &mut [u8]) -> Result<usize> {
        let reader = {
            let conns = self.conns.read().unwrap();
            let entry = conns
                .get(id)
                .ok_or_else(|| Error::new(Other, format!("connection {} not found", id)))?;
            entry.reader.clone()
        };

        let n = reader.lock().await.read(buf).await?;
        if n == 0 {
            return Ok(0);
        }

        let codec = Compression::detect(&buf[..n]);
        if codec == Compression::None {
            let (peer, local) = self.addrs(id);
            self.stats.record_received(n, &peer, &local);
            return Ok(n);
        }

        let decoded = {
            let mut conns = self.conns.write().unwrap();
            let entry = conns
                .get_mut(id)
                .ok_or_else(|| Error::new(Other, format!("connection {} not found", id)))?;

            let decoder = entry.decoder.get_or_insert_with(|| Decoder::new(codec));
            if decoder.codec() != codec {
                *decoder = Decoder::new(codec);
            }
            decoder
                .decode(&buf[..n])
                .map_err(|e| Error::new(InvalidData, e))?
        };

        if decoded.len() > buf.len() {
            return Err(Error::new(InvalidData, "buffer too small for decompressed data"));
        }
        buf[..decoded.len()].copy_from_slice(&decoded);

        let (peer, local) = self.addrs(id);
        self.stats.record_received(decoded.len(), &peer, &local);
        Ok(decoded.len())
    }

    /// Start one receive loop per currently-registered connection.
    pub fn start_listening<F>(self: &Arc<Self>, handler: F)
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        let handler: RecvHandler = Arc::new(handler);
        let ids = self.ids();
        for id in &ids {
            self.listen_connection(id, handler.clone());
        }
        log::info!("multiplex: listening on {} connections", ids.len());
    }

    /// Spawn the receive loop for one connection. A read error or
    /// end-of-stream removes the connection and ends the loop; a codec
    /// failure only drops the payload.
    pub fn listen_connection(self: &Arc<Self>, id: &str, handler: RecvHandler) {
        let closed = {
            let conns = self.conns.read().unwrap();
            match conns.get(id) {
                Some(entry) => entry.closed.clone(),
                None => return,
            }
        };

        let mux = self.clone();
        let id = id.to_owned();
        task::spawn(async move {
            let mut buf = vec![0u8; BUFFER_SIZE];
            loop {
                let received = select! {
                    _ = closed.notified() => break,
                    r = mux.receive_from(&id, &mut buf) => r,
                };

                match received {
                    Ok(0) => {
                        mux.remove_connection(&id).await;
                        break;
                    }
                    Ok(n) => handler(&id, &buf[..n]),
                    Err(e) if e.kind() == InvalidData => {
                        log::debug!("multiplex: dropping payload from {}: {}", id, e);
                    }
                    Err(e) => {
                        log::debug!("multiplex: receive from {} failed: {}", id, e);
                        mux.remove_connection(&id).await;
                        break;
                    }
                }
            }
        });
    }

    /// Close every connection and clear the registry.
    pub async fn close(&self) {
        let entries: Vec<(String, Entry)> = { self.conns.write().unwrap().drain().collect() };
        for (id, entry) in entries {
            entry.closed.notify_waiters();
            let _ = entry.writer.lock().await.close().await;
            log::debug!("multiplex: closed connection {}", id);
        }
    }

    fn addrs(&self, id: &str) -> (String, String) {
        let conns = self.conns.read().unwrap();
        conns
            .get(id)
            .map(|e| (e.peer.clone(), e.local.clone()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ZSTD_MAGIC;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::sleep;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, dialed) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            TcpStream::connect(addr)
        );
        (accepted, dialed.unwrap())
    }

    fn new_mux(compression: Compression, level: u32) -> Arc<Multiplexer> {
        let mut mux = Multiplexer::new(Arc::new(Stats::new(16)));
        mux.set_compression(compression, level);
        Arc::new(mux)
    }

    #[tokio::test]
    async fn send_to_unknown_connection_fails() {
        let mux = new_mux(Compression::None, 6);
        assert!(mux.send_to("nope", b"x").await.is_err());
    }

    #[tokio::test]
    async fn compressed_send_carries_magic_and_decodes() {
        let mux = new_mux(Compression::Zstd, 3);
        let (a, mut b) = tcp_pair().await;
        mux.add_connection("c1", Transport::Tcp(a));
        mux.send_to("c1", b"ping").await.unwrap();

        let mut wire = [0u8; 256];
        let n = b.read(&mut wire).await.unwrap();
        assert!(wire[..n].starts_with(ZSTD_MAGIC));

        // the receiving side sniffs the codec on its own
        let peer_mux = new_mux(Compression::None, 6);
        let (c, mut d) = tcp_pair().await;
        peer_mux.add_connection("c1", Transport::Tcp(c));
        d.write_all(&wire[..n]).await.unwrap();

        let mut buf = [0u8; 256];
        let n = peer_mux.receive_from("c1", &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn plain_payloads_pass_through() {
        let mux = new_mux(Compression::None, 6);
        let (a, mut b) = tcp_pair().await;
        mux.add_connection("c1", Transport::Tcp(a));

        b.write_all(b"uncompressed").await.unwrap();
        let mut buf = [0u8; 64];
        let n = mux.receive_from("c1", &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"uncompressed");
    }

    #[tokio::test]
    async fn send_to_all_reaches_every_connection() {
        let mux = new_mux(Compression::None, 6);
        let (a1, mut d1) = tcp_pair().await;
        let (a2, d2) = tcp_pair().await;
        let (a3, mut d3) = tcp_pair().await;
        mux.add_connection("c1", Transport::Tcp(a1));
        mux.add_connection("c2", Transport::Tcp(a2));
        mux.add_connection("c3", Transport::Tcp(a3));

        // kill one peer; its failure must not starve the others
        drop(d2);
        sleep(Duration::from_millis(20)).await;

        mux.send_to_all(b"x").await;
        mux.send_to_all(b"x").await;

        let mut buf = [0u8; 8];
        let n = d1.read(&mut buf).await.unwrap();
        assert_eq!(buf[..n][0], b'x');
        let n = d3.read(&mut buf).await.unwrap();
        assert_eq!(buf[..n][0], b'x');
    }

    #[tokio::test]
    async fn listen_loop_dispatches_and_removes_on_eof() {
        let mux = new_mux(Compression::None, 6);
        let (a, mut b) = tcp_pair().await;
        mux.add_connection("c1", Transport::Tcp(a));

        let (tx, mut rx) = unbounded_channel();
        mux.start_listening(move |id: &str, data: &[u8]| {
            let _ = tx.send((id.to_owned(), data.to_vec()));
        });

        b.write_all(b"hey").await.unwrap();
        let (id, data) = rx.recv().await.unwrap();
        assert_eq!(id, "c1");
        assert_eq!(data, b"hey");

        drop(b);
        sleep(Duration::from_millis(50)).await;
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn oversized_decompressed_payload_is_an_error() {
        let wire = Encoder::new(Compression::Zstd, 3).encode(&[b'a'; 1024]).unwrap();
        assert!(wire.len() < 64);

        let mux = new_mux(Compression::None, 6);
        let (a, mut b) = tcp_pair().await;
        mux.add_connection("c1", Transport::Tcp(a));
        b.write_all(&wire).await.unwrap();

        let mut buf = [0u8; 64];
        let err = mux.receive_from("c1", &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), InvalidData);
        // the connection stays registered; only the payload is dropped
        assert_eq!(mux.len(), 1);
    }

    #[tokio::test]
    async fn remove_connection_closes_and_forgets() {
        let mux = new_mux(Compression::Gzip, 6);
        let (a, mut b) = tcp_pair().await;
        mux.add_connection("c1", Transport::Tcp(a));
        mux.send_to("c1", b"warm up the encoder").await.unwrap();

        mux.remove_connection("c1").await;
        assert!(mux.is_empty());
        assert!(mux.send_to("c1", b"x").await.is_err());

        // peer sees end-of-stream after draining
        let mut sink = Vec::new();
        b.read_to_end(&mut sink).await.unwrap();

        // removing again is harmless
        mux.remove_connection("c1").await;
    }
}
