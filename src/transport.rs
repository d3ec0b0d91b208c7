//! Duplex byte-stream abstraction.
//!
//! The relay and the multiplexer never care what carries their bytes: a
//! [`Transport`] is either a plain TCP socket or an HTTP request/response
//! exchange dressed up as a stream. Splitting yields independently owned
//! read and write halves so the two copy directions of a session can run
//! concurrently.

use axum::body::{Body, BodyDataStream};
use bytes::{Buf, Bytes};
use std::convert::Infallible;
use std::io::{Error, ErrorKind::Other, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::Sender;
use tokio_stream::StreamExt;

/// Frame pushed into a streamed HTTP response body.
pub type BodyFrame = std::result::Result<Bytes, Infallible>;

/// A duplex byte stream owned by whichever component registered it.
pub enum Transport {
    Tcp(TcpStream),
    Http(HttpStream),
}

impl Transport {
    /// Wrap an HTTP exchange as a duplex stream.
    ///
    /// The request body becomes the read side; every write becomes one
    /// frame of the streamed response body, so the peer observes bytes
    /// without waiting for the response to complete. Deadlines are not
    /// supported on this path.
    pub fn http(body: Body, tx: Sender<BodyFrame>, peer: String, local: String) -> Transport {
        Transport::Http(HttpStream {
            reader: HttpReader {
                body: body.into_data_stream(),
                leftover: Bytes::new(),
            },
            writer: HttpWriter { tx: Some(tx) },
            peer,
            local,
        })
    }

    pub fn peer_addr(&self) -> String {
        match self {
            Transport::Tcp(stream) => stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_owned()),
            Transport::Http(stream) => stream.peer.clone(),
        }
    }

    pub fn local_addr(&self) -> String {
        match self {
            Transport::Tcp(stream) => stream
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_owned()),
            Transport::Http(stream) => stream.local.clone(),
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf).await,
            Transport::Http(stream) => stream.reader.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(stream) => stream.write_all(data).await,
            Transport::Http(stream) => stream.writer.write_all(data).await,
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            Transport::Tcp(stream) => stream.shutdown().await,
            Transport::Http(stream) => stream.writer.close().await,
        }
    }

    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        match self {
            Transport::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (TransportReader::Tcp(r), TransportWriter::Tcp(w))
            }
            Transport::Http(stream) => (
                TransportReader::Http(stream.reader),
                TransportWriter::Http(stream.writer),
            ),
        }
    }
}

/// Read half of a split [`Transport`].
pub enum TransportReader {
    Tcp(OwnedReadHalf),
    Http(HttpReader),
}

impl TransportReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            TransportReader::Tcp(half) => half.read(buf).await,
            TransportReader::Http(half) => half.read(buf).await,
        }
    }
}

/// Write half of a split [`Transport`].
pub enum TransportWriter {
    Tcp(OwnedWriteHalf),
    Http(HttpWriter),
}

impl TransportWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            TransportWriter::Tcp(half) => half.write_all(data).await,
            TransportWriter::Http(half) => half.write_all(data).await,
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            TransportWriter::Tcp(half) => half.shutdown().await,
            TransportWriter::Http(half) => half.close().await,
        }
    }
}

pub struct HttpStream {
    reader: HttpReader,
    writer: HttpWriter,
    peer: String,
    local: String,
}

pub struct HttpReader {
    body: BodyDataStream,
    leftover: Bytes,
}

impl HttpReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.leftover.is_empty() {
            match self.body.next().await {
                Some(Ok(chunk)) => self.leftover = chunk,
                Some(Err(e)) => return Err(Error::new(Other, e)),
                None => return Ok(0),
            }
        }

        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        Ok(n)
    }
}

pub struct HttpWriter {
    tx: Option<Sender<BodyFrame>>,
}

impl HttpWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::new(Other, "connection closed"))?;

        tx.send(Ok(Bytes::copy_from_slice(data)))
            .await
            .map_err(|_| Error::new(Other, "peer went away"))
    }

    pub async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}
