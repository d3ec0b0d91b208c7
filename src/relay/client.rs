use crate::config::SESSION_ID_LIMIT;
use crate::relay::{ACK_CONNECTED, ACK_SESSION_FULL, ACK_WAITING};
use std::io::{Error, ErrorKind::Other, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Relay client
///
/// dial the relay, announce a session identifier and wait for the peer
/// before handing the raw stream back to the caller.
pub struct Client {
    server_addr: String,
    session: String,
}

impl Client {
    pub fn new(server_addr: &str, session: &str) -> Self {
        Self {
            server_addr: server_addr.to_owned(),
            session: session.into(),
        }
    }

    /// Connect and complete the handshake. Resolves once both parties are
    /// paired; a full session is an error.
    pub async fn connect(&self) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.server_addr).await?;
        stream.write_all(self.session.as_bytes()).await?;

        let mut buf = [0u8; SESSION_ID_LIMIT];
        let n = stream.read(&mut buf).await?;
        let resp = &buf[..n];

        if resp == ACK_CONNECTED {
            return Ok(stream);
        }
        if resp == ACK_SESSION_FULL {
            return Err(Error::new(Other, "session is full"));
        }
        if !resp.starts_with(ACK_WAITING) {
            return Err(Error::new(Other, "unexpected relay response"));
        }
        // the peer may have arrived between the two acknowledgments
        if &resp[ACK_WAITING.len()..] == ACK_CONNECTED {
            return Ok(stream);
        }

        log::debug!("session {}: waiting for peer", self.session);

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::new(Other, "relay closed before the peer arrived"));
        }
        match &buf[..n] {
            resp if resp == ACK_CONNECTED => Ok(stream),
            resp if resp == ACK_SESSION_FULL => Err(Error::new(Other, "session is full")),
            _ => Err(Error::new(Other, "unexpected relay response")),
        }
    }
}
