//! TCP transport
//!
//! One task per accepted connection. Messages are framed by the blank line
//! ending the headers plus `Content-Length`, and answered in arrival order on
//! the same connection.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use sipreg_registrar_core::RequestHandler;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::parse_request;
use crate::error::{Result, ServerError};

/// Largest message, headers and body, accepted on a connection
pub const MAX_MESSAGE_SIZE: usize = 65_535;

const READ_CHUNK: usize = 8192;
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// SIP over TCP listening on one local address
pub struct TcpTransport {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    acceptor: JoinHandle<()>,
}

impl TcpTransport {
    /// Listen on `addr` and answer requests on every accepted connection
    pub async fn bind(addr: SocketAddr, handler: RequestHandler) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("SIP TCP transport listening on {}", local_addr);

        let cancel = CancellationToken::new();
        let acceptor = tokio::spawn(accept_loop(
            listener,
            local_addr,
            handler,
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            cancel,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop open connections and wait for the listener to exit
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.acceptor.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: RequestHandler,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Accepted TCP connection from {}", peer);
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    local_addr,
                    handler.clone(),
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                error!("Error accepting TCP connection: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY) => {}
                }
            }
        }
    }
    info!("TCP accept loop on {} terminated", local_addr);
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    local_addr: SocketAddr,
    handler: RequestHandler,
    cancel: CancellationToken,
) {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    loop {
        loop {
            let frame = match next_frame(&mut buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("Closing TCP connection from {}: {}", peer, e);
                    return;
                }
            };
            let Some(request) = parse_request(&frame, peer) else {
                continue;
            };
            let response = handler.handle(local_addr, peer, &request).to_string();
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                warn!("Error sending response to {}: {}", peer, e);
                return;
            }
        }

        buffer.reserve(READ_CHUNK);
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.read_buf(&mut buffer) => read,
        };
        match read {
            Ok(0) => {
                debug!("TCP connection from {} closed", peer);
                break;
            }
            Ok(n) => trace!("Read {} bytes from {}", n, peer),
            Err(e) => {
                debug!("Error reading from {}: {}", peer, e);
                break;
            }
        }
    }
}

/// Split the next complete message off the front of `buffer`.
///
/// Leading CR/LF keepalives are discarded. Returns `None` until the headers
/// and the `Content-Length` bytes of body have all arrived.
pub fn next_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    let keepalive = buffer
        .iter()
        .take_while(|b| matches!(b, b'\r' | b'\n'))
        .count();
    buffer.advance(keepalive);

    let Some(head) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buffer.len() > MAX_MESSAGE_SIZE {
            return Err(ServerError::MessageTooLarge(buffer.len()));
        }
        return Ok(None);
    };

    let total = head + 4 + content_length(&buffer[..head]);
    if total > MAX_MESSAGE_SIZE {
        return Err(ServerError::MessageTooLarge(total));
    }
    if buffer.len() < total {
        return Ok(None);
    }
    Ok(Some(buffer.split_to(total).freeze()))
}

/// Body length declared in a header block; 0 when absent or malformed
fn content_length(head: &[u8]) -> usize {
    String::from_utf8_lossy(head)
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| {
            let name = name.trim();
            name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l")
        })
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:pbx.example.com SIP/2.0\r\n\
                            Call-ID: frame-test\r\n\
                            Content-Length: 0\r\n\r\n";

    #[test]
    fn test_pipelined_messages_split() {
        let mut buffer = BytesMut::from(format!("{REGISTER}{REGISTER}").as_str());

        let first = next_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(&first[..], REGISTER.as_bytes());
        let second = next_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(&second[..], REGISTER.as_bytes());
        assert!(next_frame(&mut buffer).unwrap().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_waits_for_declared_body() {
        let head = "MESSAGE sip:100@pbx.example.com SIP/2.0\r\nl: 5\r\n\r\n";
        let mut buffer = BytesMut::from(format!("{head}hel").as_str());
        assert!(next_frame(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"lo");
        let frame = next_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.len(), head.len() + 5);
        assert!(frame.ends_with(b"hello"));
    }

    #[test]
    fn test_keepalives_skipped() {
        let mut buffer = BytesMut::from(format!("\r\n\r\n{REGISTER}").as_str());
        let frame = next_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(&frame[..], REGISTER.as_bytes());

        let mut buffer = BytesMut::from("\r\n");
        assert!(next_frame(&mut buffer).unwrap().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let head = format!("REGISTER sip:pbx SIP/2.0\r\nl: {MAX_MESSAGE_SIZE}\r\n\r\n");
        let mut buffer = BytesMut::from(head.as_str());
        assert!(matches!(next_frame(&mut buffer), Err(ServerError::MessageTooLarge(_))));

        let mut buffer = BytesMut::from(vec![b'a'; MAX_MESSAGE_SIZE + 1].as_slice());
        assert!(matches!(next_frame(&mut buffer), Err(ServerError::MessageTooLarge(_))));
    }
}
