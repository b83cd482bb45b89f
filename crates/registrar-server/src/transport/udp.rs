//! UDP transport
//!
//! One receive loop per socket; each request is answered from its own task.
//! Responses and unparseable datagrams are dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use sipreg_registrar_core::RequestHandler;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use super::parse_request;
use crate::error::Result;

// Largest datagram we accept
const MAX_DATAGRAM: usize = 65_535;

/// SIP over UDP bound to one local address
pub struct UdpTransport {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    receiver: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind `addr` and start answering requests with `handler`
    pub async fn bind(addr: SocketAddr, handler: RequestHandler) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("SIP UDP transport bound to {}", local_addr);

        let cancel = CancellationToken::new();
        let receiver = tokio::spawn(receive_loop(
            socket,
            local_addr,
            handler,
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            cancel,
            receiver,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the receive loop and wait for it to exit
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.receiver.await;
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    handler: RequestHandler,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, src) = match received {
            Ok(received) => received,
            Err(e) => {
                error!("Error receiving UDP packet: {}", e);
                continue;
            }
        };

        let packet = &buf[..len];
        if packet.iter().all(|b| b.is_ascii_whitespace()) {
            trace!("keepalive from {}", src);
            continue;
        }

        let Some(request) = parse_request(packet, src) else {
            continue;
        };

        let socket = Arc::clone(&socket);
        let handler = handler.clone();
        tokio::spawn(async move {
            let response = handler.handle(local_addr, src, &request);
            let bytes = response.to_string();
            if let Err(e) = socket.send_to(bytes.as_bytes(), src).await {
                warn!("Error sending response to {}: {}", src, e);
            }
        });
    }
    info!("UDP receive loop on {} terminated", local_addr);
}
