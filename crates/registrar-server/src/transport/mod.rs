//! SIP transports for REGISTER traffic
//!
//! UDP and TCP listeners share one bind address. Both hand parsed requests to
//! the same [`RequestHandler`](sipreg_registrar_core::RequestHandler).

mod tcp;
mod udp;

pub use tcp::{MAX_MESSAGE_SIZE, TcpTransport, next_frame};
pub use udp::UdpTransport;

use std::net::SocketAddr;

use tracing::{debug, warn};

/// Parse one SIP message, keeping only requests
fn parse_request(packet: &[u8], src: SocketAddr) -> Option<rsip::Request> {
    match rsip::SipMessage::try_from(packet) {
        Ok(rsip::SipMessage::Request(request)) => Some(request),
        Ok(rsip::SipMessage::Response(response)) => {
            debug!("ignoring {:?} response from {}", response.status_code, src);
            None
        }
        Err(e) => {
            warn!("Error parsing SIP message from {}: {}", src, e);
            None
        }
    }
}
