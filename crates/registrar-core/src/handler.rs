//! REGISTER request handling
//!
//! Receives requests parsed by the SIP transport, challenges or authenticates
//! them against the [`Registry`], and stamps the server agent and an empty
//! body length on every reply.

use std::net::SocketAddr;
use std::sync::Arc;

use rsip::prelude::HeadersExt;
use rsip::{Header, headers};
use tracing::{debug, trace};

use crate::auth;
use crate::registry::Registry;
use crate::response;

/// Identifying token placed in the `Server` header of every response
pub const SERVER_AGENT: &str = concat!("sipreg/", env!("CARGO_PKG_VERSION"));

/// Dispatches inbound requests to the registry
#[derive(Clone)]
pub struct RequestHandler {
    registry: Arc<Registry>,
}

impl RequestHandler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Produce the response for one inbound request
    pub fn handle(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        request: &rsip::Request,
    ) -> rsip::Response {
        trace!("sip request {} {}: {}", local, remote, request.method);

        let mut response = if request.method != rsip::Method::Register {
            response::reply(request, rsip::StatusCode::MethodNotAllowed)
        } else if request.authorization_header().is_none() {
            self.challenge(request)
        } else {
            self.registry.refresh(local, remote, request)
        };

        debug!("{} from {} -> {:?}", request.method, remote, response.status_code);
        response
            .headers
            .push(Header::Server(headers::Server::from(SERVER_AGENT)));
        // Stream transports frame on it
        response
            .headers
            .push(Header::ContentLength(headers::ContentLength::from("0")));
        response
    }

    /// 401 with a fresh nonce for the configured realm
    pub fn challenge(&self, request: &rsip::Request) -> rsip::Response {
        let nonce = auth::generate_nonce();
        let mut response = response::reply(request, rsip::StatusCode::Unauthorized);
        response.headers.push(Header::WwwAuthenticate(headers::WwwAuthenticate::from(
            auth::challenge_value(self.registry.realm(), &nonce),
        )));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExtensionRecord;

    fn request(method: rsip::Method) -> rsip::Request {
        let mut list = rsip::Headers::default();
        list.push(headers::CallId::from("handler-test").into());
        list.push(headers::Contact::from("<sip:100@192.168.1.20:5062>").into());
        rsip::Request {
            method,
            uri: rsip::Uri::try_from("sip:pbx.example.com").unwrap(),
            version: rsip::Version::V2,
            headers: list,
            body: Vec::new(),
        }
    }

    fn handler() -> RequestHandler {
        let registry = Arc::new(Registry::new("pbx.example.com"));
        registry.upsert(ExtensionRecord::new(100));
        RequestHandler::new(registry)
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            SocketAddr::from(([10, 0, 0, 1], 5060)),
            SocketAddr::from(([192, 168, 1, 20], 5062)),
        )
    }

    #[test]
    fn test_non_register_rejected() {
        let (local, remote) = addrs();
        let response = handler().handle(local, remote, &request(rsip::Method::Invite));
        assert_eq!(response.status_code, rsip::StatusCode::MethodNotAllowed);
        assert!(response.www_authenticate_header().is_none());
    }

    #[test]
    fn test_unauthenticated_register_challenged() {
        let (local, remote) = addrs();
        let response = handler().handle(local, remote, &request(rsip::Method::Register));
        assert_eq!(response.status_code, rsip::StatusCode::Unauthorized);

        let challenge = response.www_authenticate_header().unwrap().to_string();
        assert!(challenge.contains("realm=\"pbx.example.com\""));
        assert!(challenge.contains("nonce=\""));
    }

    #[test]
    fn test_server_agent_stamped() {
        let (local, remote) = addrs();
        let response = handler().handle(local, remote, &request(rsip::Method::Options));
        let server = response
            .headers
            .iter()
            .find_map(|h| match h {
                Header::Server(server) => Some(server.to_string()),
                _ => None,
            })
            .unwrap();
        assert!(server.contains(SERVER_AGENT));
        assert!(response.to_string().contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn test_each_challenge_has_fresh_nonce() {
        let handler = handler();
        let req = request(rsip::Method::Register);
        let a = handler.challenge(&req).www_authenticate_header().unwrap().to_string();
        let b = handler.challenge(&req).www_authenticate_header().unwrap().to_string();
        assert_ne!(a, b);
    }
}
