//! Digest challenge-response for REGISTER
//!
//! The challenge half is stateless: a fresh nonce is issued with every 401
//! and the client echoes it back in its Authorization header. The expected
//! response binds the extension secret, that nonce, and the request's own
//! method and URI:
//!
//! ```text
//! response = H(secret ":" nonce ":" H(method "." uri))
//! ```
//!
//! where `H` is lowercase hex MD5.

use rsip::headers::ToTypedHeader;
use rsip::prelude::HeadersExt;
use tracing::trace;
use uuid::Uuid;

/// Lowercase hex MD5 of `input`
pub fn compute_digest(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Expected client response for a REGISTER carrying `nonce`
pub fn expected_response(secret: &str, nonce: &str, method: &str, uri: &str) -> String {
    let ha2 = compute_digest(&format!("{}.{}", method, uri));
    compute_digest(&format!("{}:{}:{}", secret, nonce, ha2))
}

/// Generate a fresh, unpredictable challenge nonce
pub fn generate_nonce() -> String {
    Uuid::new_v4().to_string()
}

/// Value of a `WWW-Authenticate` challenge header
pub fn challenge_value(realm: &str, nonce: &str) -> String {
    format!("Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5", realm, nonce)
}

/// Digest parameters presented by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub response: String,
}

impl DigestCredentials {
    /// Extract the client's digest parameters from a request.
    ///
    /// Returns `None` when there is no Authorization header or it does not
    /// parse as a digest credential.
    pub fn from_request(request: &rsip::Request) -> Option<Self> {
        let header = request.authorization_header()?;
        match header.typed() {
            Ok(auth) => Some(Self {
                username: auth.username,
                realm: auth.realm,
                nonce: auth.nonce,
                response: auth.response,
            }),
            Err(e) => {
                trace!("unparseable authorization header: {}", e);
                None
            }
        }
    }

    /// Check the presented response against the expected digest for `request`
    pub fn verify(&self, secret: &str, request: &rsip::Request) -> bool {
        let expected = expected_response(
            secret,
            &self.nonce,
            &request.method.to_string(),
            &request.uri.to_string(),
        );
        expected == self.response.to_ascii_lowercase()
    }
}
