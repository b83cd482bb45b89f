//! Core types for the extension directory

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// ============ Extension Types ============

/// Account classification of an extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExtensionKind {
    #[default]
    User,
    Group,
    Admin,
}

impl ExtensionKind {
    /// Parse a textual kind, falling back to `User` for anything unrecognized.
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "GROUP" => ExtensionKind::Group,
            "ADMIN" => ExtensionKind::Admin,
            _ => ExtensionKind::User,
        }
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionKind::User => write!(f, "USER"),
            ExtensionKind::Group => write!(f, "GROUP"),
            ExtensionKind::Admin => write!(f, "ADMIN"),
        }
    }
}

/// One live contact binding of an extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Transport address of the registering peer
    pub remote: SocketAddr,

    /// Local transport address the registration arrived on
    pub local: SocketAddr,

    /// When this binding expires
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BindingState {
    endpoints: Vec<Endpoint>,
    expires: DateTime<Utc>,
}

/// Lock-protected endpoint list shared by every version of one extension.
///
/// When a record is replaced by a directory refresh, the new record points at
/// the same `Bindings` so live registrations survive the replacement.
#[derive(Debug)]
pub struct Bindings {
    state: Mutex<BindingState>,
}

impl Bindings {
    fn new() -> Self {
        Self {
            state: Mutex::new(BindingState {
                endpoints: Vec::new(),
                expires: DateTime::<Utc>::MIN_UTC,
            }),
        }
    }
}

/// A SIP account and its registered endpoints
#[derive(Debug, Clone)]
pub struct ExtensionRecord {
    /// Numeric extension id, unique within the registry
    pub id: u32,

    /// Account name
    pub name: String,

    /// Display name presented to peers
    pub display: String,

    /// Digest username a registering client must present
    pub auth_user: String,

    /// Shared secret used to compute the expected digest
    pub secret: String,

    pub kind: ExtensionKind,

    /// Loaded from static configuration; never pruned or demoted by the store
    pub preset: bool,

    /// Sync pass that last loaded this record from the store (0 if never)
    pub generation: u64,

    bindings: Arc<Bindings>,
}

impl ExtensionRecord {
    /// Create a record with default metadata for `id`
    pub fn new(id: u32) -> Self {
        Self {
            id,
            name: format!("User {}", id),
            display: format!("Ext {}", id),
            auth_user: id.to_string(),
            secret: String::new(),
            kind: ExtensionKind::User,
            preset: false,
            generation: 0,
            bindings: Arc::new(Bindings::new()),
        }
    }

    /// Take over the endpoint state of the record this one replaces
    pub(crate) fn retain(&mut self, older: &ExtensionRecord) {
        self.bindings = Arc::clone(&older.bindings);
    }

    /// Whether two records share the same endpoint state
    pub fn shares_bindings(&self, other: &ExtensionRecord) -> bool {
        Arc::ptr_eq(&self.bindings, &other.bindings)
    }

    /// Add a binding, or renew the one registered from the same remote address.
    pub fn refresh(&self, endpoint: Endpoint) {
        let mut state = self.bindings.state.lock();
        if endpoint.expires_at > state.expires {
            state.expires = endpoint.expires_at;
        }

        if let Some(existing) = state
            .endpoints
            .iter_mut()
            .find(|ep| ep.remote == endpoint.remote)
        {
            existing.expires_at = endpoint.expires_at;
            existing.local = endpoint.local;
            return;
        }
        state.endpoints.push(endpoint);
    }

    /// Drop endpoints that have expired as of now
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Drop endpoints whose expiry is at or before `now`.
    ///
    /// The aggregate expiry becomes the latest survivor's expiry, or keeps its
    /// last value when nothing survives. Returns the number of dropped endpoints.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.bindings.state.lock();
        let before = state.endpoints.len();
        state.endpoints.retain(|ep| ep.expires_at > now);

        if let Some(latest) = state.endpoints.iter().map(|ep| ep.expires_at).max() {
            state.expires = latest;
        }
        before - state.endpoints.len()
    }

    /// Cheap liveness check against the aggregate expiry
    pub fn is_expired(&self) -> bool {
        self.bindings.state.lock().expires < Utc::now()
    }

    /// Latest expiry across all endpoints, if anything ever registered
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        let expires = self.bindings.state.lock().expires;
        (expires != DateTime::<Utc>::MIN_UTC).then_some(expires)
    }

    /// Point-in-time copy of the registered endpoints
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.bindings.state.lock().endpoints.clone()
    }

    pub fn endpoint_count(&self) -> usize {
        self.bindings.state.lock().endpoints.len()
    }
}
