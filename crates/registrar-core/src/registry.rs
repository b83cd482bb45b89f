//! Extension directory with digest-authenticated registration refresh

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rsip::prelude::HeadersExt;
use rsip::headers::ToTypedHeader;
use tracing::{debug, info, warn};

use crate::auth::DigestCredentials;
use crate::response;
use crate::types::{Endpoint, ExtensionRecord};

/// Lifetime granted to every successful registration
pub const REGISTRATION_LIFETIME_SECS: i64 = 120;

/// Thread-safe extension directory keyed by extension id
pub struct Registry {
    /// Map of extension id to the current record
    extensions: DashMap<u32, Arc<ExtensionRecord>>,

    /// Authentication realm presented in challenges
    realm: String,
}

impl Registry {
    /// Create an empty registry for `realm`
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            extensions: DashMap::new(),
            realm: realm.into(),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn get(&self, id: u32) -> Option<Arc<ExtensionRecord>> {
        self.extensions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn exists(&self, id: u32) -> bool {
        self.extensions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Insert or replace a record.
    ///
    /// A preset record is never replaced by a non-preset one, and a store row
    /// from an older sync pass never replaces one from a newer pass. Records
    /// not produced by a sync pass (generation 0) always replace. A
    /// replacement inherits the endpoint state of the record it replaces.
    pub fn upsert(&self, mut record: ExtensionRecord) -> bool {
        if record.display.is_empty() {
            record.display = record.name.clone();
        }
        if record.display.is_empty() {
            record.display = format!("Ext {}", record.id);
        }

        match self.extensions.entry(record.id) {
            Entry::Occupied(mut entry) => {
                let old = entry.get();
                if old.preset && !record.preset {
                    warn!("extension {} is preset, ignoring store update", record.id);
                    return false;
                }
                let from_sync = record.generation > 0;
                if from_sync
                    && !record.preset
                    && !old.preset
                    && record.generation < old.generation
                {
                    debug!(
                        "extension {} already at generation {}, ignoring generation {}",
                        record.id, old.generation, record.generation
                    );
                    return false;
                }
                record.retain(old);
                entry.insert(Arc::new(record));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(record));
            }
        }
        true
    }

    /// Remove a record; returns whether it existed
    pub fn remove(&self, id: u32) -> bool {
        self.extensions.remove(&id).is_some()
    }

    /// Remove every non-preset record loaded before `generation`.
    ///
    /// Called once per completed sync pass with that pass's generation.
    pub fn prune(&self, generation: u64) -> usize {
        let before = self.extensions.len();
        self.extensions
            .retain(|_, ext| ext.preset || ext.generation >= generation);
        let pruned = before.saturating_sub(self.extensions.len());
        if pruned > 0 {
            info!("pruned {} stale extensions below generation {}", pruned, generation);
        }
        pruned
    }

    /// Remove preset records whose id is not in `keep`
    pub fn retain_presets(&self, keep: &HashSet<u32>) -> usize {
        let before = self.extensions.len();
        self.extensions
            .retain(|id, ext| !ext.preset || keep.contains(id));
        before.saturating_sub(self.extensions.len())
    }

    /// Snapshot of all records sorted by id
    pub fn enumerate(&self) -> Vec<Arc<ExtensionRecord>> {
        let mut records: Vec<Arc<ExtensionRecord>> = self
            .extensions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        records.sort_by_key(|ext| ext.id);
        records
    }

    /// Drop expired endpoints of every extension; returns how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let dropped: usize = self.enumerate().iter().map(|ext| ext.sweep()).sum();
        if dropped > 0 {
            debug!("expired {} endpoints", dropped);
        }
        dropped
    }

    /// Authenticate a REGISTER carrying credentials and refresh the binding.
    ///
    /// Requests without an Authorization header must be challenged by the
    /// caller before reaching this point.
    pub fn refresh(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        request: &rsip::Request,
    ) -> rsip::Response {
        let contact = match request.contact_header().and_then(|c| c.typed()) {
            Ok(contact) => contact,
            Err(_) => return response::reply(request, rsip::StatusCode::BadRequest),
        };

        let ext = contact
            .uri
            .auth
            .as_ref()
            .and_then(|auth| auth.user.parse::<u32>().ok())
            .and_then(|id| self.get(id));
        let Some(ext) = ext else {
            debug!("register from {} for unknown contact {}", remote, contact.uri);
            return response::reply(request, rsip::StatusCode::NotFound);
        };

        let Some(credentials) = DigestCredentials::from_request(request) else {
            return response::reply(request, rsip::StatusCode::Unauthorized);
        };
        if credentials.username != ext.auth_user {
            debug!("extension {}: digest user {} rejected", ext.id, credentials.username);
            return response::reply(request, rsip::StatusCode::Unauthorized);
        }
        if !credentials.verify(&ext.secret, request) {
            debug!("extension {}: digest mismatch from {}", ext.id, remote);
            return response::reply(request, rsip::StatusCode::Unauthorized);
        }

        ext.refresh(Endpoint {
            remote,
            local,
            expires_at: Utc::now() + Duration::seconds(REGISTRATION_LIFETIME_SECS),
        });
        debug!("extension {} registered from {}", ext.id, remote);
        response::reply(request, rsip::StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExtensionKind;

    fn record(id: u32, generation: u64) -> ExtensionRecord {
        let mut ext = ExtensionRecord::new(id);
        ext.generation = generation;
        ext
    }

    fn preset(id: u32) -> ExtensionRecord {
        let mut ext = ExtensionRecord::new(id);
        ext.preset = true;
        ext
    }

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            remote: SocketAddr::from(([192, 168, 1, 20], port)),
            local: SocketAddr::from(([10, 0, 0, 1], 5060)),
            expires_at: Utc::now() + Duration::seconds(120),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let registry = Registry::new("pbx");
        assert!(registry.upsert(record(100, 1)));
        assert!(registry.exists(100));
        assert!(!registry.exists(101));
        assert_eq!(registry.get(100).unwrap().id, 100);
        assert!(registry.get(101).is_none());
        assert_eq!(registry.realm(), "pbx");
    }

    #[test]
    fn test_display_normalization() {
        let registry = Registry::new("pbx");

        let mut named = ExtensionRecord::new(10);
        named.name = "alice".to_string();
        named.display = String::new();
        registry.upsert(named);
        assert_eq!(registry.get(10).unwrap().display, "alice");

        let mut bare = ExtensionRecord::new(11);
        bare.name = String::new();
        bare.display = String::new();
        registry.upsert(bare);
        assert_eq!(registry.get(11).unwrap().display, "Ext 11");
    }

    #[test]
    fn test_upsert_idempotent() {
        let registry = Registry::new("pbx");
        let ext = record(100, 3);
        assert!(registry.upsert(ext.clone()));
        registry.get(100).unwrap().refresh(endpoint(5062));

        assert!(registry.upsert(ext));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(100).unwrap().endpoint_count(), 1);
    }

    #[test]
    fn test_preset_not_demoted() {
        let registry = Registry::new("pbx");
        let mut original = preset(1);
        original.secret = "config".to_string();
        assert!(registry.upsert(original));

        let mut row = record(1, 9);
        row.secret = "store".to_string();
        assert!(!registry.upsert(row));

        let current = registry.get(1).unwrap();
        assert!(current.preset);
        assert_eq!(current.secret, "config");
    }

    #[test]
    fn test_preset_replaces_store_record() {
        let registry = Registry::new("pbx");
        assert!(registry.upsert(record(1, 4)));
        assert!(registry.upsert(preset(1)));
        assert!(registry.get(1).unwrap().preset);
    }

    #[test]
    fn test_older_generation_rejected() {
        let registry = Registry::new("pbx");
        assert!(registry.upsert(record(5, 6)));
        assert!(!registry.upsert(record(5, 5)));
        assert_eq!(registry.get(5).unwrap().generation, 6);
        assert!(registry.upsert(record(5, 7)));
        assert_eq!(registry.get(5).unwrap().generation, 7);
    }

    #[test]
    fn test_manual_record_replaces_synced() {
        let registry = Registry::new("pbx");
        assert!(registry.upsert(record(5, 6)));
        registry.get(5).unwrap().refresh(endpoint(5062));

        let mut manual = ExtensionRecord::new(5);
        manual.secret = "admin-set".to_string();
        assert!(registry.upsert(manual));

        let current = registry.get(5).unwrap();
        assert_eq!(current.generation, 0);
        assert_eq!(current.secret, "admin-set");
        assert_eq!(current.endpoint_count(), 1);
    }

    #[test]
    fn test_replace_inherits_endpoints() {
        let registry = Registry::new("pbx");
        registry.upsert(record(100, 1));
        let old = registry.get(100).unwrap();
        old.refresh(endpoint(5062));
        old.refresh(endpoint(5064));

        let mut new = record(100, 2);
        new.display = "Reception".to_string();
        new.kind = ExtensionKind::Group;
        assert!(registry.upsert(new));

        let current = registry.get(100).unwrap();
        assert_eq!(current.display, "Reception");
        assert_eq!(current.endpoints(), old.endpoints());
        assert!(current.shares_bindings(&old));

        // Bindings keep flowing to the replacement
        old.refresh(endpoint(5066));
        assert_eq!(current.endpoint_count(), 3);
    }

    #[test]
    fn test_remove() {
        let registry = Registry::new("pbx");
        registry.upsert(record(100, 1));
        assert!(registry.remove(100));
        assert!(!registry.remove(100));
        assert!(!registry.exists(100));
    }

    #[test]
    fn test_prune_by_generation() {
        let registry = Registry::new("pbx");
        registry.upsert(preset(1));
        registry.upsert(record(40, 4));
        for id in [10, 20, 30] {
            registry.upsert(record(id, 5));
        }
        registry.upsert(record(50, 6));

        assert_eq!(registry.prune(5), 1);

        let ids: Vec<u32> = registry.enumerate().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 10, 20, 30, 50]);
    }

    #[test]
    fn test_prune_removes_manual_records() {
        let registry = Registry::new("pbx");
        registry.upsert(record(7, 0));
        registry.upsert(preset(8));
        registry.prune(1);
        assert!(!registry.exists(7));
        assert!(registry.exists(8));
    }

    #[test]
    fn test_retain_presets() {
        let registry = Registry::new("pbx");
        registry.upsert(preset(1));
        registry.upsert(preset(2));
        registry.upsert(record(3, 1));

        let keep: HashSet<u32> = [2].into_iter().collect();
        assert_eq!(registry.retain_presets(&keep), 1);
        assert!(!registry.exists(1));
        assert!(registry.exists(2));
        assert!(registry.exists(3));
    }

    #[test]
    fn test_enumerate_sorted() {
        let registry = Registry::new("pbx");
        for id in [30, 5, 400, 12] {
            registry.upsert(record(id, 1));
        }
        let ids: Vec<u32> = registry.enumerate().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 12, 30, 400]);
    }

    #[test]
    fn test_enumerate_during_mutation() {
        let registry = Arc::new(Registry::new("pbx"));
        for id in 0..200 {
            registry.upsert(record(id, 1));
        }

        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for id in 200..400 {
                    registry.upsert(record(id, 1));
                    registry.remove(id - 200);
                }
            })
        };

        for _ in 0..20 {
            let snapshot = registry.enumerate();
            assert!(snapshot.windows(2).all(|w| w[0].id < w[1].id));
        }
        writer.join().unwrap();

        let ids: Vec<u32> = registry.enumerate().iter().map(|e| e.id).collect();
        assert_eq!(ids, (200..400).collect::<Vec<u32>>());
    }

    #[test]
    fn test_sweep_expired() {
        let registry = Registry::new("pbx");
        registry.upsert(record(1, 1));
        let ext = registry.get(1).unwrap();
        ext.refresh(Endpoint {
            expires_at: Utc::now() - Duration::seconds(1),
            ..endpoint(5062)
        });
        ext.refresh(endpoint(5064));

        assert_eq!(registry.sweep_expired(), 1);
        assert_eq!(ext.endpoint_count(), 1);
    }
}
