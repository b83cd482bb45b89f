//! Store trait for directory synchronization

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::types::{ExtensionKind, ExtensionRecord};

/// One account row joined with its credential
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ExtensionRow {
    /// External account id; rows that do not fit a `u32` are skipped
    pub id: i64,
    /// Credential name, used as both account name and digest user
    pub name: String,
    pub display: Option<String>,
    pub kind: Option<String>,
    pub secret: String,
}

impl ExtensionRow {
    /// Build the non-preset record for this row at `generation`
    pub fn to_record(&self, generation: u64) -> Option<ExtensionRecord> {
        let Ok(id) = u32::try_from(self.id) else {
            warn!("skipping store row with invalid extension id {}", self.id);
            return None;
        };

        let mut ext = ExtensionRecord::new(id);
        ext.name = self.name.clone();
        ext.auth_user = self.name.clone();
        ext.display = self.display.clone().unwrap_or_default();
        ext.kind = self
            .kind
            .as_deref()
            .map(ExtensionKind::parse_lossy)
            .unwrap_or_default();
        ext.secret = self.secret.clone();
        ext.preset = false;
        ext.generation = generation;
        Some(ext)
    }
}

/// Abstract store holding the extension directory
/// Implement this trait for different backends (PostgreSQL, memory, etc.)
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Load every account with its resolved credential
    async fn load_extensions(&self) -> Result<Vec<ExtensionRow>>;

    /// Publish `payload` on a notification channel
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a dedicated subscription to a notification channel
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChangeFeed>>;

    /// Adjust how many concurrent sessions the store may open
    fn set_session_limit(&self, _sessions: usize) {}
}

/// Subscription to a change-notification channel.
///
/// Dropping the feed closes the underlying connection.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Wait for the next notification payload; `None` once the feed is closed
    async fn next(&mut self) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64) -> ExtensionRow {
        ExtensionRow {
            id,
            name: "alice".to_string(),
            display: None,
            kind: Some("GROUP".to_string()),
            secret: "pw".to_string(),
        }
    }

    #[test]
    fn test_row_to_record() {
        let ext = row(42).to_record(7).unwrap();
        assert_eq!(ext.id, 42);
        assert_eq!(ext.name, "alice");
        assert_eq!(ext.auth_user, "alice");
        assert_eq!(ext.kind, ExtensionKind::Group);
        assert_eq!(ext.secret, "pw");
        assert_eq!(ext.generation, 7);
        assert!(!ext.preset);
        // Normalized by the registry on upsert
        assert!(ext.display.is_empty());
    }

    #[test]
    fn test_unknown_kind_is_user() {
        let mut r = row(1);
        r.kind = Some("trunk".to_string());
        assert_eq!(r.to_record(1).unwrap().kind, ExtensionKind::User);
        r.kind = None;
        assert_eq!(r.to_record(1).unwrap().kind, ExtensionKind::User);
    }

    #[test]
    fn test_invalid_ids_skipped() {
        assert!(row(-1).to_record(1).is_none());
        assert!(row(i64::from(u32::MAX) + 1).to_record(1).is_none());
        assert!(row(i64::from(u32::MAX)).to_record(1).is_some());
    }
}
