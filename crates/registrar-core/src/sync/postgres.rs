//! PostgreSQL directory store
//!
//! Extensions come from the `ext` accounts table joined with the `auth`
//! credentials table. Change notifications use LISTEN/NOTIFY.

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use crate::error::{RegistrarError, Result};
use crate::sync::store::{ChangeFeed, DirectoryStore, ExtensionRow};

const EXTENSIONS_QUERY: &str = r#"
    SELECT ext.id::BIGINT AS id,
           auth.name AS name,
           ext.display AS display,
           ext.type AS kind,
           auth.secret AS secret
      FROM ext
      JOIN auth ON ext."user" = auth."user"
"#;

/// Directory store backed by a PostgreSQL database
pub struct PgDirectoryStore {
    /// Replaced when the session limit changes
    pool: RwLock<PgPool>,
    url: String,
}

fn lazy_pool(url: &str, max_connections: u32) -> Result<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_lazy(url)?)
}

impl PgDirectoryStore {
    /// Create a store for `url`; connections are opened on first use.
    pub fn new(url: &str, max_connections: u32) -> Result<Self> {
        let pool = lazy_pool(url, max_connections)?;
        info!(
            "PostgreSQL directory store configured ({} sessions)",
            max_connections.max(1)
        );
        Ok(Self {
            pool: RwLock::new(pool),
            url: url.to_string(),
        })
    }

    /// Maximum connections of the current pool
    pub fn session_limit(&self) -> u32 {
        self.pool.read().options().get_max_connections()
    }

    fn pool(&self) -> PgPool {
        self.pool.read().clone()
    }
}

#[async_trait]
impl DirectoryStore for PgDirectoryStore {
    async fn load_extensions(&self) -> Result<Vec<ExtensionRow>> {
        let rows = sqlx::query_as::<_, ExtensionRow>(EXTENSIONS_QUERY)
            .fetch_all(&self.pool())
            .await
            .map_err(|e| RegistrarError::StoreError(e.to_string()))?;
        debug!("loaded {} extension rows", rows.len());
        Ok(rows)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool())
            .await
            .map_err(|e| RegistrarError::StoreError(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChangeFeed>> {
        let mut listener = PgListener::connect(&self.url)
            .await
            .map_err(|e| RegistrarError::ListenerUnavailable(e.to_string()))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| RegistrarError::ListenerUnavailable(e.to_string()))?;
        info!("listening for directory changes on {}", channel);
        Ok(Box::new(PgChangeFeed { listener }))
    }

    fn set_session_limit(&self, sessions: usize) {
        let sessions = u32::try_from(sessions).unwrap_or(u32::MAX).max(1);
        if sessions == self.session_limit() {
            return;
        }
        match lazy_pool(&self.url, sessions) {
            Ok(pool) => {
                let old = std::mem::replace(&mut *self.pool.write(), pool);
                info!("PostgreSQL directory store resized to {} sessions", sessions);
                // Queries already running hold clones of the old pool
                tokio::spawn(async move { old.close().await });
            }
            Err(e) => warn!("keeping current pool, resize failed: {}", e),
        }
    }
}

struct PgChangeFeed {
    listener: PgListener,
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn next(&mut self) -> Result<Option<String>> {
        let notification = self.listener.recv().await?;
        Ok(Some(notification.payload().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lazy_pool_needs_no_server() {
        assert!(PgDirectoryStore::new("postgres://sipreg@127.0.0.1:1/sipreg", 2).is_ok());
    }

    #[tokio::test]
    async fn test_session_limit_follows_resize() {
        let store = PgDirectoryStore::new("postgres://sipreg@127.0.0.1:1/sipreg", 2).unwrap();
        assert_eq!(store.session_limit(), 2);

        store.set_session_limit(6);
        assert_eq!(store.session_limit(), 6);

        store.set_session_limit(0);
        assert_eq!(store.session_limit(), 1);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let err = PgDirectoryStore::new("not a url", 2).err().unwrap();
        assert!(matches!(err, RegistrarError::StoreError(_)));
    }
}
