//! Configuration for the registrar
//!
//! The configuration is an INI document. The `[server]` section carries the
//! service settings; every section named by a numeric id defines a preset
//! extension:
//!
//! ```ini
//! [server]
//! realm = pbx.example.com
//! port = 5060
//! connections = 4
//! database = postgres://registrar@localhost/pbx
//!
//! [100]
//! name = reception
//! type = USER
//! display = Front Desk
//! secret = s3cr3t
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use config::{Config, File, FileFormat, Value};
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{ExtensionKind, ExtensionRecord};

/// Connection string that disables store integration
pub const NO_DATABASE: &str = "none";

const DEFAULT_PORT: u16 = 5060;
const DEFAULT_CONNECTIONS: usize = 4;
const DEFAULT_LISTEN_CHANNEL: &str = "extensions";
const DEFAULT_NOTIFY_CHANNEL: &str = "backend";

/// Main configuration
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub server: ServerConfig,
    pub extensions: Vec<StaticExtension>,
}

/// `[server]` section
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Authentication realm; `None` means the host name
    pub realm: Option<String>,
    pub bind: IpAddr,
    pub port: u16,
    /// Maximum concurrent store sessions
    pub connections: usize,
    /// Store connection string, or [`NO_DATABASE`]
    pub database: String,
    /// Channel this process listens on for directory changes
    pub listen_channel: String,
    /// Channel this process publishes its own changes on
    pub notify_channel: String,
}

/// One preset extension section
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticExtension {
    pub id: u32,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub display: Option<String>,
    pub secret: Option<String>,
    pub auth: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            realm: None,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            connections: DEFAULT_CONNECTIONS,
            database: NO_DATABASE.to_string(),
            listen_channel: DEFAULT_LISTEN_CHANNEL.to_string(),
            notify_channel: DEFAULT_NOTIFY_CHANNEL.to_string(),
        }
    }
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            extensions: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Whether a store is configured
    pub fn has_database(&self) -> bool {
        let dsn = self.database.trim();
        !dsn.is_empty() && dsn != NO_DATABASE
    }
}

impl StaticExtension {
    /// Build the preset record for this section, defaulting missing fields
    pub fn to_record(&self) -> ExtensionRecord {
        let mut ext = ExtensionRecord::new(self.id);
        if let Some(name) = non_empty(&self.name) {
            ext.name = name;
        }
        if let Some(kind) = &self.kind {
            ext.kind = ExtensionKind::parse_lossy(kind);
        }
        if let Some(display) = non_empty(&self.display) {
            ext.display = display;
        }
        if let Some(secret) = &self.secret {
            ext.secret = secret.clone();
        }
        if let Some(auth) = non_empty(&self.auth) {
            ext.auth_user = auth;
        }
        ext.preset = true;
        ext.generation = 0;
        ext
    }
}

impl RegistrarConfig {
    /// Load configuration from an INI file; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading config from {}", path.display());
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini).required(false))
            .build()?;
        Self::from_settings(settings)
    }

    /// Parse configuration from INI text
    pub fn from_ini(text: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Ini))
            .build()?;
        Self::from_settings(settings)
    }

    /// Resolved authentication realm
    pub fn realm(&self) -> String {
        self.server.realm.clone().unwrap_or_else(host_name)
    }

    fn from_settings(settings: Config) -> Result<Self> {
        let root: HashMap<String, Value> = settings.try_deserialize()?;
        let mut config = RegistrarConfig::default();

        for (key, value) in root {
            let Ok(table) = value.into_table() else {
                continue;
            };
            let section: HashMap<String, String> = table
                .into_iter()
                .filter_map(|(k, v)| v.into_string().ok().map(|v| (k.to_ascii_lowercase(), v)))
                .collect();

            if key.eq_ignore_ascii_case("server") {
                config.server = parse_server(&section);
            } else if let Ok(id) = key.trim().parse::<u32>() {
                config.extensions.push(StaticExtension {
                    id,
                    name: section.get("name").cloned(),
                    kind: section.get("type").cloned(),
                    display: section.get("display").cloned(),
                    secret: section.get("secret").cloned(),
                    auth: section.get("auth").cloned(),
                });
            } else {
                debug!("ignoring config section [{}]", key);
            }
        }

        config.extensions.sort_by_key(|ext| ext.id);
        Ok(config)
    }
}

fn parse_server(section: &HashMap<String, String>) -> ServerConfig {
    let mut server = ServerConfig::default();

    server.realm = non_empty(&section.get("realm").cloned());

    if let Some(bind) = section.get("bind").filter(|b| !b.trim().is_empty()) {
        match bind.trim().parse::<IpAddr>() {
            Ok(addr) => server.bind = addr,
            Err(_) => warn!("invalid bind address {}, using {}", bind, server.bind),
        }
    }

    if let Some(port) = section.get("port") {
        match port.trim().parse::<u16>() {
            Ok(port) if port > 0 => server.port = port,
            _ => warn!("invalid port {}, using {}", port, DEFAULT_PORT),
        }
    }

    if let Some(connections) = section.get("connections") {
        match connections.trim().parse::<usize>() {
            Ok(count) => server.connections = count.max(1),
            Err(_) => warn!("invalid connections {}, using {}", connections, DEFAULT_CONNECTIONS),
        }
    }

    if let Some(database) = non_empty(&section.get("database").cloned()) {
        server.database = database;
    }
    if let Some(listen) = non_empty(&section.get("listen").cloned()) {
        server.listen_channel = listen;
    }
    if let Some(notify) = non_empty(&section.get("notify").cloned()) {
        server.notify_channel = notify;
    }

    server
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// The host's own name, used as the default realm
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
[server]
realm = pbx.example.com
bind = 127.0.0.1
port = 5070
connections = 2
database = postgres://registrar@localhost/pbx

[100]
name = reception
type = ADMIN
display = Front Desk
secret = s3cr3t

[200]
type = conference

[paging]
name = ignored
"#;

    #[test]
    fn test_parse_sample() {
        let config = RegistrarConfig::from_ini(SAMPLE).unwrap();

        assert_eq!(config.server.realm.as_deref(), Some("pbx.example.com"));
        assert_eq!(config.server.bind, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.server.port, 5070);
        assert_eq!(config.server.connections, 2);
        assert!(config.server.has_database());
        assert_eq!(config.server.listen_channel, "extensions");
        assert_eq!(config.server.notify_channel, "backend");

        let ids: Vec<u32> = config.extensions.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![100, 200]);
    }

    #[test]
    fn test_static_records() {
        let config = RegistrarConfig::from_ini(SAMPLE).unwrap();

        let reception = config.extensions[0].to_record();
        assert_eq!(reception.name, "reception");
        assert_eq!(reception.display, "Front Desk");
        assert_eq!(reception.kind, ExtensionKind::Admin);
        assert_eq!(reception.secret, "s3cr3t");
        assert_eq!(reception.auth_user, "100");
        assert!(reception.preset);
        assert_eq!(reception.generation, 0);

        // Unknown type and missing fields fall back to defaults
        let conference = config.extensions[1].to_record();
        assert_eq!(conference.kind, ExtensionKind::User);
        assert_eq!(conference.name, "User 200");
        assert_eq!(conference.display, "Ext 200");
        assert!(conference.preset);
    }

    #[test]
    fn test_defaults_and_fallbacks() {
        let text = "[server]\nport = nonsense\nbind = not-an-ip\nconnections = 0\n";
        let config = RegistrarConfig::from_ini(text).unwrap();

        assert_eq!(config.server.port, 5060);
        assert_eq!(config.server.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.server.connections, 1);
        assert!(!config.server.has_database());
        assert!(config.server.realm.is_none());
        assert!(!config.realm().is_empty());
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = RegistrarConfig::load("/nonexistent/sipreg.conf").unwrap();
        assert!(config.extensions.is_empty());
        assert_eq!(config.server.database, NO_DATABASE);
    }
}
