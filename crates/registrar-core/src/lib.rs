//! # Registrar Core
//!
//! Extension directory and registration service for a SIP registrar.
//!
//! This crate provides:
//! - The [`Registry`]: a concurrent directory of extensions and their live
//!   endpoints, with digest-authenticated REGISTER refresh
//! - The [`RequestHandler`]: REGISTER challenge/response on top of the registry
//! - [`DirectorySync`]: loading of preset extensions from configuration and
//!   generational reconciliation against an external store, driven by change
//!   notifications
//!
//! ## Architecture
//!
//! The SIP transport hands parsed requests to the `RequestHandler`, which
//! authenticates them against the `Registry`. Independently, `DirectorySync`
//! pulls rows from a [`DirectoryStore`], upserts them tagged with a pass
//! generation, and prunes whatever the pass did not touch.

pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod registry;
pub mod response;
pub mod sync;
pub mod types;

pub use config::{RegistrarConfig, ServerConfig, StaticExtension};
pub use error::{RegistrarError, Result};
pub use handler::{RequestHandler, SERVER_AGENT};
pub use registry::{REGISTRATION_LIFETIME_SECS, Registry};
pub use sync::{DirectoryStore, DirectorySync, ExtensionRow, MemoryStore, PgDirectoryStore};
pub use types::{Endpoint, ExtensionKind, ExtensionRecord};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
