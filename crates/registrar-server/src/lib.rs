//! # sipreg server
//!
//! The registrar daemon: a UDP and TCP REGISTER service in front of the extension
//! directory from `sipreg-registrar-core`, with logging setup and process
//! lifecycle (startup, reload, shutdown).

pub mod error;
pub mod logging;
pub mod server;
pub mod transport;

pub use error::{Result, ServerError};
pub use server::{RegistrarServer, SWEEP_INTERVAL};
pub use transport::{TcpTransport, UdpTransport};
