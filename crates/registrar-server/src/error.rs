use sipreg_registrar_core::RegistrarError;
use thiserror::Error;

/// Daemon errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("SIP message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error(transparent)]
    Registrar(#[from] RegistrarError),
}

impl ServerError {
    /// Errors that must terminate the process
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Registrar(e) => e.is_fatal(),
            ServerError::Transport(_) | ServerError::Logging(_) => true,
            ServerError::MessageTooLarge(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
