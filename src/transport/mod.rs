//! JSON-over-socket control surface: listeners, client sessions and the
//! record framing shared with irccdctl.

pub mod frame;
pub mod server;

use std::path::PathBuf;

use thiserror::Error;

pub type TransportResult<T> = core::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to load TLS material: {0}")]
    Tls(String),

    #[error("SSL support is disabled")]
    SslDisabled,
}

/// TLS material for an encrypted TCP listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// One configured listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    Unix {
        path: PathBuf,
        password: Option<String>,
    },
    Tcp {
        address: String,
        port: u16,
        password: Option<String>,
        tls: Option<TlsPaths>,
    },
}

impl TransportSpec {
    pub fn password(&self) -> Option<&str> {
        match self {
            TransportSpec::Unix { password, .. } | TransportSpec::Tcp { password, .. } => {
                password.as_deref()
            }
        }
    }
}
