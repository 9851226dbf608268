use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the reactor, the TLS layer and the role frontends.
///
/// I/O errors on individual channels are handled internally (the channel is
/// closed); this type covers startup and configuration failures plus the
/// fatal reactor conditions.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Tls(rustls::Error),
    InvalidServerName(String),
    Certificate(String),
    Configuration(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO Error: {}", e),
            Error::Tls(e) => write!(f, "TLS Error: {}", e),
            Error::InvalidServerName(name) => write!(f, "Invalid TLS server name: {}", name),
            Error::Certificate(msg) => write!(f, "Certificate Error: {}", msg),
            Error::Configuration(msg) => write!(f, "Configuration Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err)
    }
}
