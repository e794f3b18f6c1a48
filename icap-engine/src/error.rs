use std::io;
use thiserror::Error;

/// Error type shared by the parser, sessions, services and listeners.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket level failure (reset, broken pipe, EOF in the middle of a read).
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// The ICAP request line or header block could not be understood.
    #[error("ICAP parsing error: {0}")]
    Parse(String),

    /// A header value is malformed (Encapsulated, Preview, Content-Length, ...).
    #[error("Header error: {0}")]
    Header(String),

    /// A chunk-size line is missing or is not hexadecimal.
    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    /// The encapsulated body is truncated or otherwise inconsistent.
    #[error("Body error: {0}")]
    Body(String),

    /// gzip/deflate encoding or decoding failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Raised by an adaptation service.
    #[error("Service error: {0}")]
    Service(String),

    /// Invalid listener or server configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A listener could not bind its socket.
    #[error("Unable to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub fn header(message: impl Into<String>) -> Self {
        Self::Header(message.into())
    }

    pub fn malformed_chunk(message: impl Into<String>) -> Self {
        Self::MalformedChunk(message.into())
    }

    pub fn body(message: impl Into<String>) -> Self {
        Self::Body(message.into())
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::Service(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// `true` when the peer simply went away.
    ///
    /// Such failures are part of normal ICAP client behaviour (clients drop
    /// persistent connections at will) and are logged at `debug` only.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Network(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// `true` when a read gave up waiting for the client.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Network(e) if e.kind() == io::ErrorKind::TimedOut)
    }

    /// `true` when the failure is a protocol violation by the client that can
    /// still be answered with `400 Bad Request`.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::Parse(_) | Error::Header(_) | Error::MalformedChunk(_)
        )
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::Service(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Self::Service(err.to_string())
    }
}

/// Result alias used across the crate.
pub type IcapResult<T> = Result<T, Error>;

/// Builds an [`Error::Parse`] from format arguments.
#[macro_export]
macro_rules! icap_parse_error {
    ($($arg:tt)*) => {
        $crate::error::Error::parse(format!($($arg)*))
    };
}

/// Builds an [`Error::Header`] from format arguments.
#[macro_export]
macro_rules! icap_header_error {
    ($($arg:tt)*) => {
        $crate::error::Error::header(format!($($arg)*))
    };
}

/// Builds an [`Error::Configuration`] from format arguments.
#[macro_export]
macro_rules! icap_config_error {
    ($($arg:tt)*) => {
        $crate::error::Error::configuration(format!($($arg)*))
    };
}
