use std::fmt;

#[derive(Debug)]
pub enum Error {
    Http(reqwest::Error),
    Json(serde_json::Error),
    Io(std::io::Error),
    /// The cloud rejected the access token (HTTP 401).
    Unauthorized,
    /// No access token is available to authenticate with.
    NoCredentials,
    NotFound(String),
    Server(u16),
    Status { status: u16, message: Option<String> },
    Transport(String),
    Protocol(String),
    InvalidMode(String),
    UnknownMode(i64),
    Offline,
}

impl Error {
    /// Authentication failures trigger a credential refresh instead of a retry.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Unauthorized | Error::NoCredentials)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Json(e) => write!(f, "JSON error: {e}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
            Error::Unauthorized => write!(f, "unauthorized (access token rejected)"),
            Error::NoCredentials => write!(f, "no access token available"),
            Error::NotFound(what) => write!(f, "not found: {what}"),
            Error::Server(status) => write!(f, "server error (HTTP {status})"),
            Error::Status { status, message: Some(msg) } => write!(f, "HTTP {status}: {msg}"),
            Error::Status { status, message: None } => write!(f, "unexpected HTTP {status}"),
            Error::Transport(msg) => write!(f, "transport error: {msg}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::InvalidMode(msg) => write!(f, "invalid mode: {msg}"),
            Error::UnknownMode(code) => write!(f, "unknown mode code: {code}"),
            Error::Offline => write!(f, "device is offline"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
