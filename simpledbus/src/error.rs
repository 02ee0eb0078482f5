use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::value::HostValue;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("IO error")]
    Io(io::ErrorKind),
    #[error("JSON Serialization Error")]
    SerdeJsonSer(serde_json::error::Category),
    #[error("JSON Deserialization Error of '{0}'")]
    SerdeJsonDe(String),
    #[error("Malformed signature '{signature}': {reason}")]
    MalformedSignature { signature: String, reason: String },
    #[error("Too few arguments: argument #{index} missing for signature '{signature}'")]
    Arity { index: usize, signature: String },
    #[error("{0}")]
    TypeMismatch(String),
    #[error("Adding type '{0}' is not implemented yet")]
    NotImplemented(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Connection closed")]
    Disconnected,
    #[error("{message}")]
    ErrorReply { name: String, message: String },
    #[error("Reply null")]
    NullReply,
    #[error("Unknown reply")]
    UnknownReply,
    #[error("Another main loop is already running")]
    LoopRunning,
    #[error("Main loop not running")]
    LoopNotRunning,
    #[error("At least 1 DBus connection required")]
    NoConnections,
    #[error("No connection with id {0}")]
    InvalidConnection(usize),
    #[error("Object path not registered: '{0}'")]
    ObjectPathNotRegistered(String),
    #[error("Pending call with serial {0} is not outstanding")]
    PendingCallNotOutstanding(u32),
    #[error("{0}")]
    InvalidReply(String),
    #[error("{0}")]
    Continuation(String),
}

impl From<&io::Error> for ErrorKind {
    fn from(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => ErrorKind::Disconnected,
            kind => ErrorKind::Io(kind),
        }
    }
}

impl From<&serde_json::Error> for ErrorKind {
    fn from(e: &serde_json::Error) -> Self {
        match e.classify() {
            serde_json::error::Category::Io => ErrorKind::Io(io::ErrorKind::Other),
            serde_json::error::Category::Data | serde_json::error::Category::Syntax => {
                ErrorKind::SerdeJsonDe(e.to_string())
            }
            category => ErrorKind::SerdeJsonSer(category),
        }
    }
}

/// The error type of this crate: an [`ErrorKind`], the error that caused it
/// (if any) and the source location it was raised at.
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    occurrence: Option<&'static str>,
}

impl Error {
    pub fn new(
        kind: ErrorKind,
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
        occurrence: Option<&'static str>,
    ) -> Self {
        Error {
            kind,
            source,
            occurrence,
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// `file:line` where the error was raised, when raised via [`context!`].
    pub fn occurrence(&self) -> Option<&'static str> {
        self.occurrence
    }

    /// The `(nil, message)` pair handed back across the host boundary.
    pub fn into_host_values(self) -> Vec<HostValue> {
        vec![HostValue::Nil, HostValue::Str(self.to_string())]
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(o) = self.occurrence {
            write!(f, "{}: ", o)?;
        }
        write!(f, "{:?}", self.kind)?;
        if let Some(ref e) = self.source {
            write!(f, "\nCaused by:\n{:?}", e)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind, None, None)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = ErrorKind::from(&e);
        Error::new(kind, Some(Box::from(e)), None)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        let kind = ErrorKind::from(&e);
        Error::new(kind, Some(Box::from(e)), None)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
