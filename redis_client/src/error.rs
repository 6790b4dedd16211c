//! Error type for the broker client adapter.
use std::num::ParseIntError;

#[derive(Debug, PartialEq, Clone)]
pub enum BrokerErrorKind {
    /// Connection could not be established or was lost mid-command.
    ConnectionError,
    /// A read's bounded wait elapsed with nothing to read; not fatal.
    Timeout,
    /// No candidate host responded to the autodetect liveness probe.
    HostNotFound,
    /// The broker returned a RESP error reply.
    ProtocolError,
    /// A reply did not have the shape the caller expected.
    UnexpectedReply,
    /// Catch-all for errors that don't fit the other kinds.
    OtherError,
}

#[derive(Debug, PartialEq, Clone)]
pub struct BrokerError {
    pub message: String,
    pub kind: BrokerErrorKind,
}

impl BrokerError {
    pub fn new(message: impl Into<String>, kind: BrokerErrorKind) -> Self {
        BrokerError {
            message: message.into(),
            kind,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        BrokerError::new(message, BrokerErrorKind::OtherError)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &BrokerErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BrokerError: {} - {:?}", self.message, self.kind)
    }
}

impl std::error::Error for BrokerError {}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                BrokerError::new(err.to_string(), BrokerErrorKind::Timeout)
            }
            _ => BrokerError::new(err.to_string(), BrokerErrorKind::ConnectionError),
        }
    }
}

impl From<ParseIntError> for BrokerError {
    fn from(err: ParseIntError) -> Self {
        BrokerError::new(err.to_string(), BrokerErrorKind::ProtocolError)
    }
}
