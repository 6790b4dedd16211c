//! Error taxonomy surfaced to callers of the node runtime.
use codec::CodecError;
use redis_client::BrokerError;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeError {
    /// Cannot reach the broker.
    BrokerUnavailable(String),
    /// A live presence record with the same name already existed past the
    /// collision grace window.
    DuplicateNodeName(String),
    /// Autodetect exhausted every candidate host.
    HostNotFound(String),
    /// Service name absent from every node's presence record.
    ServiceNotFound(String),
    /// No reply arrived within the call's deadline.
    ServiceTimeout(String),
    /// The remote handler raised; carries its stringified description.
    ServiceError(String),
    /// Parameter absent and strict mode was requested.
    ParameterNotFound(String),
    /// Reserved: the transform tree is out of scope for this core.
    TransformExists(String),
    /// Reserved: the transform tree is out of scope for this core.
    TransformAliasInvalid(String),
    /// Catch-all for errors that don't fit the taxonomy above.
    Other(String),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::BrokerUnavailable(m) => write!(f, "BROKER_UNAVAILABLE: {m}"),
            NodeError::DuplicateNodeName(m) => write!(f, "DUPLICATE_NODE_NAME: {m}"),
            NodeError::HostNotFound(m) => write!(f, "HOST_NOT_FOUND: {m}"),
            NodeError::ServiceNotFound(m) => write!(f, "SERVICE_NOT_FOUND: {m}"),
            NodeError::ServiceTimeout(m) => write!(f, "SERVICE_TIMEOUT: {m}"),
            NodeError::ServiceError(m) => write!(f, "SERVICE_ERROR: {m}"),
            NodeError::ParameterNotFound(m) => write!(f, "PARAMETER_NOT_FOUND: {m}"),
            NodeError::TransformExists(m) => write!(f, "TRANSFORM_EXISTS: {m}"),
            NodeError::TransformAliasInvalid(m) => write!(f, "TRANSFORM_ALIAS_INVALID: {m}"),
            NodeError::Other(m) => write!(f, "NodeError: {m}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<BrokerError> for NodeError {
    fn from(err: BrokerError) -> Self {
        use redis_client::BrokerErrorKind;
        match err.kind {
            BrokerErrorKind::HostNotFound => NodeError::HostNotFound(err.message),
            BrokerErrorKind::ConnectionError => NodeError::BrokerUnavailable(err.message),
            _ => NodeError::Other(err.message),
        }
    }
}

impl From<CodecError> for NodeError {
    fn from(err: CodecError) -> Self {
        NodeError::Other(err.to_string())
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
