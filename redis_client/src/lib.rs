pub mod client;
pub mod driver;
pub mod error;
pub mod resp;

pub use client::{BrokerClient, BrokerConfig, Namespace, Pipeline, ScanIter, Subscriber};
pub use error::{BrokerError, BrokerErrorKind};
pub use resp::RespValue;

pub type BrokerResult<T> = Result<T, BrokerError>;
