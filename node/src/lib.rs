//! The node client runtime: identity, presence/registry, the dispatcher,
//! the topic and service layers built on pub/sub, the parameter store,
//! and lifecycle/timer utilities. This is the crate application code
//! links against.
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod node;
pub mod params;
pub mod presence;
pub mod pubsub;
pub mod registry;
pub mod service;
pub mod timer;
pub mod topic;

pub use codec::Value;
pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use node::{Node, NodeBuilder, TERMINATE_TOPIC};
pub use params::{ParamEntry, ParameterStore};
pub use presence::PresenceRecord;
pub use pubsub::Subscription;
pub use service::Handler;
