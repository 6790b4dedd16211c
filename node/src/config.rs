//! Environment-driven configuration, read once at `Node` construction.
use std::env;

use logger::LogLevel;
use redis_client::BrokerConfig;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub workspace: Option<String>,
    pub broker: BrokerConfig,
    pub log_level: LogLevel,
    pub keep_old_parameters: bool,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let workspace = env::var("NV_WORKSPACE").ok().filter(|s| !s.is_empty());

        let unix_socket = env::var("NV_REDIS_UNIX_SOCKET")
            .ok()
            .filter(|s| !s.is_empty());
        let host = env::var("NV_REDIS_HOST").ok().filter(|s| !s.is_empty());
        let port = env::var("NV_REDIS_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(6379);

        NodeConfig {
            workspace,
            broker: BrokerConfig {
                unix_socket,
                host,
                port,
            },
            log_level: LogLevel::from_env(),
            keep_old_parameters: true,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig::from_env()
    }
}
