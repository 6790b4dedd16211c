//! The `Node` facade: the object application code constructs and links
//! against. Wires identity, the broker connection, presence/registry, the
//! topic and service layers, the parameter store, and lifecycle/signal
//! handling together following the startup sequence in spec §4.7.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use codec::Value;
use logger::Logger;
use redis_client::BrokerClient;

use crate::config::NodeConfig;
use crate::error::NodeResult;
use crate::identity::generate_name;
use crate::lifecycle::{self, Lifecycle};
use crate::params::ParameterStore;
use crate::presence::PresenceRecord;
use crate::pubsub::{Subscription, TopicLayer};
use crate::registry::Registry;
use crate::service::{Handler, ServiceLayer};
use crate::timer::LoopTimer;

/// Topic all nodes in a workspace listen on for remote termination
/// requests (spec §4.7, §6).
pub const TERMINATE_TOPIC: &str = "nv_terminate";

/// Crate version advertised in the presence record's `runtime_version`
/// field (spec §3).
const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct NodeBuilder {
    name: Option<String>,
    config: NodeConfig,
    skip_registration: bool,
    node_condition: Option<Box<dyn FnMut() -> bool + Send>>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        NodeBuilder {
            name: None,
            config: NodeConfig::from_env(),
            skip_registration: false,
            node_condition: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Skips presence registration/collision-detection entirely. Useful
    /// for short-lived commandline access, never for a normal node.
    pub fn skip_registration(mut self, skip: bool) -> Self {
        self.skip_registration = skip;
        self
    }

    /// Installs a precondition the node blocks on before connecting,
    /// polled every 10 s until it returns `true` (spec §4.7 step 2).
    pub fn node_condition(mut self, condition: impl FnMut() -> bool + Send + 'static) -> Self {
        self.node_condition = Some(Box::new(condition));
        self
    }

    pub fn build(self) -> NodeResult<Node> {
        Node::start(self)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        NodeBuilder::new()
    }
}

pub struct Node {
    name: String,
    logger: Logger,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<Registry>,
    topic: TopicLayer,
    service: Arc<ServiceLayer>,
    params: ParameterStore,
    timers: Mutex<Vec<LoopTimer>>,
    terminate_subscription: Mutex<Option<Subscription>>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// Constructs and registers a node named `name` using environment
    /// configuration, equivalent to `Node::builder().name(name).build()`.
    pub fn new(name: impl Into<String>) -> NodeResult<Node> {
        NodeBuilder::new().name(name).build()
    }

    fn start(builder: NodeBuilder) -> NodeResult<Node> {
        let NodeBuilder {
            name,
            config,
            skip_registration,
            node_condition,
        } = builder;

        let name = name.unwrap_or_else(generate_name);
        let logger = Logger::with_level(&format!("{name}.log"), config.log_level);
        logger.info(
            &format!("initialising node '{name}' on runtime nv {RUNTIME_VERSION}"),
            "node",
        );

        let lifecycle = Lifecycle::new();
        lifecycle.install_signal_handler(&logger)?;

        if let Some(mut condition) = node_condition {
            lifecycle::wait_for_node_condition(move || condition());
        }

        let broker = Arc::new(BrokerClient::connect(&config.broker, logger.clone())?);
        let registry = Arc::new(Registry::new(Arc::clone(&broker), &name, logger.clone(), RUNTIME_VERSION));

        if !skip_registration {
            registry.check_for_collision()?;
            registry.register()?;
            registry.start_heartbeat();
        } else {
            logger.warn("skipping node registration", "node");
        }

        let params = ParameterStore::new(Arc::clone(&broker), &name, logger.clone());
        if !config.keep_old_parameters {
            params.delete_all(None, None)?;
        }

        let topic = TopicLayer::new(
            Arc::clone(&broker),
            config.broker.clone(),
            logger.clone(),
            &name,
            config.workspace.clone(),
            Arc::clone(&registry),
        );

        let service = Arc::new(ServiceLayer::new(
            Arc::clone(&broker),
            config.broker.clone(),
            logger.clone(),
            Arc::clone(&registry),
        ));
        service.bind_reply_channel()?;

        let node = Node {
            name,
            logger,
            lifecycle,
            registry,
            topic,
            service,
            params,
            timers: Mutex::new(Vec::new()),
            terminate_subscription: Mutex::new(None),
        };

        if !skip_registration {
            let subscription = node.bind_remote_termination()?;
            *node
                .terminate_subscription
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(subscription);
        }

        Ok(node)
    }

    fn bind_remote_termination(&self) -> NodeResult<Subscription> {
        let own_name = self.name.clone();
        let lifecycle = Arc::clone(&self.lifecycle);
        let logger = self.logger.clone();
        self.topic.subscribe(TERMINATE_TOPIC, move |value: Value| {
            let Some(map) = value.as_map() else { return };
            if map.get("node").and_then(Value::as_str) == Some(own_name.as_str()) {
                let reason = map.get("reason").and_then(Value::as_str).unwrap_or("");
                logger.info(&format!("remote termination requested: {reason}"), "node");
                lifecycle.stop();
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    // --- topic layer ---

    pub fn publish(&self, topic: &str, value: &Value) -> NodeResult<i64> {
        self.topic.publish(topic, value)
    }

    pub fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> NodeResult<Subscription> {
        self.topic.subscribe(topic, callback)
    }

    pub fn unsubscribe(&self, topic: &str) -> NodeResult<()> {
        self.topic.unsubscribe(topic)
    }

    pub fn has_subscribers(&self, topic: &str) -> NodeResult<bool> {
        self.topic.has_subscribers(topic)
    }

    // --- service layer ---

    pub fn create_service(&self, name: &str, handler: Handler, allow_parallel: bool) -> NodeResult<()> {
        self.service.create_service(name, handler, allow_parallel)
    }

    pub fn call_service(&self, name: &str, args: Vec<Value>, kwargs: HashMap<String, Value>) -> NodeResult<Value> {
        self.service.call_service(name, args, kwargs)
    }

    pub fn call_service_with_timeout(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        timeout: Duration,
    ) -> NodeResult<Value> {
        self.service.call_service_with_timeout(name, args, kwargs, timeout)
    }

    pub fn wait_for_service_ready(&self, name: &str, timeout: Duration) -> NodeResult<()> {
        self.service.wait_for_service_ready(name, timeout)
    }

    // --- parameter store ---

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    // --- introspection (spec §4.8) ---

    pub fn list_nodes(&self) -> NodeResult<Vec<String>> {
        self.registry.list_nodes()
    }

    pub fn node_information(&self, name: &str) -> NodeResult<Option<PresenceRecord>> {
        self.registry.node_information(name)
    }

    pub fn node_exists(&self, name: &str) -> NodeResult<bool> {
        self.registry.node_exists(name)
    }

    pub fn list_topics(&self) -> NodeResult<HashMap<String, f64>> {
        self.registry.list_topics()
    }

    pub fn topic_subscribers(&self, topic: &str) -> NodeResult<Vec<String>> {
        self.registry.topic_subscribers(topic)
    }

    pub fn list_services(&self) -> NodeResult<HashMap<String, String>> {
        self.registry.list_services()
    }

    // --- lifecycle & timers ---

    /// Creates a periodic timer tied to this node's lifetime: it is
    /// stopped (and joined) when the node is dropped or `shutdown` runs.
    pub fn create_loop_timer(
        &self,
        interval: Duration,
        immediate: bool,
        function: impl FnMut() + Send + 'static,
    ) {
        let timer = LoopTimer::start(interval, immediate, function);
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).push(timer);
    }

    /// Blocks the calling thread while the node is active; returns once
    /// `shutdown()` runs or a termination signal/remote request arrives.
    pub fn spin(&self) {
        self.lifecycle.spin();
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle.is_stopped()
    }

    /// Graceful shutdown (spec §4.7): stops the heartbeat, deletes the
    /// presence record, signals `stopped`, and drops every node-owned
    /// timer. In-flight dispatcher callback workers are left to finish.
    pub fn shutdown(&self) {
        self.logger.debug("node termination requested", "node", "shutdown");
        self.registry.stop_heartbeat();
        if let Err(e) = self.registry.deregister() {
            self.logger.error(&format!("failed to deregister: {e}"), "node");
        }
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        if let Err(e) = self.service.shutdown() {
            self.logger
                .error(&format!("failed to unsubscribe service reply channels: {e}"), "node");
        }
        let subscription = self
            .terminate_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(subscription) = subscription {
            if let Err(e) = subscription.unsubscribe() {
                self.logger
                    .error(&format!("failed to unsubscribe from {TERMINATE_TOPIC}: {e}"), "node");
            }
        }
        self.lifecycle.stop();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_version_is_crate_version() {
        assert_eq!(RUNTIME_VERSION, env!("CARGO_PKG_VERSION"));
    }
}
