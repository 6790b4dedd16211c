//! Publishes this node's presence record, renews it periodically, checks
//! for name collisions on startup, deregisters on shutdown, and answers
//! introspection queries over every node's record.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use codec::{decode, encode};
use logger::Logger;
use redis_client::{BrokerClient, Namespace};

use crate::error::{NodeError, NodeResult};
use crate::presence::{HEARTBEAT_PERIOD, PRESENCE_TTL, PresenceRecord};
use crate::topic::is_service_channel;

const COLLISION_GRACE: Duration = Duration::from_secs(10);
const COLLISION_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Registry {
    broker: Arc<BrokerClient>,
    node_name: String,
    logger: Logger,
    record: Mutex<PresenceRecord>,
    heartbeat_handle: Mutex<Option<thread::JoinHandle<()>>>,
    stop_heartbeat: Arc<std::sync::atomic::AtomicBool>,
}

impl Registry {
    pub fn new(broker: Arc<BrokerClient>, node_name: &str, logger: Logger, runtime_version: &str) -> Self {
        Registry {
            broker,
            node_name: node_name.to_string(),
            logger,
            record: Mutex::new(PresenceRecord::new(runtime_version)),
            heartbeat_handle: Mutex::new(None),
            stop_heartbeat: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Waits up to 10 s for a stale record under this name to expire,
    /// then fails with `DuplicateNodeName` if it's still there.
    pub fn check_for_collision(&self) -> NodeResult<()> {
        let deadline = Instant::now() + COLLISION_GRACE;
        loop {
            let exists = self.broker.exists(Namespace::Nodes, &self.node_name)?;
            if !exists {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NodeError::DuplicateNodeName(self.node_name.clone()));
            }
            thread::sleep(COLLISION_POLL_INTERVAL);
        }
    }

    /// Writes the current presence record with the standard TTL.
    pub fn publish_record(&self) -> NodeResult<()> {
        let record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        let bytes = encode(&record.to_value());
        self.broker
            .set(Namespace::Nodes, &self.node_name, &bytes, Some(PRESENCE_TTL))?;
        Ok(())
    }

    pub fn register(&self) -> NodeResult<()> {
        self.publish_record()
    }

    pub fn deregister(&self) -> NodeResult<()> {
        self.broker.delete(Namespace::Nodes, &self.node_name)?;
        Ok(())
    }

    pub fn with_record_mut(&self, f: impl FnOnce(&mut PresenceRecord)) -> NodeResult<()> {
        {
            let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut record);
            record.touch();
        }
        self.publish_record()
    }

    pub fn start_heartbeat(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let stop = Arc::clone(&self.stop_heartbeat);
        let handle = thread::spawn(move || {
            loop {
                if stop.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = registry.publish_record() {
                    registry
                        .logger
                        .error(&format!("heartbeat publish failed: {e}"), "registry");
                }
                thread::sleep(HEARTBEAT_PERIOD);
            }
        });
        *self.heartbeat_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn stop_heartbeat(&self) {
        self.stop_heartbeat
            .store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self
            .heartbeat_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
    }

    // --- introspection ---

    pub fn node_information(&self, name: &str) -> NodeResult<Option<PresenceRecord>> {
        match self.broker.get(Namespace::Nodes, name)? {
            Some(bytes) => {
                let value = decode(&bytes).map_err(NodeError::from)?;
                Ok(PresenceRecord::from_value(&value))
            }
            None => Ok(None),
        }
    }

    pub fn list_nodes(&self) -> NodeResult<Vec<String>> {
        let mut names = Vec::new();
        for key in self.broker.scan(Namespace::Nodes, "*") {
            names.push(key?);
        }
        Ok(names)
    }

    pub fn node_exists(&self, name: &str) -> NodeResult<bool> {
        self.broker.exists(Namespace::Nodes, name).map_err(NodeError::from)
    }

    pub fn list_topics(&self) -> NodeResult<HashMap<String, f64>> {
        let mut topics = HashMap::new();
        for name in self.list_nodes()? {
            if let Some(record) = self.node_information(&name)? {
                for (topic, ts) in record.publishers {
                    if !is_service_channel(&topic) {
                        let entry = topics.entry(topic).or_insert(ts);
                        if ts > *entry {
                            *entry = ts;
                        }
                    }
                }
            }
        }
        Ok(topics)
    }

    pub fn topic_subscribers(&self, topic: &str) -> NodeResult<Vec<String>> {
        let mut subscribers = Vec::new();
        for name in self.list_nodes()? {
            if let Some(record) = self.node_information(&name)? {
                if record.subscriptions.iter().any(|t| t == topic) {
                    subscribers.push(name);
                }
            }
        }
        Ok(subscribers)
    }

    /// First-registration-wins: iterates nodes in listing order and
    /// returns the first advertiser of `service`.
    pub fn list_services(&self) -> NodeResult<HashMap<String, String>> {
        let mut services = HashMap::new();
        for name in self.list_nodes()? {
            if let Some(record) = self.node_information(&name)? {
                for (service, channel) in record.services {
                    services.entry(service).or_insert(channel);
                }
            }
        }
        Ok(services)
    }

    pub fn find_service(&self, name: &str) -> NodeResult<Option<String>> {
        for node_name in self.list_nodes()? {
            if let Some(record) = self.node_information(&node_name)? {
                if let Some(channel) = record.services.get(name) {
                    return Ok(Some(channel.clone()));
                }
            }
        }
        Ok(None)
    }
}
