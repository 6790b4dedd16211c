//! Request/reply built on top of pub/sub. Each server owns one reply
//! channel per node; each call is tagged with a request id correlated to
//! a pending completion slot. Large byte results go through a KV
//! side-channel instead of being embedded inline.
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use codec::{Value, encode};
use logger::Logger;
use redis_client::{BrokerClient, BrokerConfig, Namespace};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::{NodeError, NodeResult};
use crate::registry::Registry;
use crate::topic::SERVICE_PREFIX;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICE_READY_POLL: Duration = Duration::from_millis(100);
const SIDE_CHANNEL_TTL: Duration = Duration::from_secs(60);
const SIDE_CHANNEL_PREFIX: &str = "NV_BYTES:";

pub type Handler = Arc<dyn Fn(Vec<Value>, HashMap<String, Value>) -> Result<Value, String> + Send + Sync>;

enum ReplyMessage {
    Success(Value),
    Error(String),
}

struct ServiceBinding {
    reply_channel_id: String,
    #[allow(dead_code)]
    serialize: Option<Arc<Mutex<()>>>,
}

pub struct ServiceLayer {
    broker: Arc<BrokerClient>,
    broker_config: BrokerConfig,
    logger: Logger,
    reply_channel: String,
    pending: Arc<Mutex<HashMap<String, mpsc::Sender<ReplyMessage>>>>,
    bindings: Mutex<HashMap<String, ServiceBinding>>,
    registry: Arc<Registry>,
}

impl ServiceLayer {
    pub fn new(broker: Arc<BrokerClient>, broker_config: BrokerConfig, logger: Logger, registry: Arc<Registry>) -> Self {
        ServiceLayer {
            broker,
            broker_config,
            logger,
            reply_channel: format!("{SERVICE_PREFIX}{}", Uuid::new_v4()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            bindings: Mutex::new(HashMap::new()),
            registry,
        }
    }

    pub fn reply_channel(&self) -> &str {
        &self.reply_channel
    }

    /// Binds the node's one shared reply channel. Called once during
    /// lifecycle startup; never re-created afterward.
    pub fn bind_reply_channel(self: &Arc<Self>) -> NodeResult<()> {
        let pending = Arc::clone(&self.pending);
        let dispatcher = Dispatcher::global();
        dispatcher.subscribe(
            Arc::clone(&self.broker),
            self.broker_config.clone(),
            self.logger.clone(),
            &self.reply_channel,
            Arc::new(move |value: Value| {
                handle_reply_frame(&pending, value);
            }),
        )?;
        Ok(())
    }

    /// Registers a service handler. Subscribes a fresh reply channel and
    /// immediately republishes the presence record so callers can find it
    /// without waiting for the next heartbeat.
    pub fn create_service(
        self: &Arc<Self>,
        name: &str,
        handler: Handler,
        allow_parallel: bool,
    ) -> NodeResult<()> {
        let reply_channel_id = format!("{SERVICE_PREFIX}{}", Uuid::new_v4());
        let serialize = if allow_parallel {
            None
        } else {
            Some(Arc::new(Mutex::new(())))
        };

        let broker = Arc::clone(&self.broker);
        let logger = self.logger.clone();
        let serialize_for_handler = serialize.clone();
        let reply_for_handler = reply_channel_id.clone();

        let dispatcher = Dispatcher::global();
        dispatcher.subscribe(
            Arc::clone(&self.broker),
            self.broker_config.clone(),
            self.logger.clone(),
            &reply_channel_id,
            Arc::new(move |value: Value| {
                serve_request(
                    &broker,
                    &logger,
                    &reply_for_handler,
                    &handler,
                    serialize_for_handler.as_ref(),
                    value,
                );
            }),
        )?;

        self.bindings.lock().unwrap_or_else(|e| e.into_inner()).insert(
            name.to_string(),
            ServiceBinding {
                reply_channel_id: reply_channel_id.clone(),
                serialize,
            },
        );

        self.registry.with_record_mut(|record| {
            record.services.insert(name.to_string(), reply_channel_id.clone());
        })?;

        Ok(())
    }

    /// Every reply channel this node has bound as a server, used to unwind
    /// subscriptions on shutdown.
    pub fn bound_reply_channels(&self) -> Vec<String> {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|b| b.reply_channel_id.clone())
            .collect()
    }

    /// Unsubscribes the node's shared reply channel and every per-service
    /// reply channel bound by [`create_service`](Self::create_service).
    /// Called once during node teardown.
    pub fn shutdown(&self) -> NodeResult<()> {
        let dispatcher = Dispatcher::global();
        dispatcher.unsubscribe_all(&self.reply_channel)?;
        for channel in self.bound_reply_channels() {
            dispatcher.unsubscribe_all(&channel)?;
        }
        self.bindings.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    /// Resolves `name` to a reply channel (first advertiser wins), sends
    /// the request, and waits for a correlated reply.
    pub fn call_service(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> NodeResult<Value> {
        self.call_service_with_timeout(name, args, kwargs, DEFAULT_CALL_TIMEOUT)
    }

    pub fn call_service_with_timeout(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        timeout: Duration,
    ) -> NodeResult<Value> {
        let target_channel = self
            .registry
            .find_service(name)?
            .ok_or_else(|| NodeError::ServiceNotFound(name.to_string()))?;

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.clone(), tx);

        let mut request = HashMap::new();
        let mut timings = HashMap::new();
        timings.insert("start".to_string(), Value::Float(crate::presence::now_epoch_secs()));
        request.insert("timings".to_string(), Value::Map(timings));
        request.insert("response_topic".to_string(), Value::Str(self.reply_channel.clone()));
        request.insert("request_id".to_string(), Value::Str(request_id.clone()));
        request.insert("args".to_string(), Value::Seq(args));
        request.insert("kwargs".to_string(), Value::Map(kwargs));

        let payload = encode(&Value::Map(request));
        if let Err(e) = self.broker.publish(&target_channel, &payload) {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&request_id);
            return Err(e.into());
        }

        let result = rx.recv_timeout(timeout);
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&request_id);

        match result {
            Ok(ReplyMessage::Success(data)) => self.resolve_side_channel(data),
            Ok(ReplyMessage::Error(message)) => Err(NodeError::ServiceError(message)),
            Err(_) => Err(NodeError::ServiceTimeout(name.to_string())),
        }
    }

    fn resolve_side_channel(&self, data: Value) -> NodeResult<Value> {
        if let Value::Str(s) = &data {
            if let Some(key) = s.strip_prefix(SIDE_CHANNEL_PREFIX) {
                let bytes = self
                    .broker
                    .get(Namespace::Topics, &format!("{SIDE_CHANNEL_PREFIX}{key}"))?
                    .unwrap_or_default();
                return Ok(Value::Bytes(bytes));
            }
        }
        Ok(data)
    }

    /// Polls the services map at ~100 ms intervals until `name` is
    /// visible or `timeout` elapses.
    pub fn wait_for_service_ready(&self, name: &str, timeout: Duration) -> NodeResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.registry.find_service(name)?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NodeError::ServiceNotFound(name.to_string()));
            }
            std::thread::sleep(SERVICE_READY_POLL);
        }
    }
}

fn handle_reply_frame(pending: &Arc<Mutex<HashMap<String, mpsc::Sender<ReplyMessage>>>>, value: Value) {
    let Some(map) = value.as_map() else { return };
    let Some(request_id) = map.get("request_id").and_then(Value::as_str) else {
        return;
    };

    let sender = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(request_id)
        .cloned();
    let Some(sender) = sender else { return };

    let result = map.get("result").and_then(Value::as_str).unwrap_or("error");
    let data = map.get("data").cloned().unwrap_or(Value::Null);
    let message = match result {
        "success" => ReplyMessage::Success(data),
        _ => ReplyMessage::Error(
            data.as_str()
                .map(str::to_string)
                .unwrap_or_else(|| "remote handler failed".to_string()),
        ),
    };
    let _ = sender.send(message);
}

fn serve_request(
    broker: &Arc<BrokerClient>,
    logger: &Logger,
    reply_channel_id: &str,
    handler: &Handler,
    serialize: Option<&Arc<Mutex<()>>>,
    value: Value,
) {
    let Some(map) = value.as_map() else { return };
    let Some(response_topic) = map.get("response_topic").and_then(Value::as_str) else {
        return;
    };
    let request_id = map
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let args = map
        .get("args")
        .and_then(Value::as_seq)
        .map(|s| s.to_vec())
        .unwrap_or_default();
    let kwargs = map.get("kwargs").and_then(Value::as_map).cloned().unwrap_or_default();
    let start = map
        .get("timings")
        .and_then(Value::as_map)
        .and_then(|t| t.get("start"))
        .cloned()
        .unwrap_or(Value::Float(crate::presence::now_epoch_secs()));

    let response_topic = response_topic.to_string();
    let request_received = crate::presence::now_epoch_secs();
    let outcome = match serialize {
        Some(lock) => {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            handler(args, kwargs)
        }
        None => handler(args, kwargs),
    };

    let mut timings = HashMap::new();
    timings.insert("start".to_string(), start);
    timings.insert("request_received".to_string(), Value::Float(request_received));
    timings.insert(
        "request_completed".to_string(),
        Value::Float(crate::presence::now_epoch_secs()),
    );

    let mut reply = HashMap::new();
    reply.insert("request_id".to_string(), Value::Str(request_id));
    reply.insert("timings".to_string(), Value::Map(timings));

    match outcome {
        Ok(Value::Bytes(bytes)) => {
            let key_suffix = Uuid::new_v4().to_string();
            let key = format!("{SIDE_CHANNEL_PREFIX}{key_suffix}");
            if let Err(e) = broker.set(Namespace::Topics, &key, &bytes, Some(SIDE_CHANNEL_TTL)) {
                logger.error(&format!("failed to stash side-channel bytes: {e}"), "service_layer");
            }
            reply.insert("result".to_string(), Value::Str("success".to_string()));
            reply.insert("data".to_string(), Value::Str(key));
        }
        Ok(data) => {
            reply.insert("result".to_string(), Value::Str("success".to_string()));
            reply.insert("data".to_string(), data);
        }
        Err(message) => {
            reply.insert("result".to_string(), Value::Str("error".to_string()));
            reply.insert("data".to_string(), Value::Str(message));
        }
    }

    let payload = encode(&Value::Map(reply));
    if let Err(e) = broker.publish(&response_topic, &payload) {
        logger.error(&format!("failed to publish service reply: {e}"), "service_layer");
    }
}

// request/reply payload round trip is exercised in node::tests (service
// scenarios in the crate's integration module) since it needs a full
// Dispatcher + Registry wiring; this module's own tests cover the
// side-channel sentinel convention in isolation.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_channel_key_has_expected_prefix() {
        let key = format!("{SIDE_CHANNEL_PREFIX}{}", Uuid::new_v4());
        assert!(key.starts_with("NV_BYTES:"));
    }
}
