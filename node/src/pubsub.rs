//! Topic layer: publish/subscribe built directly on the broker adapter and
//! the dispatcher, recording traffic into the node's own presence record.
use std::sync::Arc;

use codec::{Value, encode};
use logger::Logger;
use redis_client::{BrokerClient, BrokerConfig};

use crate::dispatcher::{Callback, Dispatcher};
use crate::error::NodeResult;
use crate::presence::now_epoch_secs;
use crate::registry::Registry;
use crate::topic::resolve;

pub struct TopicLayer {
    broker: Arc<BrokerClient>,
    broker_config: BrokerConfig,
    logger: Logger,
    node_name: String,
    workspace: Option<String>,
    registry: Arc<Registry>,
}

impl TopicLayer {
    pub fn new(
        broker: Arc<BrokerClient>,
        broker_config: BrokerConfig,
        logger: Logger,
        node_name: &str,
        workspace: Option<String>,
        registry: Arc<Registry>,
    ) -> Self {
        TopicLayer {
            broker,
            broker_config,
            logger,
            node_name: node_name.to_string(),
            workspace,
            registry,
        }
    }

    fn resolve(&self, name: &str) -> String {
        resolve(name, &self.node_name, self.workspace.as_deref())
    }

    /// Records the publish time, encodes `value`, and returns the
    /// broker's subscriber count for the resolved channel.
    pub fn publish(&self, name: &str, value: &Value) -> NodeResult<i64> {
        let channel = self.resolve(name);
        self.registry.with_record_mut(|record| {
            record.publishers.insert(channel.clone(), now_epoch_secs());
        })?;
        let payload = encode(value);
        let count = self.broker.publish(&channel, &payload)?;
        Ok(count)
    }

    /// Adds `callback` to the dispatcher's map for the resolved channel,
    /// issuing broker SUBSCRIBE if it's the channel's first callback.
    pub fn subscribe(
        &self,
        name: &str,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> NodeResult<Subscription> {
        self.subscribe_dyn(name, Arc::new(callback))
    }

    fn subscribe_dyn(&self, name: &str, callback: Callback) -> NodeResult<Subscription> {
        let channel = self.resolve(name);
        self.registry.with_record_mut(|record| {
            if !record.subscriptions.iter().any(|s| s == &channel) {
                record.subscriptions.push(channel.clone());
            }
        })?;

        let id = Dispatcher::global().subscribe(
            Arc::clone(&self.broker),
            self.broker_config.clone(),
            self.logger.clone(),
            &channel,
            callback,
        )?;

        Ok(Subscription { channel, id })
    }

    /// Removes every callback registered for `name` and issues broker
    /// UNSUBSCRIBE.
    pub fn unsubscribe(&self, name: &str) -> NodeResult<()> {
        let channel = self.resolve(name);
        Dispatcher::global().unsubscribe_all(&channel)?;
        self.registry.with_record_mut(|record| {
            record.subscriptions.retain(|s| s != &channel);
        })?;
        Ok(())
    }

    /// True if NUMSUB reports at least one listener on the resolved
    /// channel, including listeners this runtime never registered (e.g. a
    /// CLI watching the same topic).
    pub fn has_subscribers(&self, name: &str) -> NodeResult<bool> {
        let channel = self.resolve(name);
        Ok(self.broker.numsub(&channel)? > 0)
    }
}

/// A handle returned by [`TopicLayer::subscribe`]; drop it or call
/// `unsubscribe` to remove just this one callback.
pub struct Subscription {
    channel: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) -> NodeResult<()> {
        Dispatcher::global().unsubscribe_one(&self.channel, self.id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_exposes_no_public_fields_beyond_construction() {
        // Subscription is an opaque handle; this guards against someone
        // reaching in to mutate `id`/`channel` instead of going through
        // unsubscribe().
        let sub = Subscription {
            channel: "lab.telemetry".to_string(),
            id: 7,
        };
        assert_eq!(sub.channel, "lab.telemetry");
    }
}
