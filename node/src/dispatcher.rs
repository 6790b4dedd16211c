//! Process-wide singleton dispatcher: owns the single subscription
//! channel to the broker, demultiplexes incoming frames to per-topic
//! callback lists, and runs each callback on its own worker so a blocking
//! callback cannot stall delivery to other topics.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use codec::{Value, decode_lenient};
use common::thread_pool::ThreadPool;
use logger::Logger;
use redis_client::{BrokerClient, BrokerConfig, Subscriber as BrokerSubscriber};

/// Default worker pool size. Generous, bounded, rather than an unbounded
/// `thread::spawn` per frame.
const DEFAULT_POOL_SIZE: usize = 256;

/// The receive loop's bounded poll wait; a trade-off between idle CPU use
/// and shutdown latency.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

pub type Callback = Arc<dyn Fn(Value) + Send + Sync>;

struct ChannelEntry {
    callbacks: Vec<(u64, Callback)>,
}

pub struct Dispatcher {
    channels: Mutex<HashMap<String, ChannelEntry>>,
    subscriber: Mutex<Option<BrokerSubscriber>>,
    pool: ThreadPool,
    next_id: AtomicU64,
    loop_started: AtomicBool,
    stop_flag: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn global() -> &'static Dispatcher {
        static DISPATCHER: OnceLock<Dispatcher> = OnceLock::new();
        DISPATCHER.get_or_init(|| Dispatcher {
            channels: Mutex::new(HashMap::new()),
            subscriber: Mutex::new(None),
            pool: ThreadPool::new(DEFAULT_POOL_SIZE),
            next_id: AtomicU64::new(1),
            loop_started: AtomicBool::new(false),
            stop_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Lazily starts the receive loop on first subscription. Safe to call
    /// repeatedly; only the first call in the process has any effect.
    fn ensure_started(
        &'static self,
        client: Arc<BrokerClient>,
        config: BrokerConfig,
        logger: Logger,
    ) -> Result<(), redis_client::BrokerError> {
        if self.loop_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let sub = client.open_subscriber(&config)?;
        *self.subscriber.lock().unwrap_or_else(|e| e.into_inner()) = Some(sub);

        thread::spawn(move || {
            loop {
                if self.stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                let frame = {
                    let mut guard = self.subscriber.lock().unwrap_or_else(|e| e.into_inner());
                    match guard.as_mut() {
                        Some(sub) => sub.recv_timeout(RECEIVE_TIMEOUT),
                        None => break,
                    }
                };
                match frame {
                    Ok(Some((channel, payload))) => self.dispatch(&channel, payload),
                    Ok(None) => continue,
                    Err(e) => {
                        logger.error(
                            &format!("dispatcher receive loop error: {e}"),
                            "dispatcher",
                        );
                    }
                }
            }
        });

        Ok(())
    }

    /// Registers `callback` for `channel`, starting the receive loop and
    /// issuing broker SUBSCRIBE if this is the channel's first callback.
    /// Returns a subscription id used to remove just this one callback.
    pub fn subscribe(
        &'static self,
        client: Arc<BrokerClient>,
        config: BrokerConfig,
        logger: Logger,
        channel: &str,
        callback: Callback,
    ) -> Result<u64, redis_client::BrokerError> {
        self.ensure_started(client, config, logger)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let is_new = !channels.contains_key(channel);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelEntry { callbacks: Vec::new() })
            .callbacks
            .push((id, callback));
        drop(channels);

        if is_new {
            let mut guard = self.subscriber.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(sub) = guard.as_mut() {
                sub.subscribe(channel)?;
            }
        }

        Ok(id)
    }

    /// Removes exactly one (channel, callback) pair.
    pub fn unsubscribe_one(&'static self, channel: &str, id: u64) -> Result<(), redis_client::BrokerError> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let now_empty = if let Some(entry) = channels.get_mut(channel) {
            entry.callbacks.retain(|(cid, _)| *cid != id);
            entry.callbacks.is_empty()
        } else {
            false
        };
        if now_empty {
            channels.remove(channel);
        }
        drop(channels);

        if now_empty {
            let mut guard = self.subscriber.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(sub) = guard.as_mut() {
                sub.unsubscribe(channel)?;
            }
        }
        Ok(())
    }

    /// Removes every callback for `channel` and issues broker UNSUBSCRIBE.
    pub fn unsubscribe_all(&'static self, channel: &str) -> Result<(), redis_client::BrokerError> {
        let had_entry = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel)
            .is_some();
        if had_entry {
            let mut guard = self.subscriber.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(sub) = guard.as_mut() {
                sub.unsubscribe(channel)?;
            }
        }
        Ok(())
    }

    fn dispatch(&self, channel: &str, payload: Vec<u8>) {
        let callbacks: Vec<Callback> = {
            let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            match channels.get(channel) {
                Some(entry) => entry.callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };

        let value = decode_lenient(&payload);
        for callback in callbacks {
            let value = value.clone();
            // a callback that itself blocks (e.g. issues a service call)
            // must not be able to stall the receive loop or other topics
            let _ = self.pool.execute(move || callback(value));
        }
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}
