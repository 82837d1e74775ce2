//! In-process broker with AMQP 0-9-1 queueing semantics.
//!
//! All state sits behind one lock. Deliveries are pushed into unbounded per-consumer
//! channels while the lock is held, so dispatch never awaits.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    BrokerError, Channel, Confirmation, Connection, Connector, Consumer, Delivery, ExchangeKind,
    FieldValue, MAX_LENGTH_ARG, OVERFLOW_ARG, Properties, PublisherConfirm, QueueInfo,
    QueueOptions, REJECT_PUBLISH,
};
use crate::id::Id;

#[cfg(test)]
#[path = "memory.test.rs"]
mod tests;

/// Handle to a shared in-process broker. Clones observe the same exchanges and queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_connection(&self) -> Arc<MemoryConnection> {
        let id = Id::new();
        self.state
            .lock()
            .connections
            .insert(id, ConnectionState { close_reason: None });
        tracing::debug!(connection = %id, "Opened memory connection");
        Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
        })
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Names of every declared queue, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    /// Ready (undelivered) messages in a queue.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.messages.len())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        Ok(self.open_connection())
    }
}

pub struct MemoryConnection {
    id: Id,
    state: Arc<Mutex<State>>,
}

impl MemoryConnection {
    pub fn id(&self) -> Id {
        self.id
    }

    /// Drops the connection as a broker or network failure would.
    pub fn sever(&self, reason: impl Into<String>) {
        self.state.lock().close_connection(self.id, reason.into());
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.close_reason().is_none()
    }

    fn close_reason(&self) -> Option<String> {
        self.state.lock().connection_closed(self.id)
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.connection_closed(self.id) {
            return Err(BrokerError::ConnectionClosed(reason));
        }
        let id = Id::new();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                next_tag: 0,
                prefetch: 0,
                confirms: false,
                unacked: HashMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state
            .lock()
            .close_connection(self.id, "closed by application".to_string());
        Ok(())
    }
}

pub struct MemoryChannel {
    id: Id,
    connection: Id,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.close_reason().is_none()
    }

    fn close_reason(&self) -> Option<String> {
        let state = self.state.lock();
        if let Some(reason) = state.connection_closed(self.connection) {
            return Some(reason);
        }
        if !state.channels.contains_key(&self.id) {
            return Some("channel closed".to_string());
        }
        None
    }

    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.channel_mut(self.id, self.connection)?;
        state.declare_exchange(exchange, kind)
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<QueueInfo, BrokerError> {
        let mut state = self.state.lock();
        state.channel_mut(self.id, self.connection)?;
        state.declare_queue(self.connection, queue, options)
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        let mut state = self.state.lock();
        state.channel_mut(self.id, self.connection)?;
        let found = state.queue(queue)?;
        found.check_access(self.connection)?;
        Ok(found.info())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.channel_mut(self.id, self.connection)?;
        state.bind(self.connection, queue, exchange, routing_key)
    }

    async fn queue_delete(&self, queue: &str) -> Result<u32, BrokerError> {
        let mut state = self.state.lock();
        state.channel_mut(self.id, self.connection)?;
        state.queue(queue)?.check_access(self.connection)?;
        Ok(state.remove_queue(queue))
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.channel_mut(self.id, self.connection)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.channel_mut(self.id, self.connection)?.confirms = true;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: Properties,
        body: Bytes,
    ) -> Result<PublisherConfirm, BrokerError> {
        let mut state = self.state.lock();
        let confirms = state.channel_mut(self.id, self.connection)?.confirms;
        let outcome = state.publish(exchange, routing_key, mandatory, properties, body)?;
        Ok(PublisherConfirm::settled(if confirms {
            outcome
        } else {
            Confirmation::NotRequested
        }))
    }

    async fn basic_consume(&self, queue: &str, auto_ack: bool) -> Result<Consumer, BrokerError> {
        let mut state = self.state.lock();
        let prefetch = state.channel_mut(self.id, self.connection)?.prefetch;
        state.queue(queue)?.check_access(self.connection)?;

        let tag = format!("ctag-{}", Id::new().simple());
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(found) = state.queues.get_mut(queue) {
            found.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                channel: self.id,
                auto_ack,
                prefetch,
                in_flight: 0,
                tx,
            });
        }
        state.dispatch(queue);
        Ok(Consumer::new(tag, rx))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let unacked = state
            .channel_mut(self.id, self.connection)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| {
                BrokerError::PreconditionFailed(format!("unknown delivery tag {delivery_tag}"))
            })?;
        if let Some(queue) = state.queues.get_mut(&unacked.queue) {
            if let Some(slot) = queue
                .consumers
                .iter_mut()
                .find(|slot| slot.tag == unacked.consumer)
            {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
        }
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.channel_mut(self.id, self.connection)?;
        let channel = self.id;
        state.detach_consumers(|slot| slot.channel == channel && slot.tag == consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().close_channel(self.id);
        Ok(())
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: HashMap<Id, ConnectionState>,
    channels: HashMap<Id, ChannelState>,
}

struct ConnectionState {
    close_reason: Option<String>,
}

struct ChannelState {
    connection: Id,
    next_tag: u64,
    prefetch: u16,
    confirms: bool,
    unacked: HashMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    consumer: String,
    message: Message,
}

struct Exchange {
    kind: ExchangeKind,
    /// (queue, routing key)
    bindings: Vec<(String, String)>,
}

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: Properties,
    body: Bytes,
    expires_at: Option<Instant>,
    redelivered: bool,
}

impl Message {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct ConsumerSlot {
    tag: String,
    channel: Id,
    auto_ack: bool,
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < self.prefetch as usize
    }
}

struct Queue {
    name: String,
    options: QueueOptions,
    owner: Option<Id>,
    max_length: Option<usize>,
    reject_publish: bool,
    messages: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl Queue {
    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.name.clone(),
            message_count: self.messages.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    fn check_access(&self, connection: Id) -> Result<(), BrokerError> {
        match self.owner {
            Some(owner) if owner != connection => Err(BrokerError::ResourceLocked(format!(
                "queue '{}' is exclusive to another connection",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    /// Stores a message, returning false when a full bounded queue rejects it.
    fn offer(&mut self, message: Message) -> bool {
        if let Some(max_length) = self.max_length {
            let now = Instant::now();
            self.messages.retain(|message| !message.is_expired(now));
            if self.messages.len() >= max_length {
                if self.reject_publish {
                    return false;
                }
                // drop-head
                if self.messages.pop_front().is_none() {
                    return true;
                }
            }
        }
        self.messages.push_back(message);
        true
    }

    fn next_ready_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            if self.consumers[index].has_capacity() {
                self.cursor = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }
}

fn parse_bounds(options: &QueueOptions) -> Result<(Option<usize>, bool), BrokerError> {
    let max_length = match options.arguments.get(MAX_LENGTH_ARG) {
        None => None,
        Some(FieldValue::Long(limit)) if *limit >= 0 => Some(*limit as usize),
        Some(other) => {
            return Err(BrokerError::PreconditionFailed(format!(
                "invalid {MAX_LENGTH_ARG}: {other:?}"
            )));
        }
    };
    let reject_publish = match options.arguments.get(OVERFLOW_ARG) {
        None => false,
        Some(FieldValue::Text(mode)) if mode == REJECT_PUBLISH => true,
        Some(FieldValue::Text(mode)) if mode == "drop-head" => false,
        Some(other) => {
            return Err(BrokerError::PreconditionFailed(format!(
                "invalid {OVERFLOW_ARG}: {other:?}"
            )));
        }
    };
    Ok((max_length, reject_publish))
}

impl State {
    fn connection_closed(&self, connection: Id) -> Option<String> {
        match self.connections.get(&connection) {
            Some(state) => state.close_reason.clone(),
            None => Some("unknown connection".to_string()),
        }
    }

    fn channel_mut(&mut self, channel: Id, connection: Id) -> Result<&mut ChannelState, BrokerError> {
        if let Some(reason) = self.connection_closed(connection) {
            return Err(BrokerError::ConnectionClosed(reason));
        }
        self.channels
            .get_mut(&channel)
            .ok_or(BrokerError::ChannelClosed)
    }

    fn queue(&self, name: &str) -> Result<&Queue, BrokerError> {
        self.queues.get(name).ok_or_else(|| BrokerError::NotFound {
            kind: "queue",
            name: name.to_string(),
        })
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        if name.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "the default exchange cannot be declared".to_string(),
            ));
        }
        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::PreconditionFailed(
                format!("exchange '{name}' exists with type {:?}", existing.kind),
            )),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(
        &mut self,
        connection: Id,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, BrokerError> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Id::new().simple())
        } else {
            name.to_string()
        };
        if let Some(existing) = self.queues.get(&name) {
            existing.check_access(connection)?;
            if existing.options != options {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{name}'"
                )));
            }
            return Ok(existing.info());
        }

        let (max_length, reject_publish) = parse_bounds(&options)?;
        let queue = Queue {
            name: name.clone(),
            owner: options.exclusive.then_some(connection),
            options,
            max_length,
            reject_publish,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
        };
        let info = queue.info();
        self.queues.insert(name, queue);
        Ok(info)
    }

    fn bind(
        &mut self,
        connection: Id,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.queue(queue)?.check_access(connection)?;
        let target = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;
        let bound = target
            .bindings
            .iter()
            .any(|(name, key)| name == queue && key == routing_key);
        if !bound {
            target
                .bindings
                .push((queue.to_string(), routing_key.to_string()));
        }
        Ok(())
    }

    fn remove_queue(&mut self, name: &str) -> u32 {
        let Some(queue) = self.queues.remove(name) else {
            return 0;
        };
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
        // Consumer senders drop with the queue, ending their streams.
        queue.messages.len() as u32
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: Properties,
        body: Bytes,
    ) -> Result<Confirmation, BrokerError> {
        let expires_at = match &properties.expiration {
            Some(expiration) => {
                let millis = expiration.parse::<u64>().map_err(|_| {
                    BrokerError::PreconditionFailed(format!("invalid expiration '{expiration}'"))
                })?;
                Some(Instant::now() + Duration::from_millis(millis))
            }
            None => None,
        };

        let mut targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let source = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::NotFound {
                    kind: "exchange",
                    name: exchange.to_string(),
                })?;
            source
                .bindings
                .iter()
                .filter(|(_, key)| source.kind == ExchangeKind::Fanout || key == routing_key)
                .map(|(queue, _)| queue.clone())
                .collect()
        };
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            return Ok(if mandatory {
                Confirmation::Returned
            } else {
                Confirmation::Ack
            });
        }

        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
            expires_at,
            redelivered: false,
        };
        let mut outcome = Confirmation::Ack;
        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                if !queue.offer(message.clone()) {
                    outcome = Confirmation::Nack;
                }
            }
        }
        for name in &targets {
            self.dispatch(name);
        }
        Ok(outcome)
    }

    /// Hands ready messages to consumers with spare capacity, round robin.
    fn dispatch(&mut self, name: &str) {
        let State {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };
        let now = Instant::now();
        loop {
            while queue
                .messages
                .front()
                .is_some_and(|message| message.is_expired(now))
            {
                queue.messages.pop_front();
            }
            if queue.messages.is_empty() {
                return;
            }
            let Some(index) = queue.next_ready_consumer() else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let slot = &mut queue.consumers[index];
            let Some(channel) = channels.get_mut(&slot.channel) else {
                queue.messages.push_front(message);
                queue.consumers.remove(index);
                continue;
            };
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };
            if slot.tx.send(delivery).is_err() {
                queue.messages.push_front(message);
                queue.consumers.remove(index);
                continue;
            }
            if !slot.auto_ack {
                slot.in_flight += 1;
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: name.to_string(),
                        consumer: slot.tag.clone(),
                        message,
                    },
                );
            }
        }
    }

    /// Removes matching consumers, requeues their unacked deliveries and drops
    /// auto-delete queues left without consumers.
    fn detach_consumers(&mut self, matches: impl Fn(&ConsumerSlot) -> bool) {
        let mut removed: Vec<(Id, String)> = Vec::new();
        let mut touched: Vec<String> = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|slot| {
                if matches(slot) {
                    removed.push((slot.channel, slot.tag.clone()));
                    false
                } else {
                    true
                }
            });
            if queue.consumers.len() != before {
                queue.cursor = 0;
                touched.push(name.clone());
            }
        }

        for (channel_id, consumer) in &removed {
            let Some(channel) = self.channels.get_mut(channel_id) else {
                continue;
            };
            let mut tags: Vec<u64> = channel
                .unacked
                .iter()
                .filter(|(_, unacked)| &unacked.consumer == consumer)
                .map(|(tag, _)| *tag)
                .collect();
            // Newest first so the oldest ends up at the head again.
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                let Some(unacked) = channel.unacked.remove(&tag) else {
                    continue;
                };
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.messages.push_front(message);
                }
            }
        }

        for name in touched {
            let abandoned = self
                .queues
                .get(&name)
                .is_some_and(|queue| queue.options.auto_delete && queue.consumers.is_empty());
            if abandoned {
                self.remove_queue(&name);
            } else {
                self.dispatch(&name);
            }
        }
    }

    fn close_channel(&mut self, channel: Id) {
        if !self.channels.contains_key(&channel) {
            return;
        }
        self.detach_consumers(|slot| slot.channel == channel);
        self.channels.remove(&channel);
    }

    fn close_connection(&mut self, connection: Id, reason: String) {
        let Some(state) = self.connections.get_mut(&connection) else {
            return;
        };
        if state.close_reason.is_some() {
            return;
        }
        tracing::debug!(connection = %connection, reason = %reason, "Closing memory connection");
        state.close_reason = Some(reason);

        let channels: Vec<Id> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .values()
            .filter(|queue| queue.owner == Some(connection))
            .map(|queue| queue.name.clone())
            .collect();
        for name in exclusive {
            self.remove_queue(&name);
        }
    }
}
