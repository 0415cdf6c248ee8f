//! Cluster-wide message bus
//!
//! Every node subscribes to one ordered topic. Plain messages go to every
//! node; an addressed message travels the same topic wrapped with its
//! recipient and is dropped by everyone else, which gives point-to-point
//! delivery without a second transport.
//!
//! Incoming messages fan out to all registered listeners, each delivery on
//! its own task. A semaphore caps how many listener callbacks run at once,
//! so a slow listener never stalls the pump, though many blocked listeners
//! can still exhaust the permits.

use crate::config::MessagingConfig;
use crate::error::{ClusterError, Result};
use crate::grid::{Grid, TopicMessage};
use crate::metrics;
use crate::node::NodeId;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

/// Topic carrying bus traffic
pub const MESSAGE_TOPIC: &str = "cohort.messages";

/// Wire shape of a bus message, decoded once at the topic boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusFrame {
    Broadcast { payload: Vec<u8> },
    Addressed { recipient: NodeId, payload: Vec<u8> },
}

/// A message as seen by a listener
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub sender: NodeId,
    /// Sent by this node
    pub is_local: bool,
    pub payload: Bytes,
}

impl MessageEvent {
    /// Decode the payload as `T`
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }
}

#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, event: MessageEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct BusInner {
    grid: Arc<dyn Grid>,
    local: NodeId,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn MessageListener>)>>,
    next_listener: AtomicU64,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    config: MessagingConfig,
}

impl BusInner {
    fn dispatch(&self, message: TopicMessage) {
        let frame: BusFrame = match bincode::deserialize(&message.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(sender = %message.sender, error = %e, "Dropping undecodable bus frame");
                return;
            }
        };

        let payload = match frame {
            BusFrame::Broadcast { payload } => payload,
            BusFrame::Addressed { recipient, payload } => {
                if recipient != self.local {
                    return;
                }
                payload
            }
        };

        let event = MessageEvent {
            is_local: message.sender == self.local,
            sender: message.sender,
            payload: Bytes::from(payload),
        };

        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        trace!(sender = %event.sender, listeners = listeners.len(), "Dispatching bus message");

        for listener in listeners {
            let permits = Arc::clone(&self.permits);
            let event = event.clone();
            self.tracker.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                listener.on_message(event).await;
                metrics::record_message_delivered(MESSAGE_TOPIC);
            });
        }
    }
}

/// Cluster-wide publish/subscribe with addressed delivery
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Subscribe to the bus topic and start delivering to listeners
    pub fn start(grid: Arc<dyn Grid>, config: &MessagingConfig) -> Result<Self> {
        let rx = grid.subscribe(MESSAGE_TOPIC)?;
        let inner = Arc::new(BusInner {
            local: grid.local_node().id,
            grid,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            permits: Arc::new(Semaphore::new(config.listener_workers.max(1))),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            config: config.clone(),
        });

        tokio::spawn(pump(Arc::clone(&inner), rx));
        debug!(
            node = %inner.local,
            workers = inner.config.listener_workers,
            "Message bus started"
        );
        Ok(Self { inner })
    }

    pub fn local_node(&self) -> &NodeId {
        &self.inner.local
    }

    /// Broadcast to every node, this one included
    pub async fn send_message<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let frame = BusFrame::Broadcast {
            payload: bincode::serialize(message)?,
        };
        self.publish(&frame).await
    }

    /// Deliver to `recipient` only
    pub async fn send_message_to<T: Serialize + ?Sized>(
        &self,
        recipient: &NodeId,
        message: &T,
    ) -> Result<()> {
        let frame = BusFrame::Addressed {
            recipient: recipient.clone(),
            payload: bincode::serialize(message)?,
        };
        self.publish(&frame).await
    }

    async fn publish(&self, frame: &BusFrame) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ClusterError::NodeStopping("message bus is closed".into()));
        }
        let bytes = Bytes::from(bincode::serialize(frame)?);
        self.inner.grid.publish(MESSAGE_TOPIC, bytes).await?;
        metrics::record_message_published(MESSAGE_TOPIC);
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, listener));
        id
    }

    /// `false` if the listener was already gone
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Send `outgoing` to `address` and wait for the first message accepted
    /// by `matcher`, failing with [`ClusterError::Timeout`] after the
    /// configured exchange timeout.
    pub async fn exchange_messages<T, F>(
        &self,
        address: &NodeId,
        outgoing: &T,
        matcher: F,
    ) -> Result<MessageEvent>
    where
        T: Serialize + ?Sized,
        F: Fn(&MessageEvent) -> bool + Send + Sync + 'static,
    {
        self.exchange_messages_within(address, outgoing, matcher, self.inner.config.exchange_timeout())
            .await
    }

    pub async fn exchange_messages_within<T, F>(
        &self,
        address: &NodeId,
        outgoing: &T,
        matcher: F,
        timeout: Duration,
    ) -> Result<MessageEvent>
    where
        T: Serialize + ?Sized,
        F: Fn(&MessageEvent) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(ExchangeListener {
            matcher,
            reply: Mutex::new(Some(tx)),
        });
        // Removed on every exit path, including cancellation of this future
        let _registration = ListenerRegistration {
            bus: self.clone(),
            id: self.add_listener(listener),
        };

        self.send_message_to(address, outgoing).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClusterError::Cancelled(
                "message exchange listener dropped".into(),
            )),
            Err(_) => Err(ClusterError::Timeout(format!(
                "no reply from {} within {:?}",
                address, timeout
            ))),
        }
    }

    /// Stop the pump and wait briefly for in-flight listener callbacks
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(Duration::from_secs(5), self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!("Message listeners still running after bus shutdown");
        }
        self.inner.listeners.write().clear();
    }
}

async fn pump(inner: Arc<BusInner>, mut rx: mpsc::UnboundedReceiver<TopicMessage>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => inner.dispatch(message),
                None => break,
            },
        }
    }
    debug!(node = %inner.local, "Message bus pump stopped");
}

struct ExchangeListener<F> {
    matcher: F,
    reply: Mutex<Option<oneshot::Sender<MessageEvent>>>,
}

#[async_trait]
impl<F> MessageListener for ExchangeListener<F>
where
    F: Fn(&MessageEvent) -> bool + Send + Sync + 'static,
{
    async fn on_message(&self, event: MessageEvent) {
        if !(self.matcher)(&event) {
            return;
        }
        let reply = self.reply.lock().take();
        if let Some(reply) = reply {
            let _ = reply.send(event);
        }
    }
}

struct ListenerRegistration {
    bus: MessageBus,
    id: ListenerId,
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if !self.bus.remove_listener(self.id) {
            warn!(listener = ?self.id, "Exchange listener already removed");
        }
    }
}
