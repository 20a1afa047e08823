//! In-process transport backed by crossbeam channels.

use crate::error::{Result, StreamError};
use crate::transport::{Publisher, Replier, Requester, Subscriber, Transport};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// A request travels with the channel its reply goes back on.
type Envelope = (Bytes, Sender<Bytes>);

#[derive(Debug, Default)]
struct Topic {
    bound: bool,
    subscribers: Vec<Sender<Bytes>>,
}

#[derive(Debug, Default)]
struct Registry {
    topics: HashMap<String, Arc<Mutex<Topic>>>,
    repliers: HashMap<String, Sender<Envelope>>,
}

/// Shared address space for endpoints living in one process. Clones refer
/// to the same address space.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    registry: Arc<Mutex<Registry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, address: &str) -> Arc<Mutex<Topic>> {
        lock(&self.registry)
            .topics
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    fn replier_sender(&self, address: &str) -> Option<Sender<Envelope>> {
        lock(&self.registry).repliers.get(address).cloned()
    }
}

impl Transport for MemoryTransport {
    fn open_publisher(&self, address: &str) -> Result<Box<dyn Publisher>> {
        let topic = self.topic(address);
        {
            let mut t = lock(&topic);
            if t.bound {
                return Err(StreamError::transport(format!(
                    "address {} already has a publisher",
                    address
                )));
            }
            t.bound = true;
        }
        debug!(address, "MemoryTransport: publisher bound");
        Ok(Box::new(MemoryPublisher {
            address: address.to_string(),
            topic,
        }))
    }

    fn open_subscriber(&self, address: &str, queue_depth: usize) -> Result<Box<dyn Subscriber>> {
        let (tx, rx) = bounded(queue_depth.max(1));
        lock(&self.topic(address)).subscribers.push(tx);
        debug!(address, queue_depth, "MemoryTransport: subscriber connected");
        Ok(Box::new(MemorySubscriber { rx }))
    }

    fn open_replier(
        &self,
        address: &str,
        timeout: Duration,
        queue_depth: usize,
    ) -> Result<Box<dyn Replier>> {
        let mut registry = lock(&self.registry);
        if registry.repliers.contains_key(address) {
            return Err(StreamError::transport(format!(
                "address {} already has a replier",
                address
            )));
        }
        let (tx, rx) = bounded(queue_depth.max(1));
        registry.repliers.insert(address.to_string(), tx);
        debug!(address, queue_depth, "MemoryTransport: replier bound");
        Ok(Box::new(MemoryReplier {
            address: address.to_string(),
            registry: self.registry.clone(),
            rx,
            timeout,
            pending: None,
        }))
    }

    fn open_requester(&self, address: &str, timeout: Duration) -> Result<Box<dyn Requester>> {
        let (reply_tx, reply_rx) = bounded(1);
        Ok(Box::new(MemoryRequester {
            address: address.to_string(),
            transport: self.clone(),
            server: None,
            reply_tx,
            reply_rx,
            timeout,
        }))
    }
}

// =============================================================================
// Publish / subscribe
// =============================================================================

struct MemoryPublisher {
    address: String,
    topic: Arc<Mutex<Topic>>,
}

impl Publisher for MemoryPublisher {
    fn send(&self, message: Bytes) -> Result<usize> {
        let mut topic = lock(&self.topic);
        let mut delivered = 0;
        topic.subscribers.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                trace!(address = %self.address, "MemoryPublisher: subscriber queue full, dropping");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        Ok(delivered)
    }

    fn subscriber_count(&self) -> usize {
        lock(&self.topic).subscribers.len()
    }
}

impl Drop for MemoryPublisher {
    fn drop(&mut self) {
        let mut topic = lock(&self.topic);
        topic.bound = false;
        // Dropping the senders lets subscribers observe the close.
        topic.subscribers.clear();
    }
}

struct MemorySubscriber {
    rx: Receiver<Bytes>,
}

impl Subscriber for MemorySubscriber {
    fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(StreamError::Closed("publisher went away".to_string()))
            }
        }
    }
}

// =============================================================================
// Request / reply
// =============================================================================

struct MemoryReplier {
    address: String,
    registry: Arc<Mutex<Registry>>,
    rx: Receiver<Envelope>,
    timeout: Duration,
    pending: Option<Sender<Bytes>>,
}

impl Replier for MemoryReplier {
    fn receive_request(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        if self.pending.is_some() {
            return Err(StreamError::transport("previous request was not answered"));
        }
        match self.rx.recv_timeout(timeout) {
            Ok((request, reply_to)) => {
                self.pending = Some(reply_to);
                Ok(Some(request))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(StreamError::Closed("request channel closed".to_string()))
            }
        }
    }

    fn send_reply(&mut self, reply: Bytes) -> Result<()> {
        let reply_to = self
            .pending
            .take()
            .ok_or_else(|| StreamError::transport("reply without a pending request"))?;
        match reply_to.send_timeout(reply, self.timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(StreamError::Timeout(format!(
                "reply on {} not collected within {:?}",
                self.address, self.timeout
            ))),
            // The requester hung up; nothing left to deliver to.
            Err(SendTimeoutError::Disconnected(_)) => Ok(()),
        }
    }
}

impl Drop for MemoryReplier {
    fn drop(&mut self) {
        lock(&self.registry).repliers.remove(&self.address);
    }
}

struct MemoryRequester {
    address: String,
    transport: MemoryTransport,
    server: Option<Sender<Envelope>>,
    reply_tx: Sender<Bytes>,
    reply_rx: Receiver<Bytes>,
    timeout: Duration,
}

impl Requester for MemoryRequester {
    fn send_request(&mut self, request: Bytes) -> Result<()> {
        if self.server.is_none() {
            self.server = self.transport.replier_sender(&self.address);
        }
        let server = self.server.as_ref().ok_or_else(|| {
            StreamError::transport(format!("no replier bound at {}", self.address))
        })?;
        match server.send_timeout((request, self.reply_tx.clone()), self.timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(StreamError::Timeout(format!(
                "request to {} not accepted within {:?}",
                self.address, self.timeout
            ))),
            Err(SendTimeoutError::Disconnected(_)) => {
                self.server = None;
                Err(StreamError::Closed(format!("replier at {} went away", self.address)))
            }
        }
    }

    fn receive_reply(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        match self.reply_rx.recv_timeout(timeout) {
            Ok(reply) => Ok(Some(reply)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(StreamError::Closed("reply channel closed".to_string()))
            }
        }
    }
}
