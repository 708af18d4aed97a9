//! In-process memory backend.
//!
//! A small broker that lives inside the [`MemBackend`] value, for unit tests
//! and local development: FIFO delivery per queue name, prefetch enforcement
//! and requeue-on-nack, with no network and no global state. Clones of a
//! `MemBackend` share the same queues; distinct `MemBackend` values are
//! fully isolated brokers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error as ThisError;
use tracing::trace;

use super::{Backend, PubQueue, SubQueue};
use crate::{
    error::Error,
    message::{Message, MessageId},
    Result,
};

/// How often a waiting stream step re-checks its queue.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// The error produced by [`MemBackend::inject_stream_error`].
#[derive(Debug, ThisError)]
#[error("injected stream failure")]
pub(crate) struct InjectedFailure;

/// The in-process memory backend factory. Cheap to clone; clones share the
/// same queues.
#[derive(Clone, Debug, Default)]
pub struct MemBackend {
    /// Queues by name, shared by all handles of this backend.
    registry: Arc<Mutex<HashMap<String, QueueState>>>,
}

/// The broker-side state of one named queue.
#[derive(Debug, Default)]
struct QueueState {
    /// The next delivery tag to assign.
    next_tag: u64,
    /// Messages ready for delivery, in order.
    ready: VecDeque<(u64, Vec<u8>)>,
    /// Messages delivered but neither acked nor nacked.
    outstanding: HashMap<u64, Vec<u8>>,
    /// Tags acked so far, in order of ack.
    acked: Vec<u64>,
    /// Tags nacked so far, in order of nack.
    nacked: Vec<u64>,
    /// When set, the next stream step fails with an upstream error.
    fail_next_stream: bool,
}

/// A snapshot of a queue's ledger, for assertions in the unit tests.
#[derive(Clone, Debug, Default)]
pub(crate) struct MemStats {
    /// Tags acked so far, in order of ack.
    pub(crate) acked: Vec<u64>,
    /// Tags nacked so far, in order of nack.
    pub(crate) nacked: Vec<u64>,
    /// Number of messages ready for delivery.
    pub(crate) ready: usize,
    /// Number of delivered-but-unresolved messages.
    pub(crate) outstanding: usize,
}

impl MemBackend {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against the named queue's state, creating it if needed.
    fn with_queue<R>(&self, name: &str, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let mut registry = self.registry.lock().expect("memory broker registry poisoned");
        f(registry.entry(name.to_string()).or_default())
    }

    /// Snapshots the named queue's ledger.
    pub(crate) fn stats(&self, name: &str) -> MemStats {
        self.with_queue(name, |q| MemStats {
            acked: q.acked.clone(),
            nacked: q.nacked.clone(),
            ready: q.ready.len(),
            outstanding: q.outstanding.len(),
        })
    }

    /// Makes the next stream step on the named queue fail upstream.
    pub(crate) fn inject_stream_error(&self, name: &str) {
        self.with_queue(name, |q| q.fail_next_stream = true);
    }
}

#[async_trait]
impl Backend for MemBackend {
    type Pub = MemPub;
    type Sub = MemSub;

    const ACK_IS_CUMULATIVE: bool = false;

    async fn create_pub(&self, _address: &str, name: &str) -> Result<MemPub> {
        Ok(MemPub {
            name: name.to_string(),
            backend: self.clone(),
            open: true,
        })
    }

    async fn create_sub(&self, _address: &str, name: &str, prefetch: u16) -> Result<MemSub> {
        Ok(MemSub {
            name: name.to_string(),
            prefetch,
            backend: self.clone(),
            open: true,
        })
    }
}

/// A publish handle on the memory broker.
pub struct MemPub {
    /// The queue this handle publishes to.
    name: String,
    /// The shared broker.
    backend: MemBackend,
    /// False once closed.
    open: bool,
}

#[async_trait]
impl PubQueue for MemPub {
    async fn send_message(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        self.backend.with_queue(&self.name, |q| {
            let tag = q.next_tag;
            q.next_tag += 1;
            q.ready.push_back((tag, data.to_vec()));
            trace!(queue = %self.name, tag, "Enqueued message");
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

/// A subscribe handle on the memory broker.
pub struct MemSub {
    /// The queue this handle consumes from.
    name: String,
    /// Max delivered-but-unresolved messages at a time.
    prefetch: u16,
    /// The shared broker.
    backend: MemBackend,
    /// False once closed.
    open: bool,
}

impl MemSub {
    /// Delivers the next ready message if flow control permits.
    fn try_deliver(&self) -> Result<Option<Message>> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        Ok(self.backend.with_queue(&self.name, |q| {
            if q.outstanding.len() >= usize::from(self.prefetch) {
                return None;
            }
            let (tag, data) = q.ready.pop_front()?;
            q.outstanding.insert(tag, data.clone());
            Some(Message::new(tag, data))
        }))
    }

    /// Extracts the delivery tag from an id produced by this backend.
    fn delivery_tag(msg_id: &MessageId) -> Result<u64> {
        match msg_id {
            MessageId::DeliveryTag(tag) => Ok(*tag),
            other => Err(Error::UnsupportedMessageId(other.clone())),
        }
    }
}

#[async_trait]
impl SubQueue for MemSub {
    async fn get_message(&mut self) -> Result<Option<Message>> {
        self.try_deliver()
    }

    async fn ack_message(&mut self, msg_id: &MessageId) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        let tag = Self::delivery_tag(msg_id)?;
        self.backend.with_queue(&self.name, |q| {
            q.outstanding.remove(&tag);
            q.acked.push(tag);
        });
        Ok(())
    }

    async fn reject_message(&mut self, msg_id: &MessageId) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        let tag = Self::delivery_tag(msg_id)?;
        self.backend.with_queue(&self.name, |q| {
            // Requeue at the back: redelivery order after a nack is not
            // promised, and this keeps first deliveries flowing first.
            if let Some(data) = q.outstanding.remove(&tag) {
                q.ready.push_back((tag, data));
            }
            q.nacked.push(tag);
        });
        Ok(())
    }

    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let failed = self
                .backend
                .with_queue(&self.name, |q| std::mem::take(&mut q.fail_next_stream));
            if failed {
                return Err(Error::upstream(InjectedFailure));
            }
            if let Some(message) = self.try_deliver()? {
                return Ok(Some(message));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn cancel_stream(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        // Unresolved deliveries return to the queue, as a broker would
        // redeliver after a consumer disconnect.
        self.backend.with_queue(&self.name, |q| {
            let mut returned: Vec<(u64, Vec<u8>)> = q.outstanding.drain().collect();
            returned.sort_by_key(|(tag, _)| *tag);
            for entry in returned {
                q.ready.push_back(entry);
            }
        });
        Ok(())
    }
}
