//! Apache Pulsar backend built on the [pulsar](https://docs.rs/pulsar) crate.
//!
//! Pulsar is a topic broker: a subscribe handle is a consumer on a shared,
//! persistent subscription, which gives the same one-of-N delivery semantics
//! as a queue. There is no channel-wide prefetch; the subscriber's flow
//! permits are sized by the requested prefetch instead. Acks are
//! consumer-local and never cumulative.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use pulsar::{
    consumer::Message as PulsarMessage, message::proto::MessageIdData, Consumer, Producer, Pulsar,
    SubType, TokioExecutor,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{Backend, PubQueue, SubQueue};
use crate::{
    error::Error,
    message::{Message, MessageId},
    Result,
};

/// The bounded wait used by [`SubQueue::get_message`], which Pulsar only
/// offers as a receive-with-timeout.
const GET_MESSAGE_WAIT: Duration = Duration::from_millis(100);

/// The subscription all subscribe handles attach to.
///
/// Sharing one persistent subscription across handles is what makes a topic
/// behave like a queue: each message goes to exactly one of its consumers.
const SUBSCRIPTION: &str = "brevdue";

/// The Apache Pulsar backend factory.
#[derive(Clone, Copy, Debug, Default)]
pub struct PulsarBackend;

#[async_trait]
impl Backend for PulsarBackend {
    type Pub = PulsarPub;
    type Sub = PulsarSub;

    const ACK_IS_CUMULATIVE: bool = false;

    async fn create_pub(&self, address: &str, name: &str) -> Result<PulsarPub> {
        PulsarPub::connect(address, name).await
    }

    async fn create_sub(&self, address: &str, name: &str, prefetch: u16) -> Result<PulsarSub> {
        PulsarSub::connect(address, name, prefetch).await
    }
}

/// Builds a client for the given service address.
async fn connect(address: &str) -> Result<Pulsar<TokioExecutor>> {
    debug!("Connecting to Pulsar on address: {address:?} ...");
    Pulsar::builder(address, TokioExecutor)
        .build()
        .await
        .map_err(|e| Error::connect(address, e))
}

/// Renders a broker message id to stable bytes.
///
/// The rendering is stable across redelivery, so a redelivered message
/// compares equal to its original delivery.
fn id_bytes(id: &MessageIdData) -> Vec<u8> {
    format!(
        "{}:{}:{}:{}",
        id.ledger_id,
        id.entry_id,
        id.partition(),
        id.batch_index()
    )
    .into_bytes()
}

/// A raw publish handle: one client and producer bound to one topic.
pub struct PulsarPub {
    /// The topic this handle publishes to.
    topic: String,
    /// The client owned by this handle.
    #[allow(dead_code)]
    client: Pulsar<TokioExecutor>,
    /// The producer, dropped on close.
    producer: Option<Producer<TokioExecutor>>,
}

impl PulsarPub {
    /// Connects and creates a producer on the topic.
    async fn connect(address: &str, name: &str) -> Result<Self> {
        let client = connect(address).await?;
        let producer = client
            .producer()
            .with_topic(name)
            .with_name(format!("brevdue-{}", Uuid::new_v4()))
            .build()
            .await
            .map_err(|e| Error::connect(address, e))?;
        Ok(Self {
            topic: name.to_string(),
            client,
            producer: Some(producer),
        })
    }
}

#[async_trait]
impl PubQueue for PulsarPub {
    async fn send_message(&mut self, data: &[u8]) -> Result<()> {
        let producer = self.producer.as_mut().ok_or(Error::NotConnected)?;
        // The first await hands the message to the client, the second waits
        // for the broker's send receipt.
        let receipt = producer
            .send(data.to_vec())
            .await
            .map_err(Error::upstream)?
            .await
            .map_err(Error::upstream)?;
        trace!(topic = %self.topic, sequence_id = ?receipt.sequence_id, "Published message");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.producer.take().is_some() {
            debug!(topic = %self.topic, "Closing publish handle");
        }
        Ok(())
    }
}

/// A raw subscribe handle: one client and consumer bound to one topic.
pub struct PulsarSub {
    /// The topic this handle consumes from.
    topic: String,
    /// The client owned by this handle.
    #[allow(dead_code)]
    client: Pulsar<TokioExecutor>,
    /// The consumer on the shared subscription, dropped on close.
    consumer: Option<Consumer<Vec<u8>, TokioExecutor>>,
    /// Deliveries handed out but neither acked nor nacked yet, keyed by the
    /// rendered message id. Bounded by the subscriber's flow permits.
    pending: HashMap<Vec<u8>, PulsarMessage<Vec<u8>>>,
}

impl PulsarSub {
    /// Connects and attaches a consumer to the shared subscription.
    async fn connect(address: &str, name: &str, prefetch: u16) -> Result<Self> {
        let client = connect(address).await?;
        let consumer = client
            .consumer()
            .with_topic(name)
            .with_subscription(SUBSCRIPTION)
            .with_subscription_type(SubType::Shared)
            .with_consumer_name(format!("brevdue-{}", Uuid::new_v4()))
            // Pulsar's receiver-queue depth: at most this many deliveries
            // are pushed to us before we ack.
            .with_batch_size(u32::from(prefetch))
            .build()
            .await
            .map_err(|e| Error::connect(address, e))?;
        Ok(Self {
            topic: name.to_string(),
            client,
            consumer: Some(consumer),
            pending: HashMap::new(),
        })
    }

    /// Pulls one message with the given bound, recording it as pending.
    async fn receive(&mut self, wait: Duration) -> Result<Option<Message>> {
        let consumer = self.consumer.as_mut().ok_or(Error::NotConnected)?;
        match tokio::time::timeout(wait, consumer.try_next()).await {
            // Nothing within the window.
            Err(_elapsed) => Ok(None),
            // The consumer stream ended; nothing more will arrive.
            Ok(Ok(None)) => {
                debug!(topic = %self.topic, "Consumer stream ended");
                Ok(None)
            }
            Ok(Err(e)) => Err(Error::upstream(e)),
            Ok(Ok(Some(msg))) => {
                let key = id_bytes(&msg.message_id.id);
                let message = Message::new(key.clone(), msg.payload.data.clone());
                self.pending.insert(key, msg);
                Ok(Some(message))
            }
        }
    }

    /// Removes a pending delivery by id.
    fn take_pending(&mut self, msg_id: &MessageId) -> Result<PulsarMessage<Vec<u8>>> {
        let key = match msg_id {
            MessageId::Bytes(key) => key,
            other => return Err(Error::UnsupportedMessageId(other.clone())),
        };
        self.pending
            .remove(key)
            .ok_or_else(|| Error::UnsupportedMessageId(msg_id.clone()))
    }
}

#[async_trait]
impl SubQueue for PulsarSub {
    async fn get_message(&mut self) -> Result<Option<Message>> {
        self.receive(GET_MESSAGE_WAIT).await
    }

    async fn ack_message(&mut self, msg_id: &MessageId) -> Result<()> {
        let msg = self.take_pending(msg_id)?;
        let consumer = self.consumer.as_mut().ok_or(Error::NotConnected)?;
        consumer.ack(&msg).await.map_err(Error::upstream)
    }

    async fn reject_message(&mut self, msg_id: &MessageId) -> Result<()> {
        let msg = self.take_pending(msg_id)?;
        let consumer = self.consumer.as_mut().ok_or(Error::NotConnected)?;
        consumer.nack(&msg).await.map_err(Error::upstream)
    }

    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>> {
        self.receive(timeout).await
    }

    /// Pulsar has no consumer-cancel on an open subscription; its streams
    /// simply end at inactivity, so there is nothing to release here.
    async fn cancel_stream(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.consumer.take().is_some() {
            debug!(topic = %self.topic, "Closing subscribe handle");
            if !self.pending.is_empty() {
                warn!(
                    topic = %self.topic,
                    pending = self.pending.len(),
                    "Closing with unresolved deliveries; the broker will redeliver them"
                );
                self.pending.clear();
            }
        }
        Ok(())
    }
}
