//! The backend adapter contract.
//!
//! A [`Backend`] is a factory for raw per-queue handles. All broker-specific
//! behavior lives behind these three traits; the [`Queue`](crate::Queue)
//! facade and [`RecvSession`](crate::RecvSession) are written against them
//! only.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    message::{Message, MessageId},
    Result,
};

pub mod mem;
pub mod pulsar;
pub mod rabbitmq;

/// Factory for a broker backend's raw publish and subscribe handles.
///
/// Backends are passed by value into [`Queue::new`](crate::Queue::new);
/// adapter selection is by value, not by configuration.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The publish handle type produced by this backend.
    type Pub: PubQueue;
    /// The subscribe handle type produced by this backend.
    type Sub: SubQueue;

    /// Whether acknowledging a message may also acknowledge earlier unacked
    /// deliveries on the same handle.
    ///
    /// True for channel-wide-delivery-tag brokers such as RabbitMQ. Callers
    /// must not rely on non-cumulative semantics when this is true.
    const ACK_IS_CUMULATIVE: bool;

    /// Establishes a publish connection for the named queue or topic.
    ///
    /// Queue-style brokers idempotently declare the queue as non-durable and
    /// enable delivery confirmation.
    ///
    /// # Errors
    /// Returns [`Error::Connect`](crate::Error::Connect) on transport failure.
    async fn create_pub(&self, address: &str, name: &str) -> Result<Self::Pub>;

    /// Establishes a subscribe connection for the named queue or topic.
    ///
    /// Configures per-consumer flow control so that at most `prefetch`
    /// unacked messages may be outstanding. Topic brokers map this to the
    /// receiver-queue depth.
    ///
    /// # Errors
    /// Returns [`Error::Connect`](crate::Error::Connect) on transport failure.
    async fn create_sub(&self, address: &str, name: &str, prefetch: u16) -> Result<Self::Sub>;
}

/// A raw publish handle bound to a single queue or topic.
#[async_trait]
pub trait PubQueue: Send {
    /// Publishes one opaque payload to the configured destination.
    ///
    /// Blocks until the broker confirms the publish where the broker
    /// supports confirmation.
    ///
    /// # Errors
    /// Returns [`Error::NotConnected`](crate::Error::NotConnected) if the
    /// handle has been closed.
    async fn send_message(&mut self, data: &[u8]) -> Result<()>;

    /// Releases all broker-side resources held by this handle. Idempotent.
    ///
    /// # Errors
    /// Returns an error if the broker rejects the close; the handle is
    /// considered closed regardless.
    async fn close(&mut self) -> Result<()>;
}

/// A raw subscribe handle bound to a single queue or topic.
#[async_trait]
pub trait SubQueue: Send {
    /// Attempts to receive one message without waiting for new arrivals.
    ///
    /// Adapters may use a short bounded wait. Returns `Ok(None)` when no
    /// message is available.
    ///
    /// # Errors
    /// Returns [`Error::NotConnected`](crate::Error::NotConnected) after
    /// close, or [`Error::Upstream`](crate::Error::Upstream) on broker
    /// failure.
    async fn get_message(&mut self) -> Result<Option<Message>>;

    /// Positively acknowledges a previously yielded message.
    ///
    /// # Errors
    /// Returns [`Error::Upstream`](crate::Error::Upstream) on broker failure
    /// and [`Error::UnsupportedMessageId`](crate::Error::UnsupportedMessageId)
    /// for an id this backend did not produce.
    async fn ack_message(&mut self, msg_id: &MessageId) -> Result<()>;

    /// Negatively acknowledges a previously yielded message.
    ///
    /// Requeue policy follows the broker's default.
    ///
    /// # Errors
    /// As for [`ack_message`](Self::ack_message).
    async fn reject_message(&mut self, msg_id: &MessageId) -> Result<()>;

    /// Retrieves the next message of the handle's inactivity-bounded stream.
    ///
    /// The broker-side consumer is created lazily on the first call. Returns
    /// `Ok(None)` when no message arrives within `timeout` or when the
    /// consumer was cancelled, which ends the stream.
    ///
    /// # Errors
    /// Upstream broker errors are always propagated.
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>>;

    /// Releases the broker-side consumer/cursor state of the stream, leaving
    /// the handle itself usable for further calls.
    ///
    /// # Errors
    /// Returns [`Error::Upstream`](crate::Error::Upstream) if the broker
    /// rejects the cancellation.
    async fn cancel_stream(&mut self) -> Result<()>;

    /// Releases all broker-side resources held by this handle. Idempotent.
    ///
    /// Messages delivered but not yet acked return to the broker per its
    /// redelivery policy.
    ///
    /// # Errors
    /// Returns an error if the broker rejects the close; the handle is
    /// considered closed regardless.
    async fn close(&mut self) -> Result<()>;
}
