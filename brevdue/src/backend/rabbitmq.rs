//! RabbitMQ backend built on [lapin](https://github.com/amqp-rs/lapin).
//!
//! Each handle owns its own connection and channel, so handles may live on
//! different threads without sharing broker state. Acknowledgements go
//! through the channel by delivery tag, which on RabbitMQ is an in-order,
//! channel-wide scheme: acking tag N may settle all earlier unacked tags on
//! that channel. See [`Backend::ACK_IS_CUMULATIVE`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{Backend, PubQueue, SubQueue};
use crate::{
    error::Error,
    message::{Message, MessageId},
    Result,
};

/// The RabbitMQ backend factory.
#[derive(Clone, Copy, Debug, Default)]
pub struct RabbitBackend;

#[async_trait]
impl Backend for RabbitBackend {
    type Pub = RabbitPub;
    type Sub = RabbitSub;

    const ACK_IS_CUMULATIVE: bool = true;

    async fn create_pub(&self, address: &str, name: &str) -> Result<RabbitPub> {
        RabbitPub::connect(address, name).await
    }

    async fn create_sub(&self, address: &str, name: &str, prefetch: u16) -> Result<RabbitSub> {
        RabbitSub::connect(address, name, prefetch).await
    }
}

/// Connects to AMQP and opens a dedicated channel for a handle.
async fn connect(address: &str) -> Result<(Connection, Channel)> {
    debug!("Connecting to AMQP on address: {address:?} ...");
    let connection = Connection::connect(address, ConnectionProperties::default())
        .await
        .map_err(|e| Error::connect(address, e))?;
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| Error::connect(address, e))?;
    trace!("Connected to AMQP on address: {address:?}");
    Ok((connection, channel))
}

/// Idempotently declares the queue as non-durable.
async fn declare_queue(channel: &Channel, name: &str) -> lapin::Result<()> {
    trace!("Declaring queue {name:?} ...");
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// Extracts the delivery tag from an id produced by this backend.
fn delivery_tag(msg_id: &MessageId) -> Result<u64> {
    match msg_id {
        MessageId::DeliveryTag(tag) => Ok(*tag),
        other => Err(Error::UnsupportedMessageId(other.clone())),
    }
}

/// A raw publish handle: one connection and channel bound to one queue.
pub struct RabbitPub {
    /// The queue this handle publishes to.
    queue: String,
    /// The connection owned by this handle.
    connection: Connection,
    /// The dedicated channel, in confirm mode.
    channel: Channel,
    /// False once [`PubQueue::close`] has run.
    open: bool,
}

impl RabbitPub {
    /// Connects, declares the queue and switches the channel to confirm mode.
    async fn connect(address: &str, name: &str) -> Result<Self> {
        let (connection, channel) = connect(address).await?;
        declare_queue(&channel, name)
            .await
            .map_err(|e| Error::connect(address, e))?;
        // Turn on delivery confirmations so sends block until the broker
        // has taken responsibility for the message.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::connect(address, e))?;
        Ok(Self {
            queue: name.to_string(),
            connection,
            channel,
            open: true,
        })
    }
}

#[async_trait]
impl PubQueue for RabbitPub {
    async fn send_message(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        let confirmation = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                data,
                BasicProperties::default(),
            )
            .await
            .map_err(Error::upstream)?
            .await
            .map_err(Error::upstream)?;
        trace!(queue = %self.queue, ?confirmation, "Published message");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        debug!(queue = %self.queue, "Closing publish handle");
        self.connection
            .close(200, "closing publish handle")
            .await
            .map_err(Error::upstream)
    }
}

/// A raw subscribe handle: one connection and channel bound to one queue.
pub struct RabbitSub {
    /// The queue this handle consumes from.
    queue: String,
    /// The connection owned by this handle.
    connection: Connection,
    /// The dedicated channel acks and nacks go through.
    channel: Channel,
    /// The channel-side consumer, created lazily on the first stream step.
    consumer: Option<Consumer>,
    /// False once [`SubQueue::close`] has run.
    open: bool,
}

impl RabbitSub {
    /// Connects, declares the queue and applies channel-wide flow control.
    async fn connect(address: &str, name: &str, prefetch: u16) -> Result<Self> {
        let (connection, channel) = connect(address).await?;
        declare_queue(&channel, name)
            .await
            .map_err(|e| Error::connect(address, e))?;
        trace!("Reporting basic quality of service with prefetch {prefetch}...");
        channel
            .basic_qos(prefetch, BasicQosOptions { global: true })
            .await
            .map_err(|e| Error::connect(address, e))?;
        Ok(Self {
            queue: name.to_string(),
            connection,
            channel,
            consumer: None,
            open: true,
        })
    }

    /// Fails with [`Error::NotConnected`] once the handle is closed.
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl SubQueue for RabbitSub {
    async fn get_message(&mut self) -> Result<Option<Message>> {
        self.ensure_open()?;
        let got = self
            .channel
            .basic_get(&self.queue, BasicGetOptions::default())
            .await
            .map_err(Error::upstream)?;
        Ok(got.map(|m| Message::new(m.delivery.delivery_tag, m.delivery.data)))
    }

    /// Acks by delivery tag on the channel.
    ///
    /// RabbitMQ settles acks in order: acking message N of several
    /// in-progress messages may settle them all. We always pass
    /// `multiple: false`, but callers must not rely on non-cumulative
    /// semantics across a nack/ack interleaving on the same channel.
    async fn ack_message(&mut self, msg_id: &MessageId) -> Result<()> {
        self.ensure_open()?;
        let tag = delivery_tag(msg_id)?;
        self.channel
            .basic_ack(tag, BasicAckOptions { multiple: false })
            .await
            .map_err(Error::upstream)
    }

    async fn reject_message(&mut self, msg_id: &MessageId) -> Result<()> {
        self.ensure_open()?;
        let tag = delivery_tag(msg_id)?;
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(Error::upstream)
    }

    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>> {
        self.ensure_open()?;
        if self.consumer.is_none() {
            let tag = format!("brevdue-{}", Uuid::new_v4());
            trace!(queue = %self.queue, tag = %tag, "Creating consumer ...");
            let consumer = self
                .channel
                .basic_consume(
                    &self.queue,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(Error::upstream)?;
            self.consumer = Some(consumer);
        }
        let consumer = self.consumer.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, consumer.next()).await {
            // No delivery within the inactivity window: the stream ends.
            Err(_elapsed) => {
                trace!(queue = %self.queue, "Stream inactivity timeout");
                Ok(None)
            }
            // The consumer was cancelled broker-side; the stream ends.
            Ok(None) => {
                debug!(queue = %self.queue, "Consumer cancelled, ending stream");
                Ok(None)
            }
            Ok(Some(Err(e))) => Err(Error::upstream(e)),
            Ok(Some(Ok(delivery))) => {
                Ok(Some(Message::new(delivery.delivery_tag, delivery.data)))
            }
        }
    }

    async fn cancel_stream(&mut self) -> Result<()> {
        if let Some(consumer) = self.consumer.take() {
            let consumer_tag = consumer.tag();
            let tag = consumer_tag.as_str();
            trace!(queue = %self.queue, tag, "Cancelling consumer ...");
            self.channel
                .basic_cancel(tag, BasicCancelOptions::default())
                .await
                .map_err(Error::upstream)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if let Err(e) = self.cancel_stream().await {
            warn!(queue = %self.queue, "Failed to cancel consumer during close (closing regardless): {e:#}");
        }
        debug!(queue = %self.queue, "Closing subscribe handle");
        self.connection
            .close(200, "closing subscribe handle")
            .await
            .map_err(Error::upstream)
    }
}
