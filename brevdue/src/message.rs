//! Raw messages and their backend-assigned identities.

use std::fmt;
use std::hash::{Hash, Hasher};

use derive_more::From;

/// An opaque, backend-assigned identity for a delivered message.
///
/// Delivery-tag brokers (RabbitMQ) assign per-channel integer tags. Topic
/// brokers (Pulsar) assign structured ids, carried here as opaque bytes.
/// The id is only meaningful to the subscribe handle that produced it.
#[derive(Clone, Debug, Eq, From, Hash, PartialEq)]
pub enum MessageId {
    /// A channel-scoped delivery tag.
    DeliveryTag(u64),
    /// An opaque byte identifier.
    Bytes(Vec<u8>),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeliveryTag(tag) => write!(f, "{tag}"),
            Self::Bytes(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// A raw message as handed out by a subscribe handle.
///
/// Two messages are equal when their ids are equal; the payload does not
/// participate. A redelivered message therefore compares equal to its
/// original delivery on brokers that keep the id stable.
#[derive(Clone, Debug, Eq)]
pub struct Message {
    /// The backend-assigned identity, used for ack and nack.
    pub msg_id: MessageId,
    /// The opaque payload bytes.
    pub data: Vec<u8>,
}

impl Message {
    /// Constructs a message from its id and payload.
    pub fn new(msg_id: impl Into<MessageId>, data: Vec<u8>) -> Self {
        Self {
            msg_id: msg_id.into(),
            data,
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.msg_id == other.msg_id
    }
}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.msg_id.hash(state);
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({}, {} bytes)", self.msg_id, self.data.len())
    }
}
