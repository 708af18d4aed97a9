//! Brevdue-specific error types.

use thiserror::Error as ThisError;

use crate::message::MessageId;

/// Boxed error used for broker-specific and caller-side error causes.
///
/// The public surface stays broker-agnostic by carrying the underlying
/// `lapin`/`pulsar`/caller errors behind this type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that may be returned by `brevdue`.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The broker was unreachable or refused us while constructing a handle.
    #[error("failed to connect to broker at {address:?}: {source}")]
    Connect {
        /// The broker endpoint the connection attempt was made against.
        address: String,
        /// The underlying transport error.
        #[source]
        source: BoxError,
    },

    /// An operation was attempted on a closed or uninitialized handle.
    #[error("operation attempted on a closed or uninitialized handle")]
    NotConnected,

    /// A single-message receive found the queue empty.
    #[error("no message available on the queue")]
    NoMessageAvailable,

    /// The broker or adapter failed during streaming, publishing or a get.
    #[error("broker error: {0}")]
    Upstream(#[source] BoxError),

    /// Caller-side failure while handling a yielded message.
    #[error("error while handling a received message: {0}")]
    Downstream(#[source] BoxError),

    /// A value could not be encoded into a payload.
    #[error("failed to encode message payload: {0}")]
    Encode(#[source] BoxError),

    /// A payload could not be decoded into the requested value.
    #[error("failed to decode message payload: {0}")]
    Decode(#[source] BoxError),

    /// A message id of the wrong shape was handed to an adapter.
    #[error("message id {0} is not valid for this backend")]
    UnsupportedMessageId(MessageId),
}

impl Error {
    /// Wraps a transport error from handle construction.
    pub(crate) fn connect(address: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Connect {
            address: address.into(),
            source: source.into(),
        }
    }

    /// Wraps a broker-side error.
    pub(crate) fn upstream(source: impl Into<BoxError>) -> Self {
        Self::Upstream(source.into())
    }
}
