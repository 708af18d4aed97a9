//! The user-facing queue facade.

use std::future::Future;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, warn};

use crate::{
    backend::{Backend, PubQueue, SubQueue},
    codec::{Codec, Json},
    error::{BoxError, Error},
    message::MessageId,
    session::RecvSession,
    Result,
};

/// A handle to one logical queue on a broker, parameterized by a backend.
///
/// The facade owns its raw publish and subscribe handles and constructs them
/// lazily: the first [`send`](Self::send) opens a publish connection, the
/// first receive opens a subscribe connection. Values are encoded and
/// decoded through the facade's [`Codec`] (JSON by default).
///
/// A `Queue` is not meant to be shared between threads; give each thread
/// that publishes or subscribes its own facade, mirroring the usual broker
/// guidance that a connection or channel object is single-threaded.
pub struct Queue<B: Backend, C: Codec = Json> {
    /// The backend factory raw handles are created from.
    backend: B,
    /// Broker endpoint (host or connection URL).
    address: String,
    /// Queue or topic name.
    name: String,
    /// Max unacknowledged messages outstanding to the subscriber.
    prefetch: u16,
    /// Whether caller-side failures during receives are re-raised.
    propagate_recv_error: bool,
    /// Converts application values to and from payload bytes.
    codec: C,
    /// The lazily opened publish handle.
    pub_queue: Option<B::Pub>,
    /// The lazily opened subscribe handle.
    sub_queue: Option<B::Sub>,
}

impl<B: Backend> Queue<B> {
    /// Creates a facade for the named queue with the default codec.
    ///
    /// No connection is made until the queue is first used.
    pub fn new(backend: B, address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            backend,
            address: address.into(),
            name: name.into(),
            prefetch: Self::DEFAULT_PREFETCH,
            propagate_recv_error: false,
            codec: Json,
            pub_queue: None,
            sub_queue: None,
        }
    }
}

impl<B: Backend, C: Codec> Queue<B, C> {
    /// The default for the max number of unacknowledged outstanding messages.
    pub const DEFAULT_PREFETCH: u16 = 1;

    /// Sets the subscriber prefetch. Values below 1 are clamped to 1.
    ///
    /// Takes effect when the subscribe handle is (re)opened.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Sets whether caller-side failures during receives are re-raised
    /// (true) or suppressed (false, the default).
    pub fn with_propagate_recv_error(mut self, propagate_recv_error: bool) -> Self {
        self.propagate_recv_error = propagate_recv_error;
        self
    }

    /// Replaces the codec used for encoding and decoding values.
    pub fn with_codec<C2: Codec>(self, codec: C2) -> Queue<B, C2> {
        Queue {
            backend: self.backend,
            address: self.address,
            name: self.name,
            prefetch: self.prefetch,
            propagate_recv_error: self.propagate_recv_error,
            codec,
            pub_queue: self.pub_queue,
            sub_queue: self.sub_queue,
        }
    }

    /// The queue or topic name this facade is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The broker endpoint this facade connects to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Encodes and publishes one value.
    ///
    /// Blocks until the broker confirms the publish where the broker
    /// supports confirmation. If the publish handle was closed underneath
    /// us, it is transparently reopened once.
    ///
    /// # Errors
    /// [`Error::Encode`] if the value cannot be encoded (the broker is not
    /// touched), [`Error::Connect`] if no connection can be established, or
    /// [`Error::Upstream`] if the broker rejects the publish.
    pub async fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let data = self.codec.encode(value)?;
        let pub_queue = self.ensure_pub().await?;
        match pub_queue.send_message(&data).await {
            Err(Error::NotConnected) => {
                debug!(queue = %self.name, "Publish handle was closed; reopening");
                self.pub_queue = None;
                let pub_queue = self.ensure_pub().await?;
                pub_queue.send_message(&data).await
            }
            other => other,
        }
    }

    /// Receives exactly one value within a failure-aware scope.
    ///
    /// The next available message is decoded and handed to `handler`. When
    /// the handler returns `Ok` the message is acked; when it fails the
    /// message is nacked and the failure is suppressed — unless the facade
    /// was built with `propagate_recv_error`, in which case it is returned
    /// as [`Error::Downstream`]. The subscribe handle stays open either way.
    ///
    /// # Errors
    /// [`Error::NoMessageAvailable`] if the queue is empty, decode and
    /// connection errors, or the handler's error when propagation is on.
    pub async fn recv_one<T, F, Fut, E>(&mut self, handler: F) -> Result<()>
    where
        T: DeserializeOwned,
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<BoxError>,
    {
        let message = {
            let sub = self.ensure_sub().await?;
            sub.get_message().await?
        };
        let Some(message) = message else {
            return Err(Error::NoMessageAvailable);
        };

        let value = match self.codec.decode::<T>(&message.data) {
            Ok(value) => value,
            Err(e) => {
                warn!(msg_id = %message.msg_id, "Received undecodable message payload");
                self.nack_best_effort(&message.msg_id).await;
                return if self.propagate_recv_error {
                    Err(e)
                } else {
                    warn!("Suppressing downstream error: {e:#}");
                    Ok(())
                };
            }
        };

        match handler(value).await {
            Ok(()) => {
                let sub = self.ensure_sub().await?;
                sub.ack_message(&message.msg_id).await
            }
            Err(e) => {
                self.nack_best_effort(&message.msg_id).await;
                let error = Error::Downstream(e.into());
                if self.propagate_recv_error {
                    Err(error)
                } else {
                    warn!("Suppressing downstream error: {error:#}");
                    Ok(())
                }
            }
        }
    }

    /// Returns a receive session over the facade's subscribe handle.
    ///
    /// The session is configured with `auto_ack` on and `propagate_error`
    /// taken from the facade; see [`RecvSession`] for the acknowledgement
    /// and resumption discipline. `timeout` bounds inactivity, not total
    /// session duration: the window restarts with every received message.
    pub fn recv<T>(&mut self, timeout: Duration) -> RecvSession<'_, B, C, T>
    where
        T: DeserializeOwned,
    {
        RecvSession::new(self, timeout, true, self.propagate_recv_error)
    }

    /// Closes any open handles. The facade remains usable; handles reopen
    /// lazily on the next send or receive.
    ///
    /// # Errors
    /// The first error encountered while closing; the remaining handles are
    /// still closed.
    pub async fn close(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(mut pub_queue) = self.pub_queue.take() {
            if let Err(e) = pub_queue.close().await {
                error!(queue = %self.name, "Failed to close publish handle: {e:#}");
                result = Err(e);
            }
        }
        if let Some(mut sub_queue) = self.sub_queue.take() {
            if let Err(e) = sub_queue.close().await {
                error!(queue = %self.name, "Failed to close subscribe handle: {e:#}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Opens the publish handle if it is not already open.
    async fn ensure_pub(&mut self) -> Result<&mut B::Pub> {
        if self.pub_queue.is_none() {
            debug!(queue = %self.name, "Opening publish handle");
            let pub_queue = self.backend.create_pub(&self.address, &self.name).await?;
            self.pub_queue = Some(pub_queue);
        }
        self.pub_queue.as_mut().ok_or(Error::NotConnected)
    }

    /// Opens the subscribe handle if it is not already open.
    pub(crate) async fn ensure_sub(&mut self) -> Result<&mut B::Sub> {
        if self.sub_queue.is_none() {
            debug!(queue = %self.name, prefetch = self.prefetch, "Opening subscribe handle");
            let sub_queue = self
                .backend
                .create_sub(&self.address, &self.name, self.prefetch)
                .await?;
            self.sub_queue = Some(sub_queue);
        }
        self.sub_queue.as_mut().ok_or(Error::NotConnected)
    }

    /// The open subscribe handle, if any.
    pub(crate) fn sub_handle_mut(&mut self) -> Option<&mut B::Sub> {
        self.sub_queue.as_mut()
    }

    /// The facade's codec.
    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }

    /// Closes and forgets the subscribe handle, logging any failure.
    pub(crate) async fn close_sub_handle(&mut self) {
        if let Some(mut sub_queue) = self.sub_queue.take() {
            if let Err(e) = sub_queue.close().await {
                error!(queue = %self.name, "Failed to close subscribe handle (continuing regardless): {e:#}");
            }
        }
    }

    /// Nacks a message on the open subscribe handle, logging and swallowing
    /// any failure.
    async fn nack_best_effort(&mut self, msg_id: &MessageId) {
        match self.sub_queue.as_mut() {
            Some(sub) => match sub.reject_message(msg_id).await {
                Ok(()) => debug!(%msg_id, "Nacked message"),
                Err(e) => error!(%msg_id, "Failed to nack message during cleanup: {e:#}"),
            },
            None => error!(%msg_id, "No open subscribe handle to nack message on"),
        }
    }
}
