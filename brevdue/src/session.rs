//! The receive session: a scoped, resumable, failure-aware consumer.
//!
//! A [`RecvSession`] is three things at once: a lazy sequence of decoded
//! values, a scoped resource that settles every message it hands out, and a
//! re-entrant object that survives caller-side failures. The scope is the
//! [`consume`](RecvSession::consume) call; the lower-level
//! [`next`](RecvSession::next) / [`fail`](RecvSession::fail) /
//! [`finish`](RecvSession::finish) methods are public for callers that need
//! to break out of the stream early or manage acknowledgement themselves.
//!
//! Every message retrieved by a session reaches exactly one terminal state:
//! acked when the caller finished with it, nacked when the caller (or the
//! payload decode) failed, or returned to the broker when the handle closes.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, error, trace, warn};

use crate::{
    backend::{Backend, SubQueue},
    codec::Codec,
    error::{BoxError, Error},
    message::MessageId,
    queue::Queue,
    Result,
};

/// Where the session's cursor is between scope entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Cursor {
    /// Created but not yet streaming.
    Idle,
    /// Inside a scope, pulling messages.
    Streaming,
    /// A caller-side failure was suppressed; the stream is retained and the
    /// next scope entry continues from it.
    Suspended,
    /// The stream ended or was torn down; the next scope entry starts over
    /// on a fresh handle.
    Closed,
}

/// A scoped, resumable iterator over decoded messages from one queue.
///
/// Obtained from [`Queue::recv`]. Parameterized by an inactivity `timeout`
/// (the stream ends after that long without a message), `auto_ack` (whether
/// a successfully handled message is acknowledged automatically) and
/// `propagate_error` (whether caller-side failures end the scope with an
/// error or are suppressed, leaving the session resumable).
///
/// Dropping a session mid-stream settles nothing; the in-flight message, if
/// any, returns to the broker when the subscribe handle closes. Prefer
/// ending the scope through [`consume`](Self::consume) or
/// [`finish`](Self::finish).
#[must_use = "A session does nothing until you call `consume` or `next`."]
pub struct RecvSession<'q, B: Backend, C: Codec, T> {
    /// The owning facade; holds the subscribe handle and the codec.
    queue: &'q mut Queue<B, C>,
    /// Inactivity window for each stream step.
    timeout: Duration,
    /// Whether successfully handled messages are acked automatically.
    auto_ack: bool,
    /// Whether caller-side failures are re-raised instead of suppressed.
    propagate_error: bool,
    /// The session's cursor state.
    cursor: Cursor,
    /// The message handed to the caller but not yet acked or nacked.
    in_flight: Option<MessageId>,
    /// The decoded value type.
    _values: PhantomData<fn() -> T>,
}

impl<'q, B, C, T> RecvSession<'q, B, C, T>
where
    B: Backend,
    C: Codec,
    T: DeserializeOwned,
{
    /// Creates a session bound to the facade's subscribe handle.
    pub(crate) fn new(
        queue: &'q mut Queue<B, C>,
        timeout: Duration,
        auto_ack: bool,
        propagate_error: bool,
    ) -> Self {
        Self {
            queue,
            timeout,
            auto_ack,
            propagate_error,
            cursor: Cursor::Idle,
            in_flight: None,
            _values: PhantomData,
        }
    }

    /// Sets whether messages are acked automatically on successful yield.
    ///
    /// Defaults to true. With `false`, the session never acks; settling
    /// messages positively becomes the caller's responsibility through the
    /// raw subscribe handle. A caller-side failure still nacks the
    /// in-flight message.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Sets whether caller-side failures are re-raised instead of suppressed.
    ///
    /// Defaults to the facade's `propagate_recv_error` setting.
    pub fn with_propagate_error(mut self, propagate_error: bool) -> Self {
        self.propagate_error = propagate_error;
        self
    }

    /// True if the last scope exit suppressed a caller-side failure, leaving
    /// the stream retained for re-entry.
    pub fn is_suspended(&self) -> bool {
        self.cursor == Cursor::Suspended
    }

    /// Enters the session's scope, feeding each decoded value to `handler`.
    ///
    /// Each value the handler returns `Ok` for is acknowledged (when
    /// `auto_ack`). A handler error nacks the value's message and ends the
    /// scope: suppressed (returning `Ok`) when `propagate_error` is false,
    /// leaving the session suspended and resumable, or returned as
    /// [`Error::Downstream`] when it is true. The scope also ends normally
    /// when the stream goes quiet for the session's timeout, after which the
    /// facade's subscribe handle is closed.
    ///
    /// Calling `consume` again on a suspended session continues with the
    /// next message from the same stream.
    ///
    /// # Errors
    /// [`Error::Upstream`] if the broker fails mid-stream (regardless of
    /// `propagate_error`), [`Error::Downstream`] or [`Error::Decode`] for
    /// propagated caller-side failures, or a connection error if the handle
    /// cannot be opened.
    pub async fn consume<F, Fut, E>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<BoxError>,
    {
        loop {
            match self.next().await {
                Ok(Some(value)) => {
                    if let Err(e) = handler(value).await {
                        return self.fail(e).await;
                    }
                }
                Ok(None) => return self.finish().await,
                // The offending message is already nacked; apply the
                // downstream policy without touching the in-flight slot.
                Err(e @ Error::Decode(_)) => return self.suspend_or_propagate(e).await,
                // Upstream and connection errors have already torn down.
                Err(e) => return Err(e),
            }
        }
    }

    /// Retrieves the next decoded value of the stream.
    ///
    /// Advancing past a handed-out message means the caller finished with it
    /// without failing, so this acks it first (when `auto_ack`). Returns
    /// `Ok(None)` at the stream's end (inactivity timeout or cancellation).
    ///
    /// # Errors
    /// [`Error::Upstream`] on broker failure (the in-flight message, if any,
    /// is nacked best-effort and the subscribe handle is closed) or
    /// [`Error::Decode`] if a payload cannot be decoded (that message is
    /// nacked; the stream is left intact).
    pub async fn next(&mut self) -> Result<Option<T>> {
        if self.cursor == Cursor::Closed {
            debug!("Re-entering a closed session; a fresh stream will be opened");
        }
        self.cursor = Cursor::Streaming;

        if self.auto_ack {
            if let Some(msg_id) = self.in_flight.take() {
                let sub = self.queue.ensure_sub().await?;
                if let Err(e) = sub.ack_message(&msg_id).await {
                    self.teardown().await;
                    return Err(e);
                }
                trace!(%msg_id, "Acked message");
            }
        }

        let pulled = {
            let sub = self.queue.ensure_sub().await?;
            sub.next_message(self.timeout).await
        };

        match pulled {
            Ok(Some(message)) => match self.queue.codec().decode::<T>(&message.data) {
                Ok(value) => {
                    trace!(msg_id = %message.msg_id, "Yielding message");
                    self.in_flight = Some(message.msg_id);
                    Ok(Some(value))
                }
                Err(e) => {
                    // The broker did its job; an undecodable payload is a
                    // downstream failure of this one message.
                    warn!(msg_id = %message.msg_id, "Received undecodable message payload");
                    self.nack_best_effort(&message.msg_id).await;
                    Err(e)
                }
            },
            Ok(None) => {
                trace!("End of stream");
                Ok(None)
            }
            Err(e) => {
                if let Some(msg_id) = self.in_flight.take() {
                    self.nack_best_effort(&msg_id).await;
                }
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Records a caller-side failure for the message currently in flight.
    ///
    /// The message is nacked (best-effort; a nack failure is logged and
    /// swallowed, the caller's error dominates). When `propagate_error` is
    /// set the stream is torn down and the error is returned as
    /// [`Error::Downstream`]; otherwise it is suppressed, the stream is
    /// retained and the session may be re-entered.
    ///
    /// # Errors
    /// The caller's error, wrapped, when `propagate_error` is set.
    pub async fn fail<E: Into<BoxError>>(&mut self, error: E) -> Result<()> {
        if let Some(msg_id) = self.in_flight.take() {
            self.nack_best_effort(&msg_id).await;
        }
        self.suspend_or_propagate(Error::Downstream(error.into())).await
    }

    /// Ends the scope normally.
    ///
    /// The in-flight message, if any, is acked (when `auto_ack`): reaching a
    /// normal scope exit means the caller finished with it. The stream is
    /// then cancelled and the facade's subscribe handle closed, so the next
    /// receive starts fresh.
    ///
    /// # Errors
    /// [`Error::Upstream`] if the final ack fails.
    pub async fn finish(&mut self) -> Result<()> {
        if self.auto_ack {
            if let Some(msg_id) = self.in_flight.take() {
                let sub = self.queue.ensure_sub().await?;
                if let Err(e) = sub.ack_message(&msg_id).await {
                    self.teardown().await;
                    return Err(e);
                }
                trace!(%msg_id, "Acked message");
            }
        } else {
            // Positive settlement is the caller's business; whatever is
            // still un-acked returns to the broker when the handle closes.
            self.in_flight = None;
        }
        debug!("Receive session finished");
        self.teardown().await;
        Ok(())
    }

    /// Applies the downstream-failure policy for an already-settled message.
    async fn suspend_or_propagate(&mut self, error: Error) -> Result<()> {
        if self.propagate_error {
            self.teardown().await;
            Err(error)
        } else {
            warn!("Suppressing downstream error: {error:#}");
            self.cursor = Cursor::Suspended;
            Ok(())
        }
    }

    /// Releases the stream and closes the facade's subscribe handle.
    async fn teardown(&mut self) {
        self.cursor = Cursor::Closed;
        if let Some(sub) = self.queue.sub_handle_mut() {
            if let Err(e) = sub.cancel_stream().await {
                error!("Failed to cancel stream during teardown (continuing regardless): {e:#}");
            }
        }
        self.queue.close_sub_handle().await;
    }

    /// Nacks a message, logging and swallowing any failure.
    async fn nack_best_effort(&mut self, msg_id: &MessageId) {
        match self.queue.sub_handle_mut() {
            Some(sub) => match sub.reject_message(msg_id).await {
                Ok(()) => debug!(%msg_id, "Nacked message"),
                Err(e) => error!(%msg_id, "Failed to nack message during cleanup: {e:#}"),
            },
            None => error!(%msg_id, "No open subscribe handle to nack message on"),
        }
    }
}
