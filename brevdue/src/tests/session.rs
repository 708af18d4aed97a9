//! Tests for the receive session's acknowledgement state machine.

use std::convert::Infallible;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error as ThisError;

use super::{data_list, mem_queue, send_all};
use crate::{Backend, Error, PubQueue};

/// Inactivity window for the test sessions. The memory broker delivers
/// immediately, so this only pays off once at the end of each stream.
const TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, ThisError)]
#[error("handler failure")]
struct HandlerFailure;

#[tokio::test]
async fn session_yields_in_order_and_acks_every_message() {
    let (backend, mut queue) = mem_queue("session-order");
    send_all(&mut queue).await;

    let mut received = Vec::new();
    let mut session = queue.recv::<Value>(TIMEOUT);
    session
        .consume(|value| {
            received.push(value);
            async { Ok::<_, Infallible>(()) }
        })
        .await
        .unwrap();
    drop(session);

    assert_eq!(received, data_list());

    let stats = backend.stats("session-order");
    assert_eq!(stats.acked, vec![0, 1, 2, 3, 4, 5]);
    assert!(stats.nacked.is_empty());

    // Normal end of stream closes the subscribe handle.
    assert!(queue.sub_handle_mut().is_none());
}

#[tokio::test]
async fn failure_on_kth_yield_acks_k_minus_one_and_nacks_one() {
    let (backend, mut queue) = mem_queue("session-kth");
    send_all(&mut queue).await;

    let mut seen = 0u32;
    let mut session = queue.recv::<Value>(TIMEOUT);
    let result = session
        .consume(|_| {
            seen += 1;
            let fail = seen == 3;
            async move {
                if fail {
                    Err(HandlerFailure)
                } else {
                    Ok(())
                }
            }
        })
        .await;

    // The failure is suppressed and the session left resumable.
    assert!(result.is_ok());
    assert!(session.is_suspended());
    drop(session);

    let stats = backend.stats("session-kth");
    assert_eq!(stats.acked, vec![0, 1]);
    assert_eq!(stats.nacked, vec![2]);

    // Suspension retains the subscribe handle.
    assert!(queue.sub_handle_mut().is_some());
}

#[tokio::test]
async fn suspended_session_resumes_with_the_next_message() {
    let (backend, mut queue) = mem_queue("session-resume");
    send_all(&mut queue).await;

    let mut session = queue.recv::<Value>(TIMEOUT);

    // Round 1: fail on the very first yield.
    session
        .consume(|_| async { Err::<(), HandlerFailure>(HandlerFailure) })
        .await
        .unwrap();
    assert!(session.is_suspended());

    // Round 2: re-entering the same session continues with the next
    // message; the nacked one comes back at the end of the queue.
    let mut received = Vec::new();
    session
        .consume(|value| {
            received.push(value);
            async { Ok::<_, Infallible>(()) }
        })
        .await
        .unwrap();
    drop(session);

    let mut expected: Vec<Value> = data_list().split_off(1);
    expected.push(data_list().remove(0));
    assert_eq!(received, expected);

    let stats = backend.stats("session-resume");
    assert_eq!(stats.nacked, vec![0]);
    assert_eq!(stats.acked.len(), 6);
    assert!(queue.sub_handle_mut().is_none());
}

#[tokio::test]
async fn separate_sessions_also_resume_after_suppression() {
    let (backend, mut queue) = mem_queue("session-resume-separate");
    send_all(&mut queue).await;

    let mut session = queue.recv::<Value>(TIMEOUT);
    session
        .consume(|_| async { Err::<(), HandlerFailure>(HandlerFailure) })
        .await
        .unwrap();
    drop(session);

    // A fresh recv() call picks up the retained subscribe handle.
    let mut received = Vec::new();
    let mut session = queue.recv::<Value>(TIMEOUT);
    session
        .consume(|value| {
            received.push(value);
            async { Ok::<_, Infallible>(()) }
        })
        .await
        .unwrap();
    drop(session);

    assert_eq!(received.len(), 6);
    assert_eq!(backend.stats("session-resume-separate").acked.len(), 6);
}

#[tokio::test]
async fn propagated_failure_nacks_and_closes() {
    let (backend, mut queue) = mem_queue("session-propagate");
    queue = queue.with_propagate_recv_error(true);
    send_all(&mut queue).await;

    let mut session = queue.recv::<Value>(TIMEOUT);
    let err = session
        .consume(|_| async { Err::<(), HandlerFailure>(HandlerFailure) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Downstream(_)));
    drop(session);

    let stats = backend.stats("session-propagate");
    assert_eq!(stats.nacked, vec![0]);
    assert!(stats.acked.is_empty());
    assert!(queue.sub_handle_mut().is_none());
}

#[tokio::test]
async fn upstream_error_propagates_regardless_of_policy() {
    let (backend, mut queue) = mem_queue("session-upstream");
    send_all(&mut queue).await;
    backend.inject_stream_error("session-upstream");

    // propagate_error is false here; upstream errors ignore it.
    let mut session = queue.recv::<Value>(TIMEOUT);
    let err = session
        .consume(|_| async { Ok::<_, Infallible>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Upstream(_)));
    drop(session);

    assert!(queue.sub_handle_mut().is_none());
}

#[tokio::test]
async fn upstream_error_nacks_the_in_flight_message() {
    let (backend, mut queue) = mem_queue("session-upstream-inflight");
    queue = queue.with_prefetch(4);
    send_all(&mut queue).await;

    // Without auto-ack the first message is still in flight on the second
    // step, which is where the upstream error hits.
    let mut session = queue.recv::<Value>(TIMEOUT).with_auto_ack(false);
    let first = session.next().await.unwrap();
    assert!(first.is_some());

    backend.inject_stream_error("session-upstream-inflight");
    let err = session.next().await.unwrap_err();
    assert!(matches!(err, Error::Upstream(_)));
    drop(session);

    let stats = backend.stats("session-upstream-inflight");
    assert_eq!(stats.nacked, vec![0]);
    assert!(stats.acked.is_empty());
    assert!(queue.sub_handle_mut().is_none());
}

#[tokio::test]
async fn no_auto_ack_issues_no_acks() {
    let (backend, mut queue) = mem_queue("session-no-auto-ack");
    queue = queue.with_prefetch(16);
    send_all(&mut queue).await;

    let mut session = queue.recv::<Value>(TIMEOUT).with_auto_ack(false);
    let mut count = 0;
    while let Some(_value) = session.next().await.unwrap() {
        count += 1;
    }
    session.finish().await.unwrap();
    drop(session);

    assert_eq!(count, 6);
    let stats = backend.stats("session-no-auto-ack");
    assert!(stats.acked.is_empty());
    assert!(stats.nacked.is_empty());
    // Closing the handle returned the unresolved deliveries to the queue.
    assert_eq!(stats.ready, 6);
    assert_eq!(stats.outstanding, 0);
}

#[tokio::test]
async fn no_auto_ack_still_nacks_on_failure() {
    let (backend, mut queue) = mem_queue("session-no-auto-ack-fail");
    queue = queue.with_prefetch(16);
    send_all(&mut queue).await;

    let mut session = queue.recv::<Value>(TIMEOUT).with_auto_ack(false);
    assert!(session.next().await.unwrap().is_some());
    session.fail(HandlerFailure).await.unwrap();
    drop(session);

    let stats = backend.stats("session-no-auto-ack-fail");
    assert!(stats.acked.is_empty());
    assert_eq!(stats.nacked, vec![0]);
}

#[tokio::test]
async fn finish_acks_the_in_flight_message_after_a_break() {
    let (backend, mut queue) = mem_queue("session-break");
    send_all(&mut queue).await;

    let mut session = queue.recv::<Value>(TIMEOUT);
    assert!(session.next().await.unwrap().is_some());
    // Breaking out early is a normal scope exit: the handed-out message was
    // processed successfully and gets acked by finish().
    session.finish().await.unwrap();
    drop(session);

    let stats = backend.stats("session-break");
    assert_eq!(stats.acked, vec![0]);
    assert!(stats.nacked.is_empty());
    assert_eq!(stats.ready, 5);
    assert!(queue.sub_handle_mut().is_none());
}

#[tokio::test]
async fn undecodable_payload_is_nacked_and_suppressed() {
    let (backend, mut queue) = mem_queue("session-decode");
    let mut raw_pub = backend
        .create_pub("mem://local", "session-decode")
        .await
        .unwrap();
    raw_pub.send_message(b"not json").await.unwrap();

    let mut received = Vec::new();
    let mut session = queue.recv::<Value>(TIMEOUT);
    session
        .consume(|value| {
            received.push(value);
            async { Ok::<_, Infallible>(()) }
        })
        .await
        .unwrap();
    assert!(session.is_suspended());
    drop(session);

    assert!(received.is_empty());
    assert_eq!(backend.stats("session-decode").nacked, vec![0]);
}

#[tokio::test]
async fn undecodable_payload_propagates_when_configured() {
    let (backend, mut queue) = mem_queue("session-decode-propagate");
    queue = queue.with_propagate_recv_error(true);
    let mut raw_pub = backend
        .create_pub("mem://local", "session-decode-propagate")
        .await
        .unwrap();
    raw_pub.send_message(b"not json").await.unwrap();

    let mut session = queue.recv::<Value>(TIMEOUT);
    let err = session
        .consume(|_| async { Ok::<_, Infallible>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
}
