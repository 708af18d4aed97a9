//! Unit tests, run against the in-process memory backend.

mod session;

use std::sync::Once;

use serde_json::{json, Value};

use crate::backend::mem::MemBackend;
use crate::Queue;

/// Initializes a tracing subscriber once for the whole suite.
fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Mixed-type payloads exercised across the suite.
fn data_list() -> Vec<Value> {
    vec![
        json!({"a": ["foo", "bar", 3, 4]}),
        json!(1),
        json!("2"),
        json!([1, 2, 3, 4]),
        json!(false),
        json!(null),
    ]
}

/// A facade on a fresh memory broker, plus the broker for ledger assertions.
fn mem_queue(name: &str) -> (MemBackend, Queue<MemBackend>) {
    init_logging();
    let backend = MemBackend::new();
    let queue = Queue::new(backend.clone(), "mem://local", name);
    (backend, queue)
}

/// Sends every value of [`data_list`] on the queue.
async fn send_all(queue: &mut Queue<MemBackend>) {
    for value in data_list() {
        queue.send(&value).await.expect("send failed");
    }
}
