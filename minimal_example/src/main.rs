//! Super minimal example: a server that sends work out on one queue and
//! streams results back in on another.
//!
//! Expects a RabbitMQ broker and a worker consuming the work queue; pass the
//! broker address as the first argument or run against a local default
//! installation.

use std::time::Duration;

use brevdue::{backend::rabbitmq::RabbitBackend, Queue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
struct Job {
    id: u32,
    cmd: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobResult {
    id: u32,
    out: String,
}

#[tokio::main]
async fn main() -> brevdue::Result<()> {
    tracing_subscriber::fmt::init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "amqp://127.0.0.1:5672/%2f".to_string());

    let mut work_queue = Queue::new(RabbitBackend, &address, "work");
    let mut result_queue = Queue::new(RabbitBackend, &address, "result").with_prefetch(10);

    for id in 0..10 {
        work_queue
            .send(&Job {
                id,
                cmd: format!("echo {id}"),
            })
            .await?;
    }

    let mut session = result_queue.recv::<JobResult>(Duration::from_secs(5));
    session
        .consume(|result| async move {
            println!("job {} finished: {}", result.id, result.out);
            Ok::<_, std::convert::Infallible>(())
        })
        .await?;
    drop(session);

    work_queue.close().await?;
    result_queue.close().await
}
