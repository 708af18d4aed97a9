//! # brevdue
//!
//! A broker-agnostic message queue client built on top of
//! [lapin](https://github.com/amqp-rs/lapin) (RabbitMQ) and
//! [pulsar](https://docs.rs/pulsar) (Apache Pulsar).
//!
//! brevdue gives you one [`Queue`] handle per logical queue that can send
//! and receive application values, and takes care of serialization,
//! connection lifecycle, acknowledgement discipline, prefetch flow control
//! and resumable consumption across handler failures. The broker-specific
//! parts live behind the [`Backend`] trait; pass the backend you want by
//! value when constructing a queue.

// brevdue is 100% Safe Rust.
#![forbid(unsafe_code)]
#![warn(
    // Warns on ::path, allows crate::path.
    absolute_paths_not_starting_with_crate,

    // Warns you about missing documentation comments.
    // Writing documentation is a good idea! They will show up in your IDE as well.
    // Consider this a friendly nudge :)
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,

    // Warns you when you have dependencies you're not using.
    unused_crate_dependencies,

    // Warns on converting values using the `as` keyword.
    // Converting in this way panics in case of errors. Consider using the `Into` or `TryInto` traits instead.
    clippy::as_conversions,
)]

// Re-exporting the underlying client crates so you don't have to add the same versions as dependencies.
pub use lapin;
pub use pulsar;

pub mod backend;
pub mod codec;
pub mod error;
pub mod message;
pub mod queue;
pub mod session;

// pub-using every name::Name to avoid having to have brevdue::name::Name repetition.
// This way you can just do brevdue::Name.
pub use backend::{Backend, PubQueue, SubQueue};
pub use codec::{Codec, Json};
pub use error::Error;
pub use message::{Message, MessageId};
pub use queue::Queue;
pub use session::RecvSession;

/// Convenience type for a result with `brevdue`'s error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests;
