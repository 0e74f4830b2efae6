//! Durable Streams Rust Client
//!
//! A Rust client library for the Durable Streams protocol - persistent, resumable
//! event streams over HTTP with exactly-once semantics.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use durable_streams::{Client, Offset};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new();
//!     let stream = client.stream("https://api.example.com/streams/my-stream");
//!
//!     // Create a stream
//!     stream.create().await?;
//!
//!     // Append data
//!     stream.append(b"hello world".to_vec()).await?;
//!
//!     // Read data with a single-consumer iterator
//!     let mut reader = stream.read().offset(Offset::Beginning).build();
//!     while let Some(chunk) = reader.next_chunk().await? {
//!         println!("Got {} bytes", chunk.data.len());
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod dynamic;
mod error;
mod fanout;
mod iterator;
mod producer;
mod retry;
mod sse;
mod stream;
mod types;
mod visibility;

pub use client::{Client, ClientBuilder};
pub use dynamic::DynamicValue;
pub use error::{CancelReason, InvalidHeaderError, ProducerError, StreamError};
pub use fanout::{ContentMode, RawDispatch, Unsubscribe};
pub use iterator::{Chunk, ChunkIterator, ErrorOverride, OnErrorHook, ReadBuilder, Session, SessionOutcome};
pub use producer::{AppendReceipt, OnErrorCallback, Producer, ProducerBuilder};
pub use retry::{JitterMode, RetryConfig, RetryConfigError};
pub use sse::{SseEvent, SseParser};
pub use stream::{
    AppendOptions, AppendResponse, CreateOptions, DeleteOptions, DurableStream, HeadOptions,
    HeadResponse,
};
pub use types::{LiveMode, Offset};
pub use visibility::{Visibility, VisibilityGate, VisibilitySignal};
