//! Redpanda message bus for the table backup pipeline.

pub mod client;
pub mod config;
pub mod consumer;
pub mod health;
pub mod offsets;
pub mod partitioner;
pub mod producer;
pub mod topics;

pub use config::*;
pub use consumer::*;
pub use offsets::{OffsetStore, TopicOffsetStore};
pub use producer::*;
pub use topics::*;
