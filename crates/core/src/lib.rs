//! Core types, message schemas, and validation for the table backup pipeline.

pub mod destination;
pub mod error;
pub mod limits;
pub mod messages;
pub mod model;
pub mod window;

pub use destination::*;
pub use error::{Error, Result, ServiceErrorCode};
pub use messages::*;
pub use model::*;
pub use window::*;
