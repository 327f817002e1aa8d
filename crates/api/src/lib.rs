//! Health endpoints for long-running stage processes.

pub mod response;
pub mod routes;

pub use routes::router;
