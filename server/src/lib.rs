//! Ferry Server - Docker Engine API front end.
//!
//! Translates the Docker API subset the CLI uses for build, push, pull, tag
//! and inspect into operations on the ferry runtime, and serves the chunk
//! dedup endpoints used by the `ferry` client.

pub mod error;
pub mod handlers;
pub mod params;
pub mod router;
pub mod state;

pub use error::ApiError;
pub use router::create_router;
pub use state::AppState;
