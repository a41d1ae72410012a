#![forbid(unsafe_code)]

pub mod config;
pub mod daemon;
pub mod error;
pub mod kv;
pub mod proto;
pub mod telemetry;
pub mod test_harness;
pub mod timer;
pub mod vm;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers need at crate root.
pub use crate::config::{HandlerConfig, IpcType, ServerSettings, WorkerArgs, NUM_VBUCKETS};
pub use crate::daemon::run::{serve, serve_with, Collaborators, ServeOptions};
pub use crate::proto::{Event, Header, Payload, Response};
