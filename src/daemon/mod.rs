//! The worker daemon: transport reactors, routing, worker threads, and the
//! background writers that feed the controller.

pub mod checkpoint;
pub mod control;
pub mod filter;
pub mod metrics;
pub mod queue;
pub mod responder;
pub mod router;
pub mod run;
pub mod transport;
pub mod worker;

pub use filter::{FilterTable, Verdict};
pub use metrics::Metrics;
pub use queue::Queue;
pub use router::Router;
pub use transport::TransportError;
pub use worker::{WorkMsg, WorkerHandle};
