//! Engine crate: everything that runs inside the daemon process except
//! process-level concerns (CLI parsing, Prometheus registration, signal
//! handling), which live in the `daemon` binary crate.

pub mod certcache;
pub mod classify;
pub mod dict;
pub mod error;
pub mod kernel;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod plugins;
pub mod session;
pub mod tls;
pub mod warehouse;
