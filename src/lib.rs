//! conduit - Resilient AI workflow coordinator
//!
//! Composes calls to slow, metered generative-model providers into
//! workflows, streams their output incrementally, and keeps failing or
//! abandoned calls from cascading or burning budget.
//!
//! # Architecture
//!
//! - Every provider call goes through the resilience layer: bounded
//!   retry with exponential backoff and jitter, and a circuit breaker per
//!   provider
//! - Workflows compose providers sequentially (fail-fast), in parallel
//!   (fail-soft) or hierarchically (master, then fan-out)
//! - Streaming sessions own their client connection; when the client
//!   goes away the session closes and in-flight generation stops
//!
//! # Modules
//!
//! - `adapters`: Provider trait and bundled providers (Fabric, closures)
//! - `core`: Workflow definitions, coordinator, streaming relay
//! - `domain`: Execution records
//! - `resilience`: Retry policy, error classification, circuit breakers
//! - `streaming`: Sessions, transports and the stream manager
//! - `server`: HTTP API with Server-Sent Events
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a workflow from ~/.conduit/workflows
//! conduit run digest --input '{"text": "..."}'
//!
//! # Stream a Fabric pattern
//! echo "input text" | conduit stream summarize
//!
//! # Serve the HTTP API
//! conduit serve --port 3000
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod metrics;
pub mod resilience;
pub mod server;
pub mod streaming;

// Re-export main types at crate root for convenience
pub use adapters::{ChunkStream, FabricProvider, FnProvider, Provider, ProviderError};
pub use core::{Coordinator, CoordinatorError, WorkflowDefinition};
pub use domain::{ExecutionStatus, Strategy, UnitResult, WorkflowExecution};
pub use resilience::{CallError, CallOptions, ErrorKind, Resilience};
pub use streaming::{CloseReason, EventKind, StreamingManager};
