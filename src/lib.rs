//! Distributed pipeline execution orchestrator.
//!
//! Wires the nine modules of spec.md §4 together: the Resource Pool
//! Registry (C1), Quota/Usage Ledger (C2), Worker Registry (C3),
//! Worker Connection Handler (C4), Placement Strategies (C5),
//! Scheduler Service (C6), Execution State Machine (C7), Execution
//! Engine (C8), and Event & Log Fanout (C9). [`bootstrap::Services`]
//! is the composition root; `server.rs` (the binary) owns the process
//! lifecycle around it.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod execution;
pub mod fanout;
pub mod ledger;
pub mod model;
pub mod pool_registry;
pub mod protocol;
pub mod scheduler;
pub mod worker_registry;

pub use bootstrap::Services;
pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
