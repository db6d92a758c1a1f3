//! Poll a record store for pending actions, run each action's shell command
//! inside a named container, and write the outcome back.
//!
//! ```text
//! PostgrestStore ──fetch_pending──► CycleDriver ──run──► DockerBackend
//!        ▲                              │
//!        └──────persist_result──────────┘
//! ```

pub mod action;
pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod shutdown;
pub mod store;

pub use action::{ActionId, ActionRecord, ExecutionOutcome, NOT_RUN_EXIT_CODE};
pub use backend::{DockerBackend, ExecutionBackend};
pub use config::{BackendConfig, DispatchConfig, RunMode, StoreConfig};
pub use driver::{CycleDriver, LoopState, MonitorSummary};
pub use error::{DispatchError, Result};
pub use shutdown::{StopHandle, StopSignal};
pub use store::{ActionStore, PostgrestStore};
