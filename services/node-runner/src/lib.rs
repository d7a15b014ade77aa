//! Node Runner Library
//!
//! The node runner is the long-lived host process of a scanning node. It
//! does not scan anything itself: it keeps two containers alive and on the
//! latest released images.
//!
//! ## Architecture
//!
//! ```text
//! Runner
//! ├── start-up check      (runtime, JSON-RPC endpoints, batch API)
//! ├── update loop         (image refs -> compare-and-replace, updater first)
//! ├── keep-alive loop     (restart exited containers)
//! └── health endpoint     (/health, /livez)
//!         │
//!         ▼
//! ContainerSet ──► ContainerRuntime (Docker Engine API, or mock)
//! ```
//!
//! ## Modules
//!
//! - `runner`: Service lifecycle and background loops
//! - `state`: Container set and the replace protocol
//! - `runtime`: Container runtime abstraction with Docker and mock backends
//! - `images`: Image ref discovery
//! - `launch`: Per-role container launch configuration

pub mod config;
pub mod error;
pub mod health;
pub mod images;
pub mod launch;
pub mod probes;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod startup;
pub mod state;

// Re-export commonly used types
pub use config::Config;
pub use error::{ReplaceError, ReplaceStep, RunnerError, Severity};
pub use images::{ChannelImageStore, ImageRefPublisher, ImageRefs, ImageStore};
pub use launch::Role;
pub use runner::{FatalHandler, Runner};
pub use runtime::{ContainerRuntime, DockerRuntime, MockRuntime};
pub use state::{ContainerSet, ReplaceOutcome};
