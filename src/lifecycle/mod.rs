//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Wait for leadership → Replica full sync → Initial reconciliation → Watch
//!
//! Shutdown (shutdown.rs):
//!     Trigger → every loop leaves its select! → Replica closed → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: data-plane snapshot before any write
//! - Losing leadership tears down the term but keeps the process alive

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use startup::{Operator, StartupError};
