//! # dwarfscope Utilities
//!
//! Shared logging setup for the dwarfscope workspace.
//!
//! The core engine only emits `tracing` events; binaries and test suites use
//! this crate to install a subscriber for them.

pub mod logging;

pub use logging::{init_logging, init_logging_with_level, init_test_logging, LogFormat, LogLevel, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
