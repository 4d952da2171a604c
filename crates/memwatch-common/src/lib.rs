//! memwatch common types
//!
//! Shared data model, error enums and logging configuration used by the
//! memwatch engine and CLI.

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Error, ProcessError, Result, SymbolError, WatchError};
pub use logging::{init_logging, LogConfig};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
