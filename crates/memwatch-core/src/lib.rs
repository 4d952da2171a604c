//! memwatch core engine
//!
//! The cooperative trio behind the tool: a process launcher that drives the
//! OS debug event queue, a symbol resolver that turns a name into an
//! address and size, and a memory watcher that arms per-thread hardware
//! watchpoints and classifies each access as a read or a write. The watch
//! session wires the three together for a single run.

pub mod launcher;
pub mod session;
pub mod symbols;
pub mod watcher;

pub use launcher::{build_command_line, quote_arg, resolve_continue_code, ContinueCode, StopToken};
pub use memwatch_common::{Error, Result};
pub use symbols::ModuleLoadHint;
pub use watcher::{classify_access, AccessKind, AccessLog};

#[cfg(windows)]
pub use launcher::ProcessLauncher;
#[cfg(windows)]
pub use session::WatchSession;
#[cfg(windows)]
pub use symbols::SymbolResolver;
#[cfg(windows)]
pub use watcher::MemoryWatcher;
