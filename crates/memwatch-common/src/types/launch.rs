//! Target launch configuration

use serde::{Deserialize, Serialize};

/// Configuration for launching the debuggee.
///
/// All flags default to false; the plain `new(exe)` form launches the
/// target in the current console with no handle inheritance and the debug
/// attachment restricted to the immediate process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Path to the executable
    pub executable: String,

    /// Command line arguments for the target
    pub args: Vec<String>,

    /// Working directory (None = inherit from the watcher)
    pub working_dir: Option<String>,

    /// Let the target inherit the watcher's inheritable handles
    pub inherit_handles: bool,

    /// Give the target its own console window
    pub new_console: bool,

    /// Create the primary thread suspended
    pub suspended: bool,

    /// Follow child processes with the debug attachment
    pub debug_children: bool,
}

impl LaunchConfig {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            inherit_handles: false,
            new_console: false,
            suspended: false,
            debug_children: false,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_new_console(mut self, enabled: bool) -> Self {
        self.new_console = enabled;
        self
    }

    pub fn with_debug_children(mut self, enabled: bool) -> Self {
        self.debug_children = enabled;
        self
    }
}
