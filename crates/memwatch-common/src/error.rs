//! Error types for memwatch

use thiserror::Error;

/// Failures while creating the target process or driving its debug loop.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to create process: {0}")]
    CreateProcess(String),

    #[error("Process already launched with this launcher")]
    AlreadyLaunched,

    #[error("Debug loop started before launch")]
    NotLaunched,

    #[error("Debug wait failed: {0}")]
    DebugWait(String),
}

/// Failures while opening a symbol session or resolving a name.
#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("Null process handle")]
    NullProcessHandle,

    #[error("Symbol handler initialization failed: {0}")]
    Init(String),

    #[error("Module symbol load failed: {0}")]
    ModuleLoad(String),

    #[error("Symbol not found: {name}: {message}")]
    Lookup { name: String, message: String },

    #[error("Type size query failed for \"{name}\": {message}")]
    TypeInfo { name: String, message: String },

    #[error("The symbol \"{name}\" has a size of {size} bytes (outside the range [4..8])")]
    UnsupportedSize { name: String, size: u64 },
}

/// Failures while arming watchpoints or reading the watched value.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Null process handle")]
    NullProcessHandle,

    #[error("Watched value size must be 4 or 8 bytes, got {0}")]
    UnsupportedSize(u32),

    #[error("Thread context update failed for TID {tid}: {message}")]
    ThreadContext { tid: u32, message: String },

    #[error("Memory read of {size} bytes at {address:#x} failed: {message}")]
    MemoryRead {
        address: u64,
        size: u32,
        message: String,
    },
}

/// Top-level error surfaced by a watch session.
///
/// Symbol errors carry the context added by the session (symbol name and
/// target path) so a single stderr line tells the user what to fix.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{context}: {source}")]
    Symbol {
        context: String,
        #[source]
        source: SymbolError,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),
}

impl Error {
    /// Wrap a symbol error with session context.
    pub fn symbol(context: impl Into<String>, source: SymbolError) -> Self {
        Error::Symbol {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_error_display() {
        let err = ProcessError::CreateProcess("access denied".to_string());
        assert!(err.to_string().contains("access denied"));

        let err = ProcessError::AlreadyLaunched;
        assert!(err.to_string().contains("already launched"));

        let err = ProcessError::NotLaunched;
        assert!(err.to_string().contains("before launch"));
    }

    #[test]
    fn test_symbol_error_display() {
        let err = SymbolError::Lookup {
            name: "g_counter".to_string(),
            message: "element not found".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("g_counter"));
        assert!(msg.contains("element not found"));
    }

    #[test]
    fn test_symbol_unsupported_size_display() {
        let err = SymbolError::UnsupportedSize {
            name: "g_big".to_string(),
            size: 16,
        };
        let msg = err.to_string();
        assert!(msg.contains("g_big"));
        assert!(msg.contains("16"));
    }

    #[test]
    fn test_watch_error_display() {
        let err = WatchError::UnsupportedSize(2);
        assert!(err.to_string().contains("4 or 8"));

        let err = WatchError::MemoryRead {
            address: 0x140001000,
            size: 8,
            message: "partial copy".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x140001000"));
        assert!(msg.contains("partial copy"));
    }

    #[test]
    fn test_session_error_wraps_symbol_context() {
        let err = Error::symbol(
            "failed to resolve \"g_counter\" in C:\\app.exe",
            SymbolError::Lookup {
                name: "g_counter".to_string(),
                message: "not found".to_string(),
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("g_counter"));
        assert!(msg.contains("C:\\app.exe"));
        assert!(msg.contains("not found"));
    }

    #[test]
    fn test_error_from_process_error() {
        let err: Error = ProcessError::NotLaunched.into();
        assert!(matches!(err, Error::Process(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<u32> {
            Ok(123)
        }
        assert_eq!(returns_ok().unwrap(), 123);
    }
}
