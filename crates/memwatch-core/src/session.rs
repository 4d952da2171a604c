//! Watch session: launcher, resolver and watcher wired for one run
//!
//! Symbol resolution happens inside the first CreateProcess event handler,
//! after the image is mapped but before the target executes user code.
//! Resolving eagerly before the loop cannot work for a freshly launched
//! target, and resolving later would miss the initial accesses.

/// Context line wrapped around symbol errors before they surface.
pub fn symbol_resolution_context(symbol_name: &str, executable: &str) -> String {
    format!(
        "failed to resolve symbol \"{symbol_name}\" in {executable} \
         (is a PDB available next to the target, and is the variable a 4- or 8-byte integer?)"
    )
}

#[cfg(windows)]
mod os {
    use super::*;

    use memwatch_common::{
        ContinueDecision, DebugEvent, DebugEventKind, DebugEventSink, Error, LaunchConfig, Result,
    };
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Threading::{
        OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
    };

    use crate::launcher::{ProcessLauncher, StopToken};
    use crate::symbols::{ModuleLoadHint, SymbolResolver};
    use crate::watcher::{AccessLog, MemoryWatcher};

    /// Top-level glue: launches the target and runs the debug loop until
    /// it exits, returning the target's exit code.
    pub struct WatchSession {
        config: LaunchConfig,
        symbol_name: String,
    }

    impl WatchSession {
        pub fn new(config: LaunchConfig, symbol_name: impl Into<String>) -> Self {
            Self {
                config,
                symbol_name: symbol_name.into(),
            }
        }

        pub fn run(self) -> Result<u32> {
            let mut launcher = ProcessLauncher::new();
            launcher.launch(&self.config)?;

            let mut sink = BootstrapSink {
                pid: launcher.pid(),
                symbol_name: self.symbol_name,
                executable: self.config.executable.clone(),
                stop: launcher.stop_token(),
                watcher: None,
                _resolver: None,
                process: None,
                error: None,
            };

            let exit_code = launcher.run_debug_loop(&mut sink)?;

            if let Some(error) = sink.error.take() {
                return Err(error);
            }
            Ok(exit_code.unwrap_or(0))
        }
    }

    /// Query/vm-read handle to the target, owned by the session.
    struct OwnedProcessHandle(HANDLE);

    impl Drop for OwnedProcessHandle {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    /// Sink that intercepts the first CreateProcess event to resolve the
    /// symbol and construct the watcher, then forwards everything to it.
    ///
    /// Field order keeps the process handle alive past the watcher and
    /// resolver that borrow it.
    struct BootstrapSink {
        pid: u32,
        symbol_name: String,
        executable: String,
        stop: StopToken,
        watcher: Option<MemoryWatcher>,
        _resolver: Option<SymbolResolver>,
        process: Option<OwnedProcessHandle>,
        error: Option<Error>,
    }

    impl BootstrapSink {
        fn bootstrap(&mut self, event: &DebugEvent) -> Result<()> {
            let (image_base, image_path) = match &event.kind {
                DebugEventKind::CreateProcess {
                    image_base,
                    image_path,
                    ..
                } => (*image_base, image_path.clone()),
                _ => return Ok(()),
            };

            let context = || symbol_resolution_context(&self.symbol_name, &self.executable);

            let process = unsafe {
                OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, self.pid)
            }
            .map_err(|e| {
                Error::symbol(
                    context(),
                    memwatch_common::SymbolError::Init(format!("OpenProcess failed: {e}")),
                )
            })?;
            let process = OwnedProcessHandle(process);

            let mut hint = ModuleLoadHint::new(image_base);
            if let Some(path) = image_path {
                hint = hint.with_path(path);
            }

            let resolver = SymbolResolver::new(process.0, None, false, Some(&hint))
                .map_err(|e| Error::symbol(context(), e))?;
            let symbol = resolver
                .resolve(&self.symbol_name)
                .map_err(|e| Error::symbol(context(), e))?;

            tracing::info!(target: "memwatch_core::session", symbol = %symbol, "watching");

            let watcher = MemoryWatcher::new(process.0, symbol, AccessLog::stdout(), true)?;

            self.watcher = Some(watcher);
            self._resolver = Some(resolver);
            self.process = Some(process);
            Ok(())
        }
    }

    impl DebugEventSink for BootstrapSink {
        fn on_event(&mut self, event: &DebugEvent) -> ContinueDecision {
            if self.watcher.is_none() && self.error.is_none() {
                if let DebugEventKind::CreateProcess { .. } = event.kind {
                    if let Err(error) = self.bootstrap(event) {
                        self.error = Some(error);
                        self.stop.request_stop();
                        return ContinueDecision::Default;
                    }
                }
            }

            match self.watcher.as_mut() {
                Some(watcher) => watcher.on_event(event),
                None => ContinueDecision::Default,
            }
        }
    }
}

#[cfg(windows)]
pub use os::WatchSession;
