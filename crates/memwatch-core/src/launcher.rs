//! Process launching and the debug event loop
//!
//! Creates the target with a debug attachment, pumps `WaitForDebugEvent`,
//! normalizes each OS record into a [`DebugEvent`] and maps the sink's
//! decision back into the continue code handed to the OS.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memwatch_common::{
    ContinueDecision, DebugEvent, DebugEventKind, LaunchConfig, EXCEPTION_CODE_BREAKPOINT,
    EXCEPTION_CODE_SINGLE_STEP,
};

#[cfg(windows)]
use memwatch_common::{DebugEventSink, ProcessError};

/// Final continuation reported to the OS for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueCode {
    /// "handled, continue execution"
    Handled,
    /// "exception propagated to target"
    NotHandled,
}

/// Map the sink's decision and the event kind to the final continue code.
///
/// Breakpoints and single-step exceptions are the debugger's own artifacts
/// and are swallowed by default; any other exception is reflected back so
/// the target's handlers run (or it crashes visibly).
pub fn resolve_continue_code(decision: ContinueDecision, event: &DebugEvent) -> ContinueCode {
    match decision {
        ContinueDecision::Continue => ContinueCode::Handled,
        ContinueDecision::NotHandled => ContinueCode::NotHandled,
        ContinueDecision::Default => match &event.kind {
            DebugEventKind::Exception { code, .. } => match *code {
                EXCEPTION_CODE_BREAKPOINT | EXCEPTION_CODE_SINGLE_STEP => ContinueCode::Handled,
                _ => ContinueCode::NotHandled,
            },
            _ => ContinueCode::Handled,
        },
    }
}

/// Cooperative cancellation flag for the debug loop.
///
/// Checked before each wait and again after each continued event; a stop
/// request never abandons an event that is already being handled.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Quote one argument for a Windows command line.
///
/// Backslashes are literal except in front of a quote (or the closing
/// quote), where each must be doubled; embedded quotes are escaped.
pub fn quote_arg(arg: &str) -> String {
    let needs_quotes = arg.is_empty() || arg.chars().any(|c| c == ' ' || c == '\t' || c == '"');
    if !needs_quotes {
        return arg.to_string();
    }

    let mut out = String::with_capacity(arg.len() + 8);
    out.push('"');
    let mut backslashes = 0usize;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                backslashes = 0;
                out.push('"');
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                backslashes = 0;
                out.push(ch);
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
    out
}

/// Build the full command line: quoted executable followed by quoted args.
pub fn build_command_line(config: &LaunchConfig) -> String {
    let mut cmd = quote_arg(&config.executable);
    for arg in &config.args {
        cmd.push(' ');
        cmd.push_str(&quote_arg(arg));
    }
    cmd
}

/// Decode a NUL-terminated narrow or wide string captured from the target.
pub fn decode_debuggee_string(bytes: &[u8], wide: bool) -> String {
    if wide {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        String::from_utf16_lossy(&units[..end])
    } else {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }
}

/// Strip the `\\?\` extended-length prefix from a path if present.
pub fn strip_extended_prefix(path: &str) -> &str {
    path.strip_prefix(r"\\?\").unwrap_or(path)
}

#[cfg(windows)]
mod os {
    use super::*;

    use std::ffi::c_void;
    use std::os::windows::ffi::OsStrExt;

    use windows::core::{PCWSTR, PWSTR};
    use windows::Win32::Foundation::{
        CloseHandle, DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, HANDLE,
    };
    use windows::Win32::Storage::FileSystem::{GetFinalPathNameByHandleW, FILE_NAME_NORMALIZED};
    use windows::Win32::System::Diagnostics::Debug::{
        ContinueDebugEvent, ReadProcessMemory, WaitForDebugEvent, CREATE_PROCESS_DEBUG_EVENT,
        CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT,
        EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT, OUTPUT_DEBUG_STRING_EVENT, RIP_EVENT,
        UNLOAD_DLL_DEBUG_EVENT,
    };
    use windows::Win32::System::Threading::{
        CreateProcessW, CREATE_NEW_CONSOLE, CREATE_SUSPENDED, DEBUG_ONLY_THIS_PROCESS,
        DEBUG_PROCESS, INFINITE, PROCESS_INFORMATION, STARTUPINFOW,
    };

    /// Upper bound for image names read out of the target.
    const MAX_REMOTE_STRING_CHARS: usize = 32 * 1024;

    /// Launches the target in debug mode and drives its event stream.
    ///
    /// Owns the process and primary thread handles for the process
    /// lifetime; both are released on drop.
    pub struct ProcessLauncher {
        process: HANDLE,
        thread: HANDLE,
        pid: u32,
        tid: u32,
        launched: bool,
        running: bool,
        stop: StopToken,
    }

    impl Default for ProcessLauncher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcessLauncher {
        pub fn new() -> Self {
            Self {
                process: HANDLE::default(),
                thread: HANDLE::default(),
                pid: 0,
                tid: 0,
                launched: false,
                running: false,
                stop: StopToken::default(),
            }
        }

        /// Spawn the target with a debug attachment.
        ///
        /// `debug_children` widens the attachment to child processes;
        /// otherwise it is restricted to the immediate target.
        pub fn launch(&mut self, config: &LaunchConfig) -> Result<(), ProcessError> {
            if self.launched {
                return Err(ProcessError::AlreadyLaunched);
            }

            let mut cmd_line_wide = to_wide(&build_command_line(config));
            let working_dir_wide: Option<Vec<u16>> =
                config.working_dir.as_ref().map(|dir| to_wide(dir));

            let mut creation_flags = if config.debug_children {
                DEBUG_PROCESS
            } else {
                DEBUG_ONLY_THIS_PROCESS
            };
            if config.new_console {
                creation_flags |= CREATE_NEW_CONSOLE;
            }
            if config.suspended {
                creation_flags |= CREATE_SUSPENDED;
            }

            unsafe {
                let startup_info = STARTUPINFOW {
                    cb: std::mem::size_of::<STARTUPINFOW>() as u32,
                    ..Default::default()
                };
                let mut process_info = PROCESS_INFORMATION::default();

                CreateProcessW(
                    None,
                    PWSTR(cmd_line_wide.as_mut_ptr()),
                    None,
                    None,
                    config.inherit_handles,
                    creation_flags,
                    None,
                    working_dir_wide
                        .as_ref()
                        .map(|v| PCWSTR(v.as_ptr()))
                        .unwrap_or(PCWSTR::null()),
                    &startup_info,
                    &mut process_info,
                )
                .map_err(|e| ProcessError::CreateProcess(e.to_string()))?;

                self.process = process_info.hProcess;
                self.thread = process_info.hThread;
                self.pid = process_info.dwProcessId;
                self.tid = process_info.dwThreadId;
            }

            self.launched = true;
            self.running = true;
            tracing::debug!(target: "memwatch_core::launcher", pid = self.pid, tid = self.tid, "target launched");
            Ok(())
        }

        /// Block on the debug event queue until the target exits or a stop
        /// is requested. Returns the target's exit code when the OS
        /// reported one.
        pub fn run_debug_loop(
            &mut self,
            sink: &mut dyn DebugEventSink,
        ) -> Result<Option<u32>, ProcessError> {
            if !self.launched {
                return Err(ProcessError::NotLaunched);
            }

            let mut exit_code = None;

            while !self.stop.is_stop_requested() {
                let mut raw = DEBUG_EVENT::default();
                unsafe { WaitForDebugEvent(&mut raw, INFINITE) }
                    .map_err(|e| ProcessError::DebugWait(e.to_string()))?;

                let event = self.normalize_event(&raw);
                let decision = sink.on_event(&event);
                let code = match resolve_continue_code(decision, &event) {
                    ContinueCode::Handled => DBG_CONTINUE,
                    ContinueCode::NotHandled => DBG_EXCEPTION_NOT_HANDLED,
                };
                unsafe {
                    let _ = ContinueDebugEvent(raw.dwProcessId, raw.dwThreadId, code);
                }

                if let DebugEventKind::ExitProcess { exit_code: ec } = event.kind {
                    exit_code = Some(ec);
                    self.running = false;
                    break;
                }
            }

            Ok(exit_code)
        }

        /// Ask the loop to exit before it waits for the next event.
        pub fn stop(&self) {
            self.stop.request_stop();
        }

        /// Clonable handle to the loop's stop flag.
        pub fn stop_token(&self) -> StopToken {
            self.stop.clone()
        }

        pub fn pid(&self) -> u32 {
            self.pid
        }

        pub fn is_running(&self) -> bool {
            self.running
        }

        /// Turn one OS debug record into the normalized event model.
        ///
        /// File handles the debug subsystem passes along are closed here
        /// after the image path has been extracted from them.
        fn normalize_event(&self, raw: &DEBUG_EVENT) -> DebugEvent {
            let code = raw.dwDebugEventCode;
            let kind = unsafe {
                if code == CREATE_PROCESS_DEBUG_EVENT {
                    let info = &raw.u.CreateProcessInfo;
                    let image_path =
                        resolve_image_path(self.process, info.hFile, info.lpImageName, info.fUnicode);
                    if !info.hFile.is_invalid() {
                        let _ = CloseHandle(info.hFile);
                    }
                    DebugEventKind::CreateProcess {
                        image_base: info.lpBaseOfImage as usize as u64,
                        entry_point: info.lpStartAddress.map_or(0, |f| f as usize as u64),
                        image_path,
                    }
                } else if code == EXIT_PROCESS_DEBUG_EVENT {
                    DebugEventKind::ExitProcess {
                        exit_code: raw.u.ExitProcess.dwExitCode,
                    }
                } else if code == CREATE_THREAD_DEBUG_EVENT {
                    DebugEventKind::CreateThread {
                        start_address: raw.u.CreateThread.lpStartAddress.map_or(0, |f| f as usize as u64),
                    }
                } else if code == EXIT_THREAD_DEBUG_EVENT {
                    DebugEventKind::ExitThread {
                        exit_code: raw.u.ExitThread.dwExitCode,
                    }
                } else if code == EXCEPTION_DEBUG_EVENT {
                    let info = &raw.u.Exception;
                    DebugEventKind::Exception {
                        code: info.ExceptionRecord.ExceptionCode.0 as u32,
                        address: info.ExceptionRecord.ExceptionAddress as usize as u64,
                        first_chance: info.dwFirstChance != 0,
                    }
                } else if code == LOAD_DLL_DEBUG_EVENT {
                    let info = &raw.u.LoadDll;
                    let path =
                        resolve_image_path(self.process, info.hFile, info.lpImageName, info.fUnicode);
                    if !info.hFile.is_invalid() {
                        let _ = CloseHandle(info.hFile);
                    }
                    DebugEventKind::LoadDll {
                        base: info.lpBaseOfDll as usize as u64,
                        path,
                    }
                } else if code == UNLOAD_DLL_DEBUG_EVENT {
                    DebugEventKind::UnloadDll {
                        base: raw.u.UnloadDll.lpBaseOfDll as usize as u64,
                    }
                } else if code == OUTPUT_DEBUG_STRING_EVENT {
                    let info = &raw.u.DebugString;
                    let message = read_remote_string(
                        self.process,
                        info.lpDebugStringData.0 as usize as u64,
                        info.fUnicode != 0,
                        info.nDebugStringLength as usize,
                    )
                    .unwrap_or_default();
                    DebugEventKind::OutputDebugString { message }
                } else if code == RIP_EVENT {
                    DebugEventKind::Rip {
                        error: raw.u.RipInfo.dwError,
                        kind: raw.u.RipInfo.dwType.0,
                    }
                } else {
                    // Unknown event code, surfaced with the raw code
                    DebugEventKind::Rip {
                        error: 0,
                        kind: code.0,
                    }
                }
            };

            DebugEvent {
                process_id: raw.dwProcessId,
                thread_id: raw.dwThreadId,
                kind,
            }
        }
    }

    impl Drop for ProcessLauncher {
        fn drop(&mut self) {
            unsafe {
                if !self.thread.is_invalid() {
                    let _ = CloseHandle(self.thread);
                }
                if !self.process.is_invalid() {
                    let _ = CloseHandle(self.process);
                }
            }
        }
    }

    fn to_wide(s: &str) -> Vec<u16> {
        std::ffi::OsStr::new(s)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    /// Best-effort image path for CreateProcess/LoadDll events.
    ///
    /// Prefers the final path of the file handle the OS supplied, falling
    /// back to the remote image-name pointer (which points at a pointer in
    /// the target's address space).
    fn resolve_image_path(
        process: HANDLE,
        file: HANDLE,
        remote_name: *mut c_void,
        unicode: u16,
    ) -> Option<String> {
        if !file.is_invalid() {
            let mut buf = [0u16; 1024];
            let n = unsafe { GetFinalPathNameByHandleW(file, &mut buf, FILE_NAME_NORMALIZED) }
                as usize;
            if n > 0 && n < buf.len() {
                let path = String::from_utf16_lossy(&buf[..n]);
                return Some(strip_extended_prefix(&path).to_string());
            }
        }

        if remote_name.is_null() {
            return None;
        }
        let mut string_ptr = 0u64;
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                process,
                remote_name as *const c_void,
                &mut string_ptr as *mut u64 as *mut c_void,
                std::mem::size_of::<u64>(),
                Some(&mut read),
            )
        };
        if ok.is_err() || read != std::mem::size_of::<u64>() || string_ptr == 0 {
            return None;
        }
        read_remote_string(process, string_ptr, unicode != 0, MAX_REMOTE_STRING_CHARS)
    }

    /// Read a NUL-terminated string out of the target, `max_chars` as a
    /// best-effort upper bound. Chunks are kept small so a string near the
    /// end of a mapped region still comes back whole.
    fn read_remote_string(
        process: HANDLE,
        address: u64,
        wide: bool,
        max_chars: usize,
    ) -> Option<String> {
        if address == 0 || max_chars == 0 {
            return None;
        }

        let char_size = if wide { 2 } else { 1 };
        let limit = max_chars.min(MAX_REMOTE_STRING_CHARS) * char_size;
        let mut bytes: Vec<u8> = Vec::new();
        let mut offset = 0usize;

        while offset < limit {
            let chunk_len = 64usize.min(limit - offset);
            let mut chunk = vec![0u8; chunk_len];
            let mut read = 0usize;
            let ok = unsafe {
                ReadProcessMemory(
                    process,
                    (address as usize + offset) as *const c_void,
                    chunk.as_mut_ptr() as *mut c_void,
                    chunk_len,
                    Some(&mut read),
                )
            };
            if ok.is_err() || read == 0 {
                break;
            }
            chunk.truncate(read);
            let has_terminator = if wide {
                chunk.chunks_exact(2).any(|c| c[0] == 0 && c[1] == 0)
            } else {
                chunk.contains(&0)
            };
            bytes.extend_from_slice(&chunk);
            offset += read;
            if has_terminator || read < chunk_len {
                break;
            }
        }

        if bytes.is_empty() {
            return None;
        }
        Some(decode_debuggee_string(&bytes, wide))
    }
}

#[cfg(windows)]
pub use os::ProcessLauncher;
