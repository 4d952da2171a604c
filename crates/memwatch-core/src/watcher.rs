//! Per-thread hardware watchpoints and access classification
//!
//! The watcher is the debug loop's event sink. It arms debug-register
//! slot 0 on every thread of the target, and when the CPU delivers a
//! single-step exception for an access it re-reads the watched value and
//! classifies the access against the last observation: changed means
//! write, unchanged means read.

use std::io::Write;

use memwatch_common::WatchError;

/// DR7 length-field encoding for the supported widths.
pub fn len_encoding_for_size(size: u32) -> Result<u64, WatchError> {
    match size {
        4 => Ok(0b11),
        8 => Ok(0b10),
        _ => Err(WatchError::UnsupportedSize(size)),
    }
}

/// Mask selecting the low `size` bytes of a value.
pub fn mask_for_size(size: u32) -> Result<u64, WatchError> {
    match size {
        4 => Ok(0xFFFF_FFFF),
        8 => Ok(u64::MAX),
        _ => Err(WatchError::UnsupportedSize(size)),
    }
}

/// Interpret a raw 8-byte buffer as a little-endian unsigned integer of
/// the given width.
pub fn decode_value(raw: [u8; 8], size: u32) -> Result<u64, WatchError> {
    Ok(u64::from_le_bytes(raw) & mask_for_size(size)?)
}

/// Outcome of comparing the current value against the last observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write { old: u64 },
}

/// Classify one observed value. No previous observation or an unchanged
/// value reads; anything else writes. Spurious single-steps therefore
/// surface as no-op reads.
pub fn classify_access(last: Option<u64>, current: u64) -> AccessKind {
    match last {
        Some(old) if old != current => AccessKind::Write { old },
        _ => AccessKind::Read,
    }
}

/// Destination for access lines, one line per classified access.
///
/// This is the only thing the tool writes to stdout; diagnostics travel
/// through `tracing` to stderr.
pub struct AccessLog {
    out: Box<dyn Write + Send>,
}

impl AccessLog {
    pub fn stdout() -> Self {
        Self {
            out: Box::new(std::io::stdout()),
        }
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    pub fn log_read(&mut self, symbol: &str, value: u64) {
        let _ = writeln!(self.out, "{} read {}", symbol, value);
    }

    pub fn log_write(&mut self, symbol: &str, old_value: u64, new_value: u64) {
        let _ = writeln!(self.out, "{} write {} -> {}", symbol, old_value, new_value);
    }
}

#[cfg(windows)]
mod os {
    use super::*;

    use std::collections::HashSet;
    use std::ffi::c_void;

    use memwatch_common::{
        ContinueDecision, DebugEvent, DebugEventKind, DebugEventSink, ResolvedSymbol,
        EXCEPTION_CODE_SINGLE_STEP,
    };
    use windows::Win32::Foundation::HANDLE;
    #[cfg(target_arch = "x86_64")]
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
    #[cfg(target_arch = "x86_64")]
    use windows::Win32::System::Diagnostics::Debug::{
        GetThreadContext, SetThreadContext, CONTEXT, CONTEXT_DEBUG_REGISTERS_AMD64,
    };
    #[cfg(target_arch = "x86_64")]
    use windows::Win32::System::Threading::{
        OpenThread, THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION, THREAD_SET_CONTEXT,
        THREAD_SUSPEND_RESUME,
    };

    /// Watches one resolved symbol through debug-register slot 0.
    ///
    /// Borrows the process handle; the owner must keep it alive for as
    /// long as events are delivered.
    pub struct MemoryWatcher {
        process: HANDLE,
        symbol: ResolvedSymbol,
        log: AccessLog,
        arm_hardware: bool,
        last_value: Option<u64>,
        armed_threads: HashSet<u32>,
    }

    impl MemoryWatcher {
        /// `arm_hardware = false` turns arming into pure bookkeeping, for
        /// tests that drive synthetic events.
        pub fn new(
            process: HANDLE,
            symbol: ResolvedSymbol,
            log: AccessLog,
            arm_hardware: bool,
        ) -> Result<Self, WatchError> {
            if process == HANDLE::default() {
                return Err(WatchError::NullProcessHandle);
            }
            if !matches!(symbol.size, 4 | 8) {
                return Err(WatchError::UnsupportedSize(symbol.size));
            }

            Ok(Self {
                process,
                symbol,
                log,
                arm_hardware,
                last_value: None,
                armed_threads: HashSet::new(),
            })
        }

        /// Thread ids currently armed (or merely seen, in no-arm mode).
        pub fn armed_threads(&self) -> &HashSet<u32> {
            &self.armed_threads
        }

        pub fn last_value(&self) -> Option<u64> {
            self.last_value
        }

        /// Program DR0/DR7 on one thread: slot-0 address, local enable,
        /// break on read and write, length per symbol size. Prior slot-0
        /// configuration and stale DR6 status bits are cleared first.
        fn arm_thread(&mut self, tid: u32) -> Result<(), WatchError> {
            if !self.arm_hardware {
                self.armed_threads.insert(tid);
                return Ok(());
            }
            if self.armed_threads.contains(&tid) {
                return Ok(());
            }

            self.program_debug_registers(tid)?;
            self.armed_threads.insert(tid);
            tracing::debug!(target: "memwatch_core::watcher", tid, address = format!("{:#x}", self.symbol.address), "watchpoint armed");
            Ok(())
        }

        #[cfg(target_arch = "x86_64")]
        fn program_debug_registers(&self, tid: u32) -> Result<(), WatchError> {
            let len = len_encoding_for_size(self.symbol.size)?;

            unsafe {
                let thread = OpenThread(
                    THREAD_GET_CONTEXT
                        | THREAD_SET_CONTEXT
                        | THREAD_QUERY_INFORMATION
                        | THREAD_SUSPEND_RESUME,
                    false,
                    tid,
                )
                .map_err(|e| WatchError::ThreadContext {
                    tid,
                    message: format!("OpenThread failed: {e}"),
                })?;
                let thread = OwnedThreadHandle(thread);

                let mut context: CONTEXT = std::mem::zeroed();
                context.ContextFlags = CONTEXT_DEBUG_REGISTERS_AMD64;

                GetThreadContext(thread.0, &mut context).map_err(|e| {
                    WatchError::ThreadContext {
                        tid,
                        message: format!("GetThreadContext failed: {e}"),
                    }
                })?;

                context.Dr0 = self.symbol.address;

                let mut dr7 = context.Dr7;
                // Clear previous slot-0 config: L0, RW0, LEN0
                dr7 &= !(1u64 << 0);
                dr7 &= !(0b11u64 << 16);
                dr7 &= !(0b11u64 << 18);
                // L0 local enable, RW0 = 11b (read or write), LEN0 per size
                dr7 |= 1u64 << 0;
                dr7 |= 0b11u64 << 16;
                dr7 |= len << 18;
                context.Dr7 = dr7;

                // Drop stale watchpoint status bits
                context.Dr6 = 0;

                SetThreadContext(thread.0, &context).map_err(|e| WatchError::ThreadContext {
                    tid,
                    message: format!("SetThreadContext failed: {e}"),
                })?;
            }

            Ok(())
        }

        #[cfg(not(target_arch = "x86_64"))]
        fn program_debug_registers(&self, tid: u32) -> Result<(), WatchError> {
            Err(WatchError::ThreadContext {
                tid,
                message: "hardware watchpoints require an x86_64 target".to_string(),
            })
        }

        /// Cross-address-space read of exactly `size` bytes into the low
        /// bytes of an 8-byte zeroed buffer, decoded little-endian.
        fn read_value(&self) -> Result<u64, WatchError> {
            let mut raw = [0u8; 8];
            let mut read = 0usize;
            let size = self.symbol.size as usize;

            unsafe {
                ReadProcessMemory(
                    self.process,
                    self.symbol.address as usize as *const c_void,
                    raw.as_mut_ptr() as *mut c_void,
                    size,
                    Some(&mut read),
                )
            }
            .map_err(|e| WatchError::MemoryRead {
                address: self.symbol.address,
                size: self.symbol.size,
                message: e.to_string(),
            })?;

            if read != size {
                return Err(WatchError::MemoryRead {
                    address: self.symbol.address,
                    size: self.symbol.size,
                    message: format!("short read: {read} of {size} bytes"),
                });
            }

            decode_value(raw, self.symbol.size)
        }

        fn handle_single_step(&mut self, tid: u32) -> ContinueDecision {
            let current = match self.read_value() {
                Ok(value) => value,
                Err(err) => {
                    // Do not misattribute the step; reflect it back
                    tracing::debug!(target: "memwatch_core::watcher", tid, error = %err, "read failed during single-step");
                    return ContinueDecision::NotHandled;
                }
            };

            match classify_access(self.last_value, current) {
                AccessKind::Write { old } => {
                    self.log.log_write(&self.symbol.name, old, current);
                }
                AccessKind::Read => {
                    self.log.log_read(&self.symbol.name, current);
                }
            }
            self.last_value = Some(current);

            // DR state normally persists, but some tools refresh it;
            // re-arm if this thread dropped out of the armed set.
            if !self.armed_threads.contains(&tid) {
                if let Err(err) = self.arm_thread(tid) {
                    tracing::trace!(target: "memwatch_core::watcher", tid, error = %err, "re-arm failed");
                }
            }

            ContinueDecision::Default
        }
    }

    impl DebugEventSink for MemoryWatcher {
        fn on_event(&mut self, event: &DebugEvent) -> ContinueDecision {
            match &event.kind {
                DebugEventKind::CreateProcess { .. } => {
                    // Some targets deliver this before the primary thread
                    // can be opened; arming failures are not fatal here.
                    if let Err(err) = self.arm_thread(event.thread_id) {
                        tracing::trace!(target: "memwatch_core::watcher", tid = event.thread_id, error = %err, "arming on process creation failed");
                    }
                    // Baseline observation, no log line
                    self.last_value = self.read_value().ok();
                    ContinueDecision::Default
                }
                DebugEventKind::CreateThread { .. } => {
                    if let Err(err) = self.arm_thread(event.thread_id) {
                        tracing::trace!(target: "memwatch_core::watcher", tid = event.thread_id, error = %err, "arming on thread creation failed");
                    }
                    ContinueDecision::Default
                }
                DebugEventKind::ExitThread { .. } => {
                    self.armed_threads.remove(&event.thread_id);
                    ContinueDecision::Default
                }
                DebugEventKind::Exception { code, .. } => {
                    if *code == EXCEPTION_CODE_SINGLE_STEP {
                        self.handle_single_step(event.thread_id)
                    } else {
                        ContinueDecision::Default
                    }
                }
                _ => ContinueDecision::Default,
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    struct OwnedThreadHandle(HANDLE);

    #[cfg(target_arch = "x86_64")]
    impl Drop for OwnedThreadHandle {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

#[cfg(windows)]
pub use os::MemoryWatcher;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_encoding_for_size() {
        assert_eq!(len_encoding_for_size(4).unwrap(), 0b11);
        assert_eq!(len_encoding_for_size(8).unwrap(), 0b10);
        for bad in [0, 1, 2, 3, 5, 6, 7, 16] {
            assert!(len_encoding_for_size(bad).is_err());
        }
    }

    #[test]
    fn test_mask_for_size() {
        assert_eq!(mask_for_size(4).unwrap(), 0xFFFF_FFFF);
        assert_eq!(mask_for_size(8).unwrap(), u64::MAX);
        assert!(mask_for_size(2).is_err());
    }

    #[test]
    fn test_decode_value_little_endian() {
        let raw = [0x05, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_value(raw, 8).unwrap(), 5);
        assert_eq!(decode_value(raw, 4).unwrap(), 5);

        let raw = 0xDEAD_BEEF_1234_5678u64.to_le_bytes();
        assert_eq!(decode_value(raw, 8).unwrap(), 0xDEAD_BEEF_1234_5678);
        assert_eq!(decode_value(raw, 4).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_decode_value_round_trip_boundaries() {
        for value in [0u64, 1, 0xFFFF_FFFF, 0xFFFF_FFFF_FFFF_FFFF] {
            let raw = value.to_le_bytes();
            assert_eq!(decode_value(raw, 8).unwrap(), value);
        }
        for value in [0u32, 1, u32::MAX] {
            let raw = (value as u64).to_le_bytes();
            assert_eq!(decode_value(raw, 4).unwrap(), value as u64);
        }
    }

    #[test]
    fn test_classify_access() {
        assert_eq!(classify_access(None, 10), AccessKind::Read);
        assert_eq!(classify_access(Some(10), 10), AccessKind::Read);
        assert_eq!(
            classify_access(Some(10), 11),
            AccessKind::Write { old: 10 }
        );
        assert_eq!(classify_access(Some(0), 5), AccessKind::Write { old: 0 });
    }

    #[test]
    fn test_access_log_format() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone)]
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let mut log = AccessLog::new(Box::new(buf.clone()));
        log.log_read("sym64", 5);
        log.log_write("sym64", 5, 7);

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "sym64 read 5\nsym64 write 5 -> 7\n");
    }

    #[cfg(windows)]
    mod windows_tests {
        use super::super::*;
        use memwatch_common::{
            ContinueDecision, DebugEvent, DebugEventKind, DebugEventSink, ResolvedSymbol,
            WatchError, EXCEPTION_CODE_SINGLE_STEP,
        };
        use std::io::Write;
        use std::sync::{Arc, Mutex};
        use windows::Win32::Foundation::HANDLE;
        use windows::Win32::System::Threading::{
            GetCurrentProcess, GetCurrentProcessId, GetCurrentThreadId,
        };

        #[derive(Clone)]
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl SharedBuf {
            fn new() -> Self {
                Self(Arc::new(Mutex::new(Vec::new())))
            }
            fn contents(&self) -> String {
                String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
            }
        }
        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        fn symbol(address: u64, size: u32, name: &str) -> ResolvedSymbol {
            ResolvedSymbol {
                name: name.to_string(),
                module_base: 0,
                address,
                size,
            }
        }

        fn single_step() -> DebugEvent {
            DebugEvent::exception(
                unsafe { GetCurrentProcessId() },
                unsafe { GetCurrentThreadId() },
                EXCEPTION_CODE_SINGLE_STEP,
                0,
                true,
            )
        }

        fn create_process_event() -> DebugEvent {
            DebugEvent {
                process_id: unsafe { GetCurrentProcessId() },
                thread_id: unsafe { GetCurrentThreadId() },
                kind: DebugEventKind::CreateProcess {
                    image_base: 0,
                    entry_point: 0,
                    image_path: None,
                },
            }
        }

        fn thread_event(tid: u32, exit: bool) -> DebugEvent {
            DebugEvent {
                process_id: unsafe { GetCurrentProcessId() },
                thread_id: tid,
                kind: if exit {
                    DebugEventKind::ExitThread { exit_code: 0 }
                } else {
                    DebugEventKind::CreateThread { start_address: 0 }
                },
            }
        }

        // Watched storage with stable addresses inside this test process.
        static mut WATCH64: u64 = 0;
        static mut WATCH32: u32 = 0;

        #[test]
        fn test_classifies_read_and_write_64() {
            let addr = unsafe { std::ptr::addr_of!(WATCH64) } as u64;
            unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!(WATCH64), 0) };

            let buf = SharedBuf::new();
            let mut watcher = MemoryWatcher::new(
                unsafe { GetCurrentProcess() },
                symbol(addr, 8, "sym64"),
                AccessLog::new(Box::new(buf.clone())),
                false,
            )
            .unwrap();

            // No previous value: read
            assert_eq!(watcher.on_event(&single_step()), ContinueDecision::Default);
            // Changed: write
            unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!(WATCH64), 5) };
            assert_eq!(watcher.on_event(&single_step()), ContinueDecision::Default);
            // Unchanged: read
            assert_eq!(watcher.on_event(&single_step()), ContinueDecision::Default);

            assert_eq!(
                buf.contents(),
                "sym64 read 0\nsym64 write 0 -> 5\nsym64 read 5\n"
            );
        }

        #[test]
        fn test_classifies_read_and_write_32() {
            let addr = unsafe { std::ptr::addr_of!(WATCH32) } as u64;
            unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!(WATCH32), 10) };

            let buf = SharedBuf::new();
            let mut watcher = MemoryWatcher::new(
                unsafe { GetCurrentProcess() },
                symbol(addr, 4, "sym32"),
                AccessLog::new(Box::new(buf.clone())),
                false,
            )
            .unwrap();

            watcher.on_event(&single_step());
            unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!(WATCH32), 11) };
            watcher.on_event(&single_step());
            watcher.on_event(&single_step());

            assert_eq!(
                buf.contents(),
                "sym32 read 10\nsym32 write 10 -> 11\nsym32 read 11\n"
            );
        }

        #[test]
        fn test_create_process_primes_baseline_without_log() {
            static mut BASELINE: u64 = 0;
            let addr = unsafe { std::ptr::addr_of!(BASELINE) } as u64;
            unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!(BASELINE), 42) };

            let buf = SharedBuf::new();
            let mut watcher = MemoryWatcher::new(
                unsafe { GetCurrentProcess() },
                symbol(addr, 8, "sym"),
                AccessLog::new(Box::new(buf.clone())),
                false,
            )
            .unwrap();

            watcher.on_event(&create_process_event());
            assert_eq!(watcher.last_value(), Some(42));
            assert_eq!(buf.contents(), "");

            unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!(BASELINE), 43) };
            watcher.on_event(&single_step());
            assert_eq!(buf.contents(), "sym write 42 -> 43\n");
        }

        #[test]
        fn test_invalid_address_returns_not_handled_without_log() {
            let buf = SharedBuf::new();
            let mut watcher = MemoryWatcher::new(
                unsafe { GetCurrentProcess() },
                symbol(0, 8, "bad"),
                AccessLog::new(Box::new(buf.clone())),
                false,
            )
            .unwrap();

            assert_eq!(
                watcher.on_event(&single_step()),
                ContinueDecision::NotHandled
            );
            assert_eq!(buf.contents(), "");
        }

        #[test]
        fn test_rejects_unsupported_sizes() {
            for bad in [0u32, 1, 2, 3, 5, 6, 7, 16] {
                let result = MemoryWatcher::new(
                    unsafe { GetCurrentProcess() },
                    symbol(0x1000, bad, "g"),
                    AccessLog::new(Box::new(Vec::new())),
                    false,
                );
                assert!(
                    matches!(result, Err(WatchError::UnsupportedSize(size)) if size == bad),
                    "size {bad} must be rejected"
                );
            }
        }

        #[test]
        fn test_rejects_null_process_handle() {
            let result = MemoryWatcher::new(
                HANDLE::default(),
                symbol(0x1000, 8, "g"),
                AccessLog::new(Box::new(Vec::new())),
                false,
            );
            assert!(matches!(result, Err(WatchError::NullProcessHandle)));
        }

        #[test]
        fn test_thread_lifecycle_updates_armed_set() {
            let addr = unsafe { std::ptr::addr_of!(WATCH64) } as u64;
            let mut watcher = MemoryWatcher::new(
                unsafe { GetCurrentProcess() },
                symbol(addr, 8, "sym"),
                AccessLog::new(Box::new(Vec::new())),
                false,
            )
            .unwrap();

            watcher.on_event(&thread_event(101, false));
            watcher.on_event(&thread_event(102, false));
            assert!(watcher.armed_threads().contains(&101));
            assert!(watcher.armed_threads().contains(&102));

            watcher.on_event(&thread_event(101, true));
            assert!(!watcher.armed_threads().contains(&101));
            assert!(watcher.armed_threads().contains(&102));
        }

        #[test]
        fn test_single_step_rearms_unseen_thread() {
            let addr = unsafe { std::ptr::addr_of!(WATCH64) } as u64;
            let mut watcher = MemoryWatcher::new(
                unsafe { GetCurrentProcess() },
                symbol(addr, 8, "sym"),
                AccessLog::new(Box::new(Vec::new())),
                false,
            )
            .unwrap();

            let tid = unsafe { GetCurrentThreadId() };
            assert!(!watcher.armed_threads().contains(&tid));
            watcher.on_event(&single_step());
            assert!(watcher.armed_threads().contains(&tid));
        }
    }
}
