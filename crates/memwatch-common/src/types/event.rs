//! Debug event model shared between the launcher and event sinks

use serde::{Deserialize, Serialize};

/// Exception code raised by the OS for an initial or software breakpoint.
pub const EXCEPTION_CODE_BREAKPOINT: u32 = 0x8000_0003;
/// Exception code raised after a hardware watchpoint fires.
pub const EXCEPTION_CODE_SINGLE_STEP: u32 = 0x8000_0004;

/// Normalized debug event delivered to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugEvent {
    pub process_id: u32,
    pub thread_id: u32,
    pub kind: DebugEventKind,
}

/// Kind tag plus kind-specific payload of a debug event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DebugEventKind {
    CreateProcess {
        image_base: u64,
        entry_point: u64,
        /// Best-effort resolved image path (may be absent)
        image_path: Option<String>,
    },
    ExitProcess {
        exit_code: u32,
    },
    CreateThread {
        start_address: u64,
    },
    ExitThread {
        exit_code: u32,
    },
    Exception {
        code: u32,
        address: u64,
        first_chance: bool,
    },
    LoadDll {
        base: u64,
        /// Best-effort resolved module path (may be absent)
        path: Option<String>,
    },
    UnloadDll {
        base: u64,
    },
    OutputDebugString {
        message: String,
    },
    Rip {
        error: u32,
        kind: u32,
    },
}

impl DebugEvent {
    /// Shorthand for an exception event, the only kind sinks build often.
    pub fn exception(
        process_id: u32,
        thread_id: u32,
        code: u32,
        address: u64,
        first_chance: bool,
    ) -> Self {
        Self {
            process_id,
            thread_id,
            kind: DebugEventKind::Exception {
                code,
                address,
                first_chance,
            },
        }
    }
}

/// What the sink asks the loop to do after an event.
///
/// `Default` lets the launcher apply its policy (swallow breakpoints and
/// single-steps, reflect other exceptions back to the target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContinueDecision {
    #[default]
    Default,
    /// Force "handled, continue execution"
    Continue,
    /// Force "exception propagated to target"
    NotHandled,
}

/// Event sink driven by the debug loop, one call per event.
pub trait DebugEventSink {
    fn on_event(&mut self, event: &DebugEvent) -> ContinueDecision;
}
