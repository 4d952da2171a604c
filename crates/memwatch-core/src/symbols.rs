//! Symbol resolution via DbgHelp
//!
//! Opens a symbol session against the target's address space and turns a
//! textual name into an address with a trustworthy byte width. The size
//! comes from the symbol's type information; the size field of the symbol
//! record itself is unreliable for globals.

use memwatch_common::SymbolError;

/// Main-module hint for a non-invading symbol session.
///
/// Carries what the first CreateProcess debug event knows about the image;
/// `image_size` may be 0, in which case the symbol engine sizes the module
/// from its headers.
#[derive(Debug, Clone)]
pub struct ModuleLoadHint {
    pub image_base: u64,
    pub image_size: u32,
    pub image_path: Option<String>,
}

impl ModuleLoadHint {
    pub fn new(image_base: u64) -> Self {
        Self {
            image_base,
            image_size: 0,
            image_path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.image_path = Some(path.into());
        self
    }
}

#[cfg(windows)]
mod os {
    use super::*;

    use std::ffi::c_void;
    use std::os::windows::ffi::OsStrExt;

    use memwatch_common::ResolvedSymbol;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Diagnostics::Debug::{
        SymCleanup, SymFromNameW, SymGetTypeInfo, SymInitializeW, SymLoadModuleExW,
        SymSetOptions, SYMBOL_INFOW, SYMOPT_DEFERRED_LOADS, SYMOPT_LOAD_LINES, SYMOPT_UNDNAME,
        SYM_LOAD_FLAGS, TI_GET_LENGTH,
    };
    use windows::Win32::System::ProcessStatus::{
        EnumProcessModulesEx, GetModuleFileNameExW, GetModuleInformation, LIST_MODULES_ALL,
        MODULEINFO,
    };

    /// Longest symbol name the lookup buffer accommodates.
    const MAX_SYMBOL_NAME_LEN: u32 = 1024;

    /// Symbol session scoped to this resolver's lifetime.
    ///
    /// The underlying symbol library is stateful and not thread-safe; the
    /// engine runs it from the single debug-loop thread only. The session
    /// is released on drop on every exit path.
    pub struct SymbolResolver {
        process: HANDLE,
    }

    impl SymbolResolver {
        /// Open a symbol session against `process`.
        ///
        /// With `invade` set, every module currently mapped in the target
        /// is indexed eagerly. Otherwise the caller's hint is loaded, or,
        /// lacking one, the first module of the target's current module
        /// list.
        pub fn new(
            process: HANDLE,
            search_path: Option<&str>,
            invade: bool,
            hint: Option<&ModuleLoadHint>,
        ) -> Result<Self, SymbolError> {
            if process == HANDLE::default() {
                return Err(SymbolError::NullProcessHandle);
            }

            let search_path_wide: Option<Vec<u16>> = search_path.map(to_wide);

            unsafe {
                SymSetOptions(SYMOPT_UNDNAME | SYMOPT_DEFERRED_LOADS | SYMOPT_LOAD_LINES);

                SymInitializeW(
                    process,
                    search_path_wide
                        .as_ref()
                        .map(|v| PCWSTR(v.as_ptr()))
                        .unwrap_or(PCWSTR::null()),
                    invade,
                )
                .map_err(|e| SymbolError::Init(e.to_string()))?;
            }

            // Session is open from here on; drop releases it if module
            // loading below fails.
            let resolver = Self { process };

            if !invade {
                match hint {
                    Some(hint) if hint.image_base != 0 => resolver.load_hinted_module(hint)?,
                    _ => resolver.load_first_module()?,
                }
            }

            tracing::debug!(target: "memwatch_core::symbols", invade, "symbol session opened");
            Ok(resolver)
        }

        /// Resolve a symbol name to an address and type size.
        ///
        /// Accepts bare names and module-qualified `module!name` forms.
        pub fn resolve(&self, name: &str) -> Result<ResolvedSymbol, SymbolError> {
            let buffer_len =
                std::mem::size_of::<SYMBOL_INFOW>() + (MAX_SYMBOL_NAME_LEN as usize) * 2;
            let mut buffer = vec![0u8; buffer_len];
            let info = buffer.as_mut_ptr() as *mut SYMBOL_INFOW;

            let name_wide = to_wide(name);

            unsafe {
                (*info).SizeOfStruct = std::mem::size_of::<SYMBOL_INFOW>() as u32;
                (*info).MaxNameLen = MAX_SYMBOL_NAME_LEN;

                SymFromNameW(self.process, PCWSTR(name_wide.as_ptr()), info).map_err(|e| {
                    SymbolError::Lookup {
                        name: name.to_string(),
                        message: e.to_string(),
                    }
                })?;

                let mut length = 0u64;
                SymGetTypeInfo(
                    self.process,
                    (*info).ModBase,
                    (*info).TypeIndex,
                    TI_GET_LENGTH,
                    &mut length as *mut u64 as *mut c_void,
                )
                .map_err(|e| SymbolError::TypeInfo {
                    name: name.to_string(),
                    message: e.to_string(),
                })?;

                if !(4..=8).contains(&length) {
                    return Err(SymbolError::UnsupportedSize {
                        name: name.to_string(),
                        size: length,
                    });
                }

                let name_len = ((*info).NameLen as usize).min(MAX_SYMBOL_NAME_LEN as usize);
                let name_units =
                    std::slice::from_raw_parts((*info).Name.as_ptr(), name_len);
                let resolved_name = String::from_utf16_lossy(name_units);

                let symbol = ResolvedSymbol {
                    name: resolved_name,
                    module_base: (*info).ModBase,
                    address: (*info).Address,
                    size: length as u32,
                };

                tracing::debug!(
                    target: "memwatch_core::symbols",
                    name = %symbol.name,
                    address = format!("{:#x}", symbol.address),
                    size = symbol.size,
                    module = %symbol.module_base_hex(),
                    "symbol resolved"
                );
                Ok(symbol)
            }
        }

        fn load_hinted_module(&self, hint: &ModuleLoadHint) -> Result<(), SymbolError> {
            let path_wide: Option<Vec<u16>> = hint.image_path.as_deref().map(to_wide);

            let base = unsafe {
                SymLoadModuleExW(
                    self.process,
                    HANDLE::default(),
                    path_wide
                        .as_ref()
                        .map(|v| PCWSTR(v.as_ptr()))
                        .unwrap_or(PCWSTR::null()),
                    PCWSTR::null(),
                    hint.image_base,
                    hint.image_size,
                    None,
                    SYM_LOAD_FLAGS(0),
                )
            };
            if base == 0 {
                return Err(SymbolError::ModuleLoad(
                    windows::core::Error::from_win32().to_string(),
                ));
            }
            Ok(())
        }

        /// Enumerate the target's modules and load symbols for the first
        /// one, which is the main image for a freshly launched process.
        fn load_first_module(&self) -> Result<(), SymbolError> {
            unsafe {
                let mut needed = 0u32;
                EnumProcessModulesEx(self.process, std::ptr::null_mut(), 0, &mut needed, LIST_MODULES_ALL)
                    .map_err(|e| SymbolError::ModuleLoad(format!("module enumeration failed: {e}")))?;

                let count = (needed as usize) / std::mem::size_of::<windows::Win32::Foundation::HMODULE>();
                if count == 0 {
                    return Err(SymbolError::ModuleLoad(
                        "target reported no loaded modules".to_string(),
                    ));
                }

                let mut modules =
                    vec![windows::Win32::Foundation::HMODULE::default(); count];
                EnumProcessModulesEx(
                    self.process,
                    modules.as_mut_ptr(),
                    needed,
                    &mut needed,
                    LIST_MODULES_ALL,
                )
                .map_err(|e| SymbolError::ModuleLoad(format!("module enumeration failed: {e}")))?;

                let main_module = modules[0];

                let mut path_buf = [0u16; 1024];
                let path_len =
                    GetModuleFileNameExW(self.process, main_module, &mut path_buf) as usize;
                if path_len == 0 {
                    return Err(SymbolError::ModuleLoad(
                        windows::core::Error::from_win32().to_string(),
                    ));
                }

                let mut module_info = MODULEINFO::default();
                GetModuleInformation(
                    self.process,
                    main_module,
                    &mut module_info,
                    std::mem::size_of::<MODULEINFO>() as u32,
                )
                .map_err(|e| SymbolError::ModuleLoad(format!("module query failed: {e}")))?;

                let base = SymLoadModuleExW(
                    self.process,
                    HANDLE::default(),
                    PCWSTR(path_buf.as_ptr()),
                    PCWSTR::null(),
                    module_info.lpBaseOfDll as usize as u64,
                    module_info.SizeOfImage,
                    None,
                    SYM_LOAD_FLAGS(0),
                );
                if base == 0 {
                    return Err(SymbolError::ModuleLoad(
                        windows::core::Error::from_win32().to_string(),
                    ));
                }
            }
            Ok(())
        }
    }

    impl Drop for SymbolResolver {
        fn drop(&mut self) {
            unsafe {
                let _ = SymCleanup(self.process);
            }
        }
    }

    fn to_wide(s: &str) -> Vec<u16> {
        std::ffi::OsStr::new(s)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }
}

#[cfg(windows)]
pub use os::SymbolResolver;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_load_hint_new() {
        let hint = ModuleLoadHint::new(0x140000000);
        assert_eq!(hint.image_base, 0x140000000);
        assert_eq!(hint.image_size, 0);
        assert!(hint.image_path.is_none());
    }

    #[test]
    fn test_module_load_hint_with_path() {
        let hint = ModuleLoadHint::new(0x140000000).with_path("C:\\target\\app.exe");
        assert_eq!(hint.image_path.as_deref(), Some("C:\\target\\app.exe"));
    }

    #[cfg(windows)]
    mod windows_tests {
        use super::super::SymbolResolver;
        use memwatch_common::SymbolError;
        use windows::Win32::Foundation::HANDLE;

        #[test]
        fn test_null_process_handle_rejected() {
            let result = SymbolResolver::new(HANDLE::default(), None, true, None);
            assert!(matches!(result, Err(SymbolError::NullProcessHandle)));
        }
    }
}
