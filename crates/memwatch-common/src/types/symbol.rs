//! Resolved symbol description

use serde::{Deserialize, Serialize};
use std::fmt;

/// A symbol located in the target's address space.
///
/// Produced by the resolver and immutable afterwards. The resolver accepts
/// sizes in 4..=8; the watcher tightens the invariant to exactly 4 or 8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSymbol {
    /// Undecorated name
    pub name: String,
    /// Base address of the owning module
    pub module_base: u64,
    /// Virtual address in the target
    pub address: u64,
    /// Size in bytes
    pub size: u32,
}

impl ResolvedSymbol {
    /// Module base rendered for humans: `0x` prefix, uppercase digits.
    pub fn module_base_hex(&self) -> String {
        format!("0x{:X}", self.module_base)
    }
}

impl fmt::Display for ResolvedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {:#x} ({} bytes, module {})",
            self.name,
            self.address,
            self.size,
            self.module_base_hex()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_base_hex_uppercase() {
        let sym = ResolvedSymbol {
            name: "g_counter".to_string(),
            module_base: 0x7ff6_dead_0000,
            address: 0x7ff6_dead_1040,
            size: 8,
        };
        assert_eq!(sym.module_base_hex(), "0x7FF6DEAD0000");
    }

    #[test]
    fn test_module_base_hex_zero() {
        let sym = ResolvedSymbol {
            name: "g".to_string(),
            module_base: 0,
            address: 0x1000,
            size: 4,
        };
        assert_eq!(sym.module_base_hex(), "0x0");
    }

    #[test]
    fn test_display_contains_name_and_size() {
        let sym = ResolvedSymbol {
            name: "g_counter".to_string(),
            module_base: 0x140000000,
            address: 0x140003000,
            size: 4,
        };
        let text = sym.to_string();
        assert!(text.contains("g_counter"));
        assert!(text.contains("4 bytes"));
        assert!(text.contains("0x140000000"));
    }

    #[test]
    fn test_symbol_serialization() {
        let sym = ResolvedSymbol {
            name: "g".to_string(),
            module_base: 0x10000,
            address: 0x10040,
            size: 8,
        };
        let json = serde_json::to_string(&sym).unwrap();
        let parsed: ResolvedSymbol = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "g");
        assert_eq!(parsed.address, 0x10040);
        assert_eq!(parsed.size, 8);
    }
}
