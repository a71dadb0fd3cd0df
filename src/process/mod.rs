//! Process inspector. Enumerates candidate processes and opens a
//! seekable memory-region reader over a chosen one. The Windows backend
//! uses ToolHelp snapshot enumeration, `ReadProcessMemory`, and a
//! `VirtualQueryEx` region walk; a `MemoryReader` trait generalizes the
//! contract so the macOS path (`task_for_pid` + `mach_vm_read`) can share
//! it.

#[cfg(windows)]
pub mod windows;

#[cfg(target_os = "macos")]
pub mod macos;

use crate::error::{CoreError, CoreResult};
use crate::model::{Platform, ProcessCandidate};

/// Executable names recognized as scan targets. The "v4" name
/// additionally excludes processes whose argv contains `--` (helper /
/// crash-reporter subprocesses launched with pass-through flags).
pub const TARGET_EXE_NAMES: [(&str, SchemaGate); 2] = [
    ("ChatClient.exe", SchemaGate::None),
    ("ChatClient4.exe", SchemaGate::ExcludeArgvDoubleDash),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaGate {
    None,
    ExcludeArgvDoubleDash,
}

/// One contiguous region of a candidate's address space.
pub struct MemoryRegion {
    pub base: usize,
    pub bytes: Vec<u8>,
}

/// A seekable stream over a candidate process's anonymous writable
/// regions. Single-owner: no sharing across threads.
pub trait MemoryReader: Send {
    /// Returns the next readable region, or `None` once the scan is
    /// exhausted.
    fn next_region(&mut self) -> CoreResult<Option<MemoryRegion>>;

    /// Reads `size` bytes at `address` directly, bypassing the region
    /// iterator — used by targeted rescans (e.g. the key validator
    /// re-reading a confirmed offset).
    fn read_at(&mut self, address: usize, size: usize) -> CoreResult<Vec<u8>>;
}

/// Enumerates running processes whose executable matches the target set.
/// A candidate without a readable writable-heap region is filtered out.
/// Per-process enumeration errors are logged and skipped — enumeration
/// itself never fails wholesale.
pub fn enumerate() -> Vec<ProcessCandidate> {
    #[cfg(windows)]
    {
        windows::enumerate()
    }
    #[cfg(target_os = "macos")]
    {
        macos::enumerate()
    }
    #[cfg(not(any(windows, target_os = "macos")))]
    {
        log::warn!("process enumeration unsupported on this platform");
        Vec::new()
    }
}

/// Opens a memory reader over `candidate`. Suspending and resuming the
/// target is permitted while the reader is open; on one platform this
/// requires elevated privileges and fails with `PermissionDenied`.
pub fn open(candidate: &ProcessCandidate) -> CoreResult<Box<dyn MemoryReader>> {
    match candidate.platform {
        Platform::Windows => {
            #[cfg(windows)]
            {
                windows::open(candidate.pid).map(|r| Box::new(r) as Box<dyn MemoryReader>)
            }
            #[cfg(not(windows))]
            {
                Err(CoreError::PlatformUnsupported)
            }
        }
        Platform::MacOs => {
            #[cfg(target_os = "macos")]
            {
                macos::open(candidate.pid).map(|r| Box::new(r) as Box<dyn MemoryReader>)
            }
            #[cfg(not(target_os = "macos"))]
            {
                Err(CoreError::PlatformUnsupported)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_exe_gate_table_is_well_formed() {
        assert_eq!(TARGET_EXE_NAMES.len(), 2);
        assert_eq!(TARGET_EXE_NAMES[1].1, SchemaGate::ExcludeArgvDoubleDash);
    }
}
