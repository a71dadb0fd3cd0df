//! Windows process backend: `CreateToolhelp32Snapshot`/`Process32*W` for
//! enumeration, `OpenProcess`/`ReadProcessMemory`/`VirtualQueryEx` for the
//! memory reader. Suspend/resume uses the same
//! `Win32_System_Diagnostics_Debug` feature group as `ReadProcessMemory`.

use crate::error::{CoreError, CoreResult};
use crate::model::{Platform, ProcessCandidate};
use crate::process::{MemoryRegion, MemoryReader, TARGET_EXE_NAMES};
use std::path::PathBuf;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Diagnostics::Debug::{
    DebugActiveProcess, DebugActiveProcessStop, ReadProcessMemory,
};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W, TH32CS_SNAPPROCESS,
};
use windows_sys::Win32::System::Memory::{
    VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_PRIVATE, PAGE_READONLY,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ};

pub fn enumerate() -> Vec<ProcessCandidate> {
    let mut out = Vec::new();
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        log::error!("CreateToolhelp32Snapshot failed: {}", std::io::Error::last_os_error());
        return out;
    }

    let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
    entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;

    if unsafe { Process32FirstW(snapshot, &mut entry) } == 0 {
        unsafe { CloseHandle(snapshot) };
        return out;
    }

    loop {
        let name = String::from_utf16_lossy(&entry.szExeFile)
            .trim_end_matches('\0')
            .to_string();

        if let Some((_, gate)) = TARGET_EXE_NAMES.iter().find(|(n, _)| *n == name) {
            let pid = entry.th32ProcessID;
            let gate_ok = match gate {
                crate::process::SchemaGate::None => true,
                crate::process::SchemaGate::ExcludeArgvDoubleDash => {
                    !command_line_contains_double_dash(pid)
                }
            };

            if gate_ok && has_readable_writable_region(pid) {
                out.push(ProcessCandidate {
                    pid,
                    executable_path: exe_path(pid).unwrap_or_else(|_| PathBuf::from(name.clone())),
                    platform: Platform::Windows,
                });
            }
        }

        if unsafe { Process32NextW(snapshot, &mut entry) } == 0 {
            break;
        }
    }

    unsafe { CloseHandle(snapshot) };
    out
}

/// Best-effort argv check; Windows doesn't expose another process's argv
/// without reading its PEB. Conservatively returns `false` (don't
/// exclude) when the check can't be performed, logging the reason.
fn command_line_contains_double_dash(pid: u32) -> bool {
    match read_process_command_line(pid) {
        Some(cmdline) => cmdline.contains("--"),
        None => {
            log::warn!("could not read command line for pid {pid}; not excluding");
            false
        }
    }
}

/// x64 PEB layout: `ProcessParameters` sits at a fixed offset in the PEB,
/// and `CommandLine` (a `UNICODE_STRING`) sits at a fixed offset in
/// `RTL_USER_PROCESS_PARAMETERS`. Both offsets have been stable since
/// Windows XP x64 and are the same ones process-listing tools rely on in
/// the absence of a documented API. 32-bit targets aren't supported by
/// this offset table and fall through to `None`.
#[cfg(target_pointer_width = "64")]
mod peb {
    pub const PROCESS_PARAMETERS_OFFSET: usize = 0x20;
    pub const COMMAND_LINE_OFFSET: usize = 0x70;
}

#[repr(C)]
struct ProcessBasicInformation {
    exit_status: i32,
    peb_base_address: *mut u8,
    affinity_mask: usize,
    base_priority: i32,
    unique_process_id: usize,
    inherited_from_unique_process_id: usize,
}

const PROCESS_BASIC_INFORMATION_CLASS: u32 = 0;

#[link(name = "ntdll")]
extern "system" {
    fn NtQueryInformationProcess(
        process_handle: HANDLE,
        process_information_class: u32,
        process_information: *mut core::ffi::c_void,
        process_information_length: u32,
        return_length: *mut u32,
    ) -> i32;
}

/// Reads `pid`'s command line out of its PEB via `NtQueryInformationProcess`
/// + `ReadProcessMemory`. Returns `None` on any failure along the chain
/// (no handle, PEB unreadable, zero-length command line) rather than
/// propagating an error — the caller treats "couldn't check" as "don't
/// exclude", not as a fatal condition.
#[cfg(target_pointer_width = "64")]
fn read_process_command_line(pid: u32) -> Option<String> {
    let handle = unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, 0, pid) };
    if handle == 0 || handle == INVALID_HANDLE_VALUE {
        return None;
    }
    let result = (|| {
        let mut pbi: ProcessBasicInformation = unsafe { std::mem::zeroed() };
        let mut return_len = 0u32;
        let status = unsafe {
            NtQueryInformationProcess(
                handle,
                PROCESS_BASIC_INFORMATION_CLASS,
                &mut pbi as *mut _ as *mut _,
                std::mem::size_of::<ProcessBasicInformation>() as u32,
                &mut return_len,
            )
        };
        if status != 0 || pbi.peb_base_address.is_null() {
            return None;
        }

        let params_ptr_addr = pbi.peb_base_address as usize + peb::PROCESS_PARAMETERS_OFFSET;
        let params_ptr_bytes = read_process_memory_raw(handle, params_ptr_addr, std::mem::size_of::<usize>())?;
        let params_addr = usize::from_ne_bytes(params_ptr_bytes.try_into().ok()?);
        if params_addr == 0 {
            return None;
        }

        // UNICODE_STRING { Length: u16, MaximumLength: u16, <4 bytes padding>, Buffer: *mut u16 }
        let unicode_bytes = read_process_memory_raw(handle, params_addr + peb::COMMAND_LINE_OFFSET, 16)?;
        let length = u16::from_ne_bytes(unicode_bytes[0..2].try_into().ok()?) as usize;
        let buffer_addr = usize::from_ne_bytes(unicode_bytes[8..16].try_into().ok()?);
        if buffer_addr == 0 || length == 0 {
            return None;
        }

        let wide = read_process_memory_raw(handle, buffer_addr, length)?;
        let utf16: Vec<u16> = wide.chunks_exact(2).map(|c| u16::from_ne_bytes([c[0], c[1]])).collect();
        Some(String::from_utf16_lossy(&utf16))
    })();
    unsafe { CloseHandle(handle) };
    result
}

#[cfg(not(target_pointer_width = "64"))]
fn read_process_command_line(_pid: u32) -> Option<String> {
    None
}

fn read_process_memory_raw(handle: HANDLE, address: usize, size: usize) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut read = 0usize;
    let ok = unsafe { ReadProcessMemory(handle, address as *const _, buf.as_mut_ptr() as *mut _, size, &mut read) };
    if ok == 0 || read != size {
        return None;
    }
    Some(buf)
}

fn exe_path(pid: u32) -> CoreResult<PathBuf> {
    const MAX_PATH_LEN: usize = 1024;
    let mut buf: Vec<u16> = vec![0; MAX_PATH_LEN];

    let handle = unsafe {
        OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, 0, pid)
    };
    if handle == 0 || handle == INVALID_HANDLE_VALUE {
        return Err(CoreError::Other(format!(
            "OpenProcess({pid}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let len = unsafe {
        windows_sys::Win32::System::ProcessStatus::K32GetModuleFileNameExW(
            handle,
            std::ptr::null_mut(),
            buf.as_mut_ptr(),
            MAX_PATH_LEN as u32,
        )
    };
    unsafe { CloseHandle(handle) };

    if len == 0 {
        return Err(CoreError::Other(format!("GetModuleFileNameExW({pid}) failed")));
    }
    Ok(PathBuf::from(String::from_utf16_lossy(&buf[..len as usize])))
}

fn has_readable_writable_region(pid: u32) -> bool {
    let handle = unsafe { OpenProcess(PROCESS_VM_READ | PROCESS_QUERY_INFORMATION, 0, pid) };
    if handle == 0 || handle == INVALID_HANDLE_VALUE {
        return false;
    }
    let found = scan_regions(handle, |info| {
        info.State == MEM_COMMIT
            && info.Type == MEM_PRIVATE
            && (info.Protect == PAGE_READWRITE || info.Protect == PAGE_READONLY)
    })
    .next()
    .is_some();
    unsafe { CloseHandle(handle) };
    found
}

fn scan_regions(
    handle: HANDLE,
    keep: impl Fn(&MEMORY_BASIC_INFORMATION) -> bool,
) -> impl Iterator<Item = MEMORY_BASIC_INFORMATION> {
    let mut addr: usize = 0;
    std::iter::from_fn(move || loop {
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let n = unsafe {
            VirtualQueryEx(
                handle,
                addr as *const _,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if n == 0 {
            return None;
        }
        let region_end = (info.BaseAddress as usize).saturating_add(info.RegionSize);
        if region_end <= addr {
            return None; // guard against a zero-size region looping forever
        }
        addr = region_end;
        if keep(&info) {
            return Some(info);
        }
    })
}

/// Live reader over one process's writable regions. Suspends the target
/// on construction if requested by the caller via [`open`]; resumes on
/// every exit path (including panic) via `Drop`.
pub struct WindowsMemoryReader {
    pid: u32,
    handle: HANDLE,
    suspended: bool,
    cursor_addr: usize,
}

pub fn open(pid: u32) -> CoreResult<WindowsMemoryReader> {
    let handle = unsafe { OpenProcess(PROCESS_VM_READ | PROCESS_QUERY_INFORMATION, 0, pid) };
    if handle == 0 || handle == INVALID_HANDLE_VALUE {
        let err = std::io::Error::last_os_error();
        return if err.raw_os_error() == Some(5) {
            Err(CoreError::PermissionDenied)
        } else {
            Err(CoreError::Other(format!("OpenProcess({pid}) failed: {err}")))
        };
    }

    let suspended = unsafe { DebugActiveProcess(pid) } != 0;
    if !suspended {
        log::warn!("could not suspend pid {pid} for a consistent memory scan; reading live");
    }

    Ok(WindowsMemoryReader {
        pid,
        handle,
        suspended,
        cursor_addr: 0,
    })
}

impl MemoryReader for WindowsMemoryReader {
    fn next_region(&mut self) -> CoreResult<Option<MemoryRegion>> {
        loop {
            let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
            let n = unsafe {
                VirtualQueryEx(
                    self.handle,
                    self.cursor_addr as *const _,
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if n == 0 {
                return Ok(None);
            }
            let base = info.BaseAddress as usize;
            let region_end = base.saturating_add(info.RegionSize);
            if region_end <= self.cursor_addr {
                return Ok(None);
            }
            self.cursor_addr = region_end;

            let readable = info.State == MEM_COMMIT
                && info.Type == MEM_PRIVATE
                && (info.Protect == PAGE_READWRITE || info.Protect == PAGE_READONLY);
            if !readable {
                continue;
            }

            match self.read_at(base, info.RegionSize) {
                Ok(bytes) if !bytes.is_empty() => {
                    return Ok(Some(MemoryRegion { base, bytes }))
                }
                _ => continue,
            }
        }
    }

    fn read_at(&mut self, address: usize, size: usize) -> CoreResult<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; size];
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const _,
                buf.as_mut_ptr() as *mut _,
                size,
                &mut read,
            )
        };
        if ok == 0 {
            return Ok(Vec::new());
        }
        buf.truncate(read);
        Ok(buf)
    }
}

impl Drop for WindowsMemoryReader {
    fn drop(&mut self) {
        if self.suspended {
            if unsafe { DebugActiveProcessStop(self.pid) } == 0 {
                log::error!("failed to resume suspended pid {}", self.pid);
            }
        }
        if self.handle != 0 {
            unsafe { CloseHandle(self.handle) };
        }
    }
}
