//! macOS process backend, built from the standard Mach task-port idiom
//! (`task_for_pid` + `mach_vm_read_overwrite` + `mach_vm_region`) via the
//! `mach2` crate, plus `libproc` for process/path enumeration (the
//! idiomatic wrapper over `<libproc.h>` rather than hand-rolled FFI) —
//! both noted as new dependencies in DESIGN.md.
//!
//! `task_for_pid` requires root or a signed/entitled caller on modern
//! macOS; lack of privileges surfaces as `CoreError::PermissionDenied`.

use crate::error::{CoreError, CoreResult};
use crate::model::{Platform, ProcessCandidate};
use crate::process::{MemoryRegion, MemoryReader, TARGET_EXE_NAMES};
use mach2::kern_return::KERN_SUCCESS;
use mach2::port::{mach_port_deallocate, mach_port_t, MACH_PORT_NULL};
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{mach_vm_read_overwrite, mach_vm_region};
use mach2::vm_prot::{VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_region::{vm_region_basic_info_64, VM_REGION_BASIC_INFO_64};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use std::path::PathBuf;

pub fn enumerate() -> Vec<ProcessCandidate> {
    let mut out = Vec::new();
    let Ok(pids) = libproc::libproc::list_pids(libproc::libproc::ProcType::ProcAllPIDS) else {
        return out;
    };

    for pid in pids {
        let Ok(path) = libproc::libproc::pid_path(pid as i32) else { continue };
        let exe = PathBuf::from(path);
        let Some(name) = exe.file_name().and_then(|n| n.to_str()) else { continue };
        if TARGET_EXE_NAMES.iter().any(|(n, _)| *n == name) && has_readable_writable_region(pid as i32)
        {
            out.push(ProcessCandidate {
                pid,
                executable_path: exe,
                platform: Platform::MacOs,
            });
        }
    }
    out
}

fn open_task(pid: i32) -> CoreResult<mach_port_t> {
    let mut task: mach_port_t = MACH_PORT_NULL;
    let kr = unsafe { task_for_pid(mach_task_self(), pid, &mut task) };
    if kr != KERN_SUCCESS {
        return Err(CoreError::PermissionDenied);
    }
    Ok(task)
}

fn has_readable_writable_region(pid: i32) -> bool {
    match open_task(pid) {
        Ok(task) => {
            let found = next_rw_region(task, 0).is_some();
            unsafe { mach_port_deallocate(mach_task_self(), task) };
            found
        }
        Err(_) => false,
    }
}

/// Finds the next committed read/write region at or after `from`.
fn next_rw_region(task: mach_port_t, from: u64) -> Option<(u64, u64)> {
    let mut addr = from;
    loop {
        let mut region_addr: mach_vm_address_t = addr;
        let mut region_size: mach_vm_size_t = 0;
        let mut info = unsafe { std::mem::zeroed::<vm_region_basic_info_64>() };
        let mut info_count =
            (std::mem::size_of::<vm_region_basic_info_64>() / std::mem::size_of::<u32>()) as u32;
        let mut object_name: mach_port_t = MACH_PORT_NULL;

        let kr = unsafe {
            mach_vm_region(
                task,
                &mut region_addr,
                &mut region_size,
                VM_REGION_BASIC_INFO_64,
                &mut info as *mut _ as *mut i32,
                &mut info_count,
                &mut object_name,
            )
        };
        if kr != KERN_SUCCESS {
            return None;
        }
        addr = region_addr + region_size;

        let writable = info.protection & VM_PROT_WRITE != 0;
        let readable = info.protection & VM_PROT_READ != 0;
        if readable && writable {
            return Some((region_addr, region_size));
        }
    }
}

pub struct MacMemoryReader {
    task: mach_port_t,
    cursor_addr: u64,
}

pub fn open(pid: u32) -> CoreResult<MacMemoryReader> {
    let task = open_task(pid as i32)?;
    Ok(MacMemoryReader { task, cursor_addr: 0 })
}

impl MemoryReader for MacMemoryReader {
    fn next_region(&mut self) -> CoreResult<Option<MemoryRegion>> {
        loop {
            let Some((base, size)) = next_rw_region(self.task, self.cursor_addr) else {
                return Ok(None);
            };
            self.cursor_addr = base + size;

            match self.read_at(base as usize, size as usize) {
                Ok(bytes) if !bytes.is_empty() => {
                    return Ok(Some(MemoryRegion { base: base as usize, bytes }))
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
        let mut out_size: mach_vm_size_t = 0;
        let kr = unsafe {
            mach_vm_read_overwrite(
                self.task,
                address as mach_vm_address_t,
                size as mach_vm_size_t,
                buf.as_mut_ptr() as mach_vm_address_t,
                &mut out_size,
            )
        };
        if kr != KERN_SUCCESS {
            return Ok(Vec::new());
        }
        buf.truncate(out_size as usize);
        Ok(buf)
    }
}

impl Drop for MacMemoryReader {
    fn drop(&mut self) {
        unsafe { mach_port_deallocate(mach_task_self(), self.task) };
    }
}
