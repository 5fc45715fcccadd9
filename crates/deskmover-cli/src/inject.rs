//! Worker injection using LoadLibraryW

use deskmover_shared::ipc::OwnedHandle;
use std::ffi::c_void;
use std::path::Path;
use windows::Win32::Foundation::{
    ERROR_MOD_NOT_FOUND, ERROR_NOT_ALL_ASSIGNED, ERROR_TIMEOUT, GetLastError, HANDLE, LUID,
    SetLastError, WAIT_OBJECT_0, WAIT_TIMEOUT, WIN32_ERROR,
};
use windows::Win32::Security::{
    AdjustTokenPrivileges, LUID_AND_ATTRIBUTES, LookupPrivilegeValueW, SE_DEBUG_NAME,
    SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
};
use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE, VirtualAllocEx, VirtualFreeEx,
};
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetCurrentProcess, GetExitCodeThread, OpenProcess, OpenProcessToken,
    PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ,
    PROCESS_VM_WRITE, WaitForSingleObject,
};
use windows::core::{Error, HRESULT, Result, s, w};

/// How long the remote LoadLibraryW call may take
const LOAD_TIMEOUT_MS: u32 = 10_000;

/// Buffer allocated inside another process, freed on drop
struct RemoteBuffer<'a> {
    process: &'a OwnedHandle,
    address: *mut c_void,
}

impl<'a> RemoteBuffer<'a> {
    fn alloc(process: &'a OwnedHandle, size: usize) -> Result<Self> {
        let address = unsafe {
            VirtualAllocEx(
                process.raw(),
                None,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if address.is_null() {
            return Err(Error::from_win32());
        }
        Ok(Self { process, address })
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut written = 0;
        unsafe {
            WriteProcessMemory(
                self.process.raw(),
                self.address,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                Some(&mut written),
            )?;
        }
        if written != bytes.len() {
            return Err(Error::from_win32());
        }
        Ok(())
    }
}

impl Drop for RemoteBuffer<'_> {
    fn drop(&mut self) {
        unsafe {
            let _ = VirtualFreeEx(self.process.raw(), self.address, 0, MEM_RELEASE);
        }
    }
}

/// Enable SeDebugPrivilege on our own token
///
/// Needed to open processes of other integrity levels; failure is not fatal
/// when the target belongs to the same user.
pub fn enable_debug_privilege() -> Result<()> {
    let mut token = HANDLE::default();
    unsafe {
        OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        )?;
    }
    let token = OwnedHandle::new(token);

    let mut luid = LUID::default();
    unsafe { LookupPrivilegeValueW(None, SE_DEBUG_NAME, &mut luid)? };

    let privileges = TOKEN_PRIVILEGES {
        PrivilegeCount: 1,
        Privileges: [LUID_AND_ATTRIBUTES {
            Luid: luid,
            Attributes: SE_PRIVILEGE_ENABLED,
        }],
    };

    unsafe {
        SetLastError(WIN32_ERROR(0));
        AdjustTokenPrivileges(token.raw(), false, Some(&privileges), 0, None, None)?;
        if GetLastError() == ERROR_NOT_ALL_ASSIGNED {
            return Err(Error::from(ERROR_NOT_ALL_ASSIGNED));
        }
    }
    Ok(())
}

/// Load `dll_path` into process `pid`
///
/// Blocks until the remote LoadLibraryW call returns. A NULL module handle
/// from the remote thread is reported as an error.
pub fn inject_dll(pid: u32, dll_path: &Path) -> Result<()> {
    let dll_path_wide: Vec<u16> = dll_path
        .to_string_lossy()
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();
    let dll_path_bytes: Vec<u8> = dll_path_wide.iter().flat_map(|c| c.to_le_bytes()).collect();

    let process = OwnedHandle::new(unsafe {
        OpenProcess(
            PROCESS_CREATE_THREAD
                | PROCESS_QUERY_INFORMATION
                | PROCESS_VM_OPERATION
                | PROCESS_VM_WRITE
                | PROCESS_VM_READ,
            false,
            pid,
        )?
    });

    let remote = RemoteBuffer::alloc(&process, dll_path_bytes.len())?;
    remote.write(&dll_path_bytes)?;

    let load_library = unsafe {
        let kernel32 = GetModuleHandleW(w!("kernel32.dll"))?;
        GetProcAddress(kernel32, s!("LoadLibraryW")).ok_or_else(Error::from_win32)?
    };

    let thread = OwnedHandle::new(unsafe {
        #[allow(clippy::missing_transmute_annotations)]
        CreateRemoteThread(
            process.raw(),
            None,
            0,
            Some(std::mem::transmute(load_library)),
            Some(remote.address),
            0,
            None,
        )?
    });

    let wait_result = unsafe { WaitForSingleObject(thread.raw(), LOAD_TIMEOUT_MS) };
    if wait_result == WAIT_TIMEOUT {
        return Err(Error::new(
            HRESULT::from_win32(ERROR_TIMEOUT.0),
            "Timeout waiting for LoadLibraryW",
        ));
    }
    if wait_result != WAIT_OBJECT_0 {
        return Err(Error::from_win32());
    }

    // LoadLibraryW's return value, truncated to 32 bits; NULL means failure
    let mut exit_code: u32 = 0;
    unsafe { GetExitCodeThread(thread.raw(), &mut exit_code)? };

    if exit_code == 0 {
        return Err(Error::new(
            HRESULT::from_win32(ERROR_MOD_NOT_FOUND.0),
            "LoadLibraryW failed in target process (returned NULL). The DLL may have missing dependencies or refused to load outside explorer.exe.",
        ));
    }

    Ok(())
}
