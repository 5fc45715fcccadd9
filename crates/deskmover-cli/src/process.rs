//! Finding, watching and restarting the shell process

use deskmover_shared::HostMonitor;
use deskmover_shared::ipc::OwnedHandle;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use windows::Win32::Foundation::{ERROR_INVALID_PARAMETER, WAIT_TIMEOUT};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_SYNCHRONIZE, PROCESS_TERMINATE, TerminateProcess, WaitForSingleObject,
};
use windows::Win32::UI::WindowsAndMessaging::{FindWindowW, GetWindowThreadProcessId};
use windows::core::{PCWSTR, Result, w};

const SHELL_EXE: &str = "explorer.exe";

/// Information about a running process
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// List every running process named `exe_name` (case-insensitive)
pub fn list_processes_named(exe_name: &str) -> Result<Vec<ProcessInfo>> {
    let mut processes = Vec::new();

    unsafe {
        let snapshot = OwnedHandle::new(CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)?);

        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        if Process32FirstW(snapshot.raw(), &mut entry).is_ok() {
            loop {
                let name = String::from_utf16_lossy(
                    &entry.szExeFile[..entry
                        .szExeFile
                        .iter()
                        .position(|&c| c == 0)
                        .unwrap_or(entry.szExeFile.len())],
                );

                if name.eq_ignore_ascii_case(exe_name) {
                    processes.push(ProcessInfo {
                        pid: entry.th32ProcessID,
                        name,
                    });
                }

                if Process32NextW(snapshot.raw(), &mut entry).is_err() {
                    break;
                }
            }
        }
    }

    Ok(processes)
}

/// PID of the process owning the desktop window
///
/// Falls back to the first `explorer.exe` in a snapshot when `Progman` is not
/// there, which happens while the shell is still starting.
pub fn find_shell_pid() -> Option<u32> {
    unsafe {
        if let Ok(progman) = FindWindowW(w!("Progman"), PCWSTR::null()) {
            let mut pid = 0;
            GetWindowThreadProcessId(progman, Some(&mut pid));
            if pid != 0 {
                return Some(pid);
            }
        }
    }

    list_processes_named(SHELL_EXE)
        .ok()?
        .into_iter()
        .next()
        .map(|p| p.pid)
}

/// Handle to a process that can be polled for liveness
pub struct ProcessHandle {
    pid: u32,
    handle: OwnedHandle,
}

impl ProcessHandle {
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe { OpenProcess(PROCESS_SYNCHRONIZE, false, pid)? };
        Ok(Self {
            pid,
            handle: OwnedHandle::new(handle),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check if the process is still running
    pub fn is_alive(&self) -> bool {
        // WAIT_TIMEOUT means still running, WAIT_OBJECT_0 means terminated
        unsafe { WaitForSingleObject(self.handle.raw(), 0) == WAIT_TIMEOUT }
    }
}

/// Watches the shell process the worker lives in
///
/// The handle is taken lazily on first check, so a monitor created before
/// the shell is up still works.
#[derive(Default)]
pub struct ExplorerHost {
    process: Mutex<Option<ProcessHandle>>,
}

impl ExplorerHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostMonitor for ExplorerHost {
    fn is_alive(&self) -> bool {
        let mut process = self.process.lock().unwrap_or_else(PoisonError::into_inner);

        if process.is_none() {
            *process = find_shell_pid().and_then(|pid| ProcessHandle::open(pid).ok());
        }

        match process.as_ref() {
            Some(p) if p.is_alive() => true,
            Some(p) => {
                tracing::warn!(pid = p.pid(), "shell process exited");
                *process = None;
                false
            }
            None => false,
        }
    }

    fn restart(&self) -> deskmover_shared::Result<()> {
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = None;
        restart_shell()?;
        Ok(())
    }
}

fn shell_path() -> PathBuf {
    let windir = std::env::var_os("WINDIR").unwrap_or_else(|| r"C:\Windows".into());
    PathBuf::from(windir).join(SHELL_EXE)
}

/// Kill every shell instance and start a fresh one
pub fn restart_shell() -> std::io::Result<u32> {
    let running = list_processes_named(SHELL_EXE).map_err(std::io::Error::other)?;

    for info in &running {
        let terminated = unsafe {
            OpenProcess(PROCESS_TERMINATE, false, info.pid).and_then(|h| {
                let h = OwnedHandle::new(h);
                TerminateProcess(h.raw(), 1)
            })
        };
        match terminated {
            Ok(()) => tracing::info!(pid = info.pid, name = %info.name, "terminated shell process"),
            // Exited between the snapshot and the open
            Err(e) if e.code() == ERROR_INVALID_PARAMETER.to_hresult() => {}
            Err(e) => tracing::warn!(pid = info.pid, error = %e, "failed to terminate shell"),
        }
    }

    let child = std::process::Command::new(shell_path()).spawn()?;
    tracing::info!(pid = child.id(), "started shell");
    Ok(child.id())
}
