//! deskmover worker - loaded into explorer.exe to move desktop icons on request

#![cfg(windows)]

mod desktop;

use deskmover_shared::{LogFile, Server, ServerExit, SharedChannel};
use desktop::ShellDesktop;
use std::ffi::c_void;
use std::panic;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use windows::Win32::Foundation::{HMODULE, MAX_PATH};
use windows::Win32::System::LibraryLoader::{
    DisableThreadLibraryCalls, FreeLibraryAndExitThread, GetModuleFileNameW,
};
use windows::Win32::System::SystemServices::DLL_PROCESS_ATTACH;
use windows::Win32::System::Threading::{CreateThread, THREAD_CREATION_FLAGS};

/// Store the module handle so we can unload ourselves
static MODULE_HANDLE: AtomicUsize = AtomicUsize::new(0);

/// DLL entry point
#[unsafe(no_mangle)]
pub extern "system" fn DllMain(module: HMODULE, call_reason: u32, _reserved: *mut c_void) -> bool {
    if call_reason != DLL_PROCESS_ATTACH {
        return true;
    }

    // Refusing the load makes LoadLibraryW return NULL to the injector
    if !host_is_shell() {
        return false;
    }

    MODULE_HANDLE.store(module.0 as usize, Ordering::SeqCst);

    unsafe {
        let _ = DisableThreadLibraryCalls(module);
        let _ = CreateThread(
            None,
            0,
            Some(server_thread),
            None,
            THREAD_CREATION_FLAGS(0),
            None,
        );
    }
    true
}

fn host_is_shell() -> bool {
    let mut buf = [0u16; MAX_PATH as usize];
    let len = unsafe { GetModuleFileNameW(None, &mut buf) } as usize;
    is_shell_executable(&String::from_utf16_lossy(&buf[..len]))
}

fn is_shell_executable(path: &str) -> bool {
    Path::new(path)
        .file_name()
        .is_some_and(|name| name.eq_ignore_ascii_case("explorer.exe"))
}

fn init_logging(log: &LogFile) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = fmt::layer()
        .with_writer(log.clone())
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true);

    // A previous load of this module may have installed one already
    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}

fn install_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "<unknown location>".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "<unknown panic>".to_string()
        };

        tracing::error!("PANIC at {}: {}", location, message);
    }));
}

/// Worker thread: serve commands, then leave the way the client asked
extern "system" fn server_thread(_param: *mut c_void) -> u32 {
    let log = match LogFile::open(LogFile::default_path()) {
        Ok(log) => {
            init_logging(&log);
            Some(log)
        }
        Err(_) => None,
    };
    install_panic_hook();

    tracing::info!(pid = std::process::id(), "worker loaded");

    let exit = match serve(log) {
        Ok(exit) => exit,
        Err(e) => {
            tracing::error!(error = %e, "server stopped");
            unload_self(1);
        }
    };

    match exit {
        ServerExit::Normal => unload_self(0),
        ServerExit::Forced => {
            // Racy: this thread may still be running module code when the
            // detached thread frees the module. Accepted for hosts where the
            // orderly path hangs.
            unsafe {
                let _ = CreateThread(
                    None,
                    0,
                    Some(unload_thread),
                    None,
                    THREAD_CREATION_FLAGS(0),
                    None,
                );
            }
            0
        }
        ServerExit::HardKill => {
            tracing::warn!("terminating host process");
            std::process::exit(0)
        }
    }
}

/// Channel and desktop live only inside this call, so every handle is
/// closed before the module goes away.
fn serve(log: Option<LogFile>) -> deskmover_shared::Result<ServerExit> {
    let channel = SharedChannel::open_default()?;
    let mut server = Server::new(channel, ShellDesktop::new());
    if let Some(log) = log {
        server = server.with_log_file(log);
    }
    server.run()
}

extern "system" fn unload_thread(_param: *mut c_void) -> u32 {
    unload_self(0)
}

/// Unload the DLL and exit the current thread
fn unload_self(exit_code: u32) -> ! {
    tracing::info!(exit_code, "unloading worker");
    unsafe {
        let module = HMODULE(MODULE_HANDLE.load(Ordering::SeqCst) as *mut c_void);
        FreeLibraryAndExitThread(module, exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_executable_detection() {
        assert!(is_shell_executable(r"C:\Windows\explorer.exe"));
        assert!(is_shell_executable(r"C:\WINDOWS\Explorer.EXE"));
        assert!(!is_shell_executable(r"C:\Windows\notepad.exe"));
        assert!(!is_shell_executable(r"C:\Tools\explorer.exe.bak"));
        assert!(!is_shell_executable(""));
    }
}
