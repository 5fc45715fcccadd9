//! Named shared memory channel
//!
//! Four kernel objects in the session namespace:
//! - a page-file backed mapping holding one [`Message`]
//! - a mutex serializing client transactions
//! - two auto-reset events, `command-ready` and `response-ready`
//!
//! Opening is create-or-open for every object, so whichever side comes first
//! creates them and the other side gets handles to the same objects.

use crate::channel::{Channel, ChannelNames};
use crate::messages::{INVALID_COMMAND, Message};
use crate::{Error, Result};
use std::time::Duration;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_ABANDONED,
    WAIT_EVENT, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile,
    PAGE_READWRITE, UnmapViewOfFile,
};
use windows::Win32::System::Threading::{
    CreateEventW, CreateMutexW, INFINITE, ReleaseMutex, SetEvent, WaitForSingleObject,
};
use windows::core::PCWSTR;

/// Size of the mapping
pub const SEGMENT_SIZE: usize = std::mem::size_of::<Message>();

/// Kernel handle closed on drop
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

impl OwnedHandle {
    /// Take ownership of `handle`
    pub fn new(handle: HANDLE) -> Self {
        Self(handle)
    }

    /// Borrow the raw handle
    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn millis(timeout: Duration) -> u32 {
    // INFINITE is u32::MAX, keep finite waits below it
    timeout.as_millis().min(u128::from(INFINITE - 1)) as u32
}

/// Result of waiting on one handle
fn wait(handle: HANDLE, ms: u32) -> Result<bool> {
    let result: WAIT_EVENT = unsafe { WaitForSingleObject(handle, ms) };
    match result {
        WAIT_OBJECT_0 => Ok(true),
        WAIT_TIMEOUT => Ok(false),
        WAIT_ABANDONED => {
            // Previous owner died holding the mutex; ownership passes to us
            tracing::warn!("channel mutex was abandoned by its previous owner");
            Ok(true)
        }
        _ => Err(Error::from(windows::core::Error::from_win32())),
    }
}

/// Both ends of the named channel
pub struct SharedChannel {
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    _mapping: OwnedHandle,
    mutex: OwnedHandle,
    command_ready: OwnedHandle,
    response_ready: OwnedHandle,
}

// SAFETY: SharedChannel can be sent and shared between threads because:
// - All handles are process-wide kernel objects
// - The view stays mapped until drop
// - The message is only touched inside the exclusive window the protocol
//   grants each side (client holds the mutex, server between signals)
unsafe impl Send for SharedChannel {}
unsafe impl Sync for SharedChannel {}

impl SharedChannel {
    /// Create the named objects, or open them if they already exist
    pub fn open_or_create(names: &ChannelNames) -> Result<Self> {
        let segment = wide(&names.segment);
        let mutex = wide(&names.mutex);
        let command_event = wide(&names.command_event);
        let response_event = wide(&names.response_event);

        unsafe {
            let mapping = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                SEGMENT_SIZE as u32,
                PCWSTR(segment.as_ptr()),
            )
            .map_err(|e| setup_error("shared memory", &names.segment, e))?;
            let created = GetLastError() != ERROR_ALREADY_EXISTS;
            let mapping = OwnedHandle::new(mapping);

            let mutex = OwnedHandle::new(
                CreateMutexW(None, false, PCWSTR(mutex.as_ptr()))
                    .map_err(|e| setup_error("mutex", &names.mutex, e))?,
            );
            let command_ready = OwnedHandle::new(
                CreateEventW(None, false, false, PCWSTR(command_event.as_ptr()))
                    .map_err(|e| setup_error("event", &names.command_event, e))?,
            );
            let response_ready = OwnedHandle::new(
                CreateEventW(None, false, false, PCWSTR(response_event.as_ptr()))
                    .map_err(|e| setup_error("event", &names.response_event, e))?,
            );

            let view = MapViewOfFile(mapping.raw(), FILE_MAP_ALL_ACCESS, 0, 0, SEGMENT_SIZE);
            if view.Value.is_null() {
                return Err(setup_error(
                    "shared memory view",
                    &names.segment,
                    windows::core::Error::from_win32(),
                ));
            }

            let channel = Self {
                view,
                _mapping: mapping,
                mutex,
                command_ready,
                response_ready,
            };

            // A fresh mapping is zeroed and zero decodes as Exit
            if created {
                channel.message().command = INVALID_COMMAND;
            }

            tracing::debug!(segment = %names.segment, created, "channel opened");
            Ok(channel)
        }
    }

    /// Open the default names
    pub fn open_default() -> Result<Self> {
        Self::open_or_create(&ChannelNames::default())
    }

    #[allow(clippy::mut_from_ref)]
    fn message(&self) -> &mut Message {
        unsafe { &mut *(self.view.Value as *mut Message) }
    }
}

fn setup_error(what: &str, name: &str, e: windows::core::Error) -> Error {
    Error::ChannelSetup(format!("{what} '{name}': {e}"))
}

impl Channel for SharedChannel {
    fn acquire(&self, timeout: Duration) -> Result<bool> {
        wait(self.mutex.raw(), millis(timeout))
    }

    fn release(&self) -> Result<()> {
        unsafe { ReleaseMutex(self.mutex.raw())? };
        Ok(())
    }

    fn wait_command(&self, timeout: Option<Duration>) -> Result<bool> {
        wait(self.command_ready.raw(), timeout.map_or(INFINITE, millis))
    }

    fn signal_command(&self) -> Result<()> {
        unsafe { SetEvent(self.command_ready.raw())? };
        Ok(())
    }

    fn wait_response(&self, timeout: Duration) -> Result<bool> {
        wait(self.response_ready.raw(), millis(timeout))
    }

    fn signal_response(&self) -> Result<()> {
        unsafe { SetEvent(self.response_ready.raw())? };
        Ok(())
    }

    fn with_shared<R>(&self, f: impl FnOnce(&mut Message) -> R) -> R {
        f(self.message())
    }
}

impl Drop for SharedChannel {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
        }
    }
}
