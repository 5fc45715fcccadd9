//! Desktop list view access from inside the shell process
//!
//! The icons live in a `SysListView32` named `FolderView` under
//! `SHELLDLL_DefView`, which sits under `Progman` or, with a wallpaper
//! slideshow, under one of the `WorkerW` windows. Because the worker runs in
//! the shell's own address space, list view messages can point at local
//! buffers.

use deskmover_shared::{ArrangementFlag, Desktop, Error, MAX_NAME_LEN, Result, read_wide};
use windows::Win32::Foundation::{HWND, LPARAM, POINT, WPARAM};
use windows::Win32::UI::Controls::LVITEMW;
use windows::Win32::UI::HiDpi::GetDpiForWindow;
use windows::Win32::UI::Input::KeyboardAndMouse::{
    INPUT, INPUT_0, INPUT_KEYBOARD, KEYBD_EVENT_FLAGS, KEYBDINPUT, KEYEVENTF_KEYUP, SendInput,
    VIRTUAL_KEY, VK_D, VK_LWIN,
};
use windows::Win32::UI::Shell::{SHCNE_ASSOCCHANGED, SHCNF_IDLIST, SHChangeNotify};
use windows::Win32::UI::WindowsAndMessaging::{
    FindWindowExW, FindWindowW, GWL_STYLE, GetSystemMetrics, GetWindowLongPtrW, IsWindow,
    SM_CXSCREEN, SM_CYSCREEN, SendMessageW, SetWindowLongPtrW,
};
use windows::core::{PCWSTR, PWSTR, w};

const LVM_FIRST: u32 = 0x1000;
const LVM_GETITEMCOUNT: u32 = LVM_FIRST + 4;
const LVM_SETITEMPOSITION: u32 = LVM_FIRST + 15;
const LVM_GETITEMPOSITION: u32 = LVM_FIRST + 16;
const LVM_SETEXTENDEDLISTVIEWSTYLE: u32 = LVM_FIRST + 54;
const LVM_GETITEMTEXTW: u32 = LVM_FIRST + 115;

const LVS_AUTOARRANGE: isize = 0x0100;
const LVS_EX_SNAPTOGRID: usize = 0x0008_0000;

/// Win32 desktop, caching the list view handle while it stays valid
#[derive(Default)]
pub struct ShellDesktop {
    list_view: Option<HWND>,
}

impl ShellDesktop {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_list_view() -> Option<HWND> {
    unsafe {
        let mut def_view = FindWindowW(w!("Progman"), PCWSTR::null())
            .ok()
            .and_then(|p| {
                FindWindowExW(Some(p), None, w!("SHELLDLL_DefView"), PCWSTR::null()).ok()
            });

        if def_view.is_none() {
            let mut worker = None;
            while let Ok(found) = FindWindowExW(None, worker, w!("WorkerW"), PCWSTR::null()) {
                if let Ok(v) =
                    FindWindowExW(Some(found), None, w!("SHELLDLL_DefView"), PCWSTR::null())
                {
                    def_view = Some(v);
                    break;
                }
                worker = Some(found);
            }
        }

        FindWindowExW(Some(def_view?), None, w!("SysListView32"), w!("FolderView")).ok()
    }
}

fn send(hwnd: HWND, msg: u32, wparam: usize, lparam: isize) -> isize {
    unsafe { SendMessageW(hwnd, msg, Some(WPARAM(wparam)), Some(LPARAM(lparam))).0 }
}

fn key(vk: VIRTUAL_KEY, up: bool) -> INPUT {
    INPUT {
        r#type: INPUT_KEYBOARD,
        Anonymous: INPUT_0 {
            ki: KEYBDINPUT {
                wVk: vk,
                dwFlags: if up {
                    KEYEVENTF_KEYUP
                } else {
                    KEYBD_EVENT_FLAGS(0)
                },
                ..Default::default()
            },
        },
    }
}

impl Desktop for ShellDesktop {
    type Surface = HWND;

    fn find_surface(&mut self) -> Option<HWND> {
        if let Some(hwnd) = self.list_view
            && unsafe { IsWindow(Some(hwnd)) }.as_bool()
        {
            return Some(hwnd);
        }

        self.list_view = find_list_view();
        if self.list_view.is_none() {
            tracing::warn!("desktop list view not found");
        }
        self.list_view
    }

    fn item_count(&self, surface: HWND) -> usize {
        send(surface, LVM_GETITEMCOUNT, 0, 0).max(0) as usize
    }

    fn item_name(&self, surface: HWND, index: usize) -> Option<String> {
        let mut buf = [0u16; MAX_NAME_LEN];
        let mut item = LVITEMW {
            iSubItem: 0,
            pszText: PWSTR(buf.as_mut_ptr()),
            cchTextMax: buf.len() as i32,
            ..Default::default()
        };
        let len = send(
            surface,
            LVM_GETITEMTEXTW,
            index,
            &mut item as *mut LVITEMW as isize,
        );
        (len > 0).then(|| read_wide(&buf))
    }

    fn item_position(&self, surface: HWND, index: usize) -> Option<(i32, i32)> {
        let mut pt = POINT::default();
        let ok = send(
            surface,
            LVM_GETITEMPOSITION,
            index,
            &mut pt as *mut POINT as isize,
        );
        (ok != 0).then_some((pt.x, pt.y))
    }

    fn set_item_position(&mut self, surface: HWND, index: usize, x: i32, y: i32) -> Result<()> {
        if !(0..=0x7FFF).contains(&x) || !(0..=0x7FFF).contains(&y) {
            return Err(Error::Desktop(format!("position ({x}, {y}) out of range")));
        }

        let lparam = ((y as isize) << 16) | (x as isize);
        if send(surface, LVM_SETITEMPOSITION, index, lparam) == 0 {
            return Err(Error::Desktop(format!(
                "list view rejected position for index {index}"
            )));
        }
        Ok(())
    }

    fn screen_size(&self) -> (i32, i32) {
        unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) }
    }

    fn dpi(&self, surface: HWND) -> u32 {
        match unsafe { GetDpiForWindow(surface) } {
            0 => 96,
            dpi => dpi,
        }
    }

    fn refresh(&mut self) -> Result<()> {
        unsafe { SHChangeNotify(SHCNE_ASSOCCHANGED, SHCNF_IDLIST, None, None) };
        Ok(())
    }

    fn show_desktop(&mut self) -> Result<()> {
        let inputs = [
            key(VK_LWIN, false),
            key(VK_D, false),
            key(VK_D, true),
            key(VK_LWIN, true),
        ];
        let sent = unsafe { SendInput(&inputs, std::mem::size_of::<INPUT>() as i32) };
        if sent as usize != inputs.len() {
            return Err(windows::core::Error::from_win32().into());
        }
        Ok(())
    }

    fn set_arrangement(&mut self, surface: HWND, flag: ArrangementFlag, enabled: bool) -> Result<()> {
        match flag {
            ArrangementFlag::AutoArrange => unsafe {
                let style = GetWindowLongPtrW(surface, GWL_STYLE);
                let style = if enabled {
                    style | LVS_AUTOARRANGE
                } else {
                    style & !LVS_AUTOARRANGE
                };
                SetWindowLongPtrW(surface, GWL_STYLE, style);
            },
            ArrangementFlag::SnapToGrid => {
                let value = if enabled { LVS_EX_SNAPTOGRID } else { 0 };
                send(
                    surface,
                    LVM_SETEXTENDEDLISTVIEWSTYLE,
                    LVS_EX_SNAPTOGRID,
                    value as isize,
                );
            }
        }
        tracing::info!(?flag, enabled, "arrangement changed");
        Ok(())
    }
}
