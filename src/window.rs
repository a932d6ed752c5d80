//! Window Module
//!
//! Win32 window hosting the swap chain. The window procedure only translates
//! messages into [`InputEvent`]s; the frame driver drains them at the start
//! of each frame.

use std::ffi::c_void;

use anyhow::{bail, Result};
use tracing::{debug, info, warn};
use windows::core::{HSTRING, PCWSTR};
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, RECT, WPARAM};
use windows::Win32::Graphics::Gdi::{GetMonitorInfoW, MonitorFromWindow, MONITORINFO, MONITOR_DEFAULTTONEAREST};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::Input::{
    GetRawInputData, RegisterRawInputDevices, HRAWINPUT, RAWINPUT, RAWINPUTDEVICE, RAWINPUTHEADER, RIDEV_INPUTSINK,
    RID_INPUT, RIM_TYPEMOUSE,
};
use windows::Win32::UI::WindowsAndMessaging::*;

use crate::gpu::Surface;
use crate::input::{EventQueue, InputEvent, Key};

const CLASS_NAME: &str = "RayVox-Engine";

struct WindowState {
    events: EventQueue,
    focused: bool,
    fullscreen: bool,
    /// Window rect saved when entering fullscreen.
    windowed_rect: RECT,
    closed: bool,
}

/// Win32 window that owns its message state.
pub struct Window {
    hwnd: HWND,
    state: *mut WindowState,
}

impl Window {
    /// Register the class, create a centered window with a `width` x `height`
    /// client area and start receiving raw mouse input.
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self> {
        let state = Box::into_raw(Box::new(WindowState {
            events: EventQueue::new(),
            focused: true,
            fullscreen: false,
            windowed_rect: RECT::default(),
            closed: false,
        }));

        match unsafe { create_window(title, width, height, state) } {
            Ok(hwnd) => {
                info!("Created window {:?} ({}x{})", title, width, height);
                Ok(Self { hwnd, state })
            }
            Err(e) => {
                drop(unsafe { Box::from_raw(state) });
                Err(e)
            }
        }
    }

    pub fn surface(&self) -> Surface {
        Surface::Win32 {
            hwnd: self.hwnd.0 as isize,
        }
    }

    /// Dispatch every pending message. Returns `false` once the window is gone.
    pub fn pump_messages(&mut self) -> bool {
        unsafe {
            let mut msg = MSG::default();
            while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
                if msg.message == WM_QUIT {
                    (*self.state).closed = true;
                    (*self.state).events.push(InputEvent::CloseRequested);
                    break;
                }
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
            !(*self.state).closed
        }
    }

    /// Events collected since the last frame.
    pub fn events(&mut self) -> &mut EventQueue {
        unsafe { &mut (*self.state).events }
    }

    pub fn client_size(&self) -> (u32, u32) {
        let mut rect = RECT::default();
        if unsafe { GetClientRect(self.hwnd, &mut rect) }.is_err() {
            return (0, 0);
        }
        (
            (rect.right - rect.left).max(0) as u32,
            (rect.bottom - rect.top).max(0) as u32,
        )
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        unsafe {
            SetWindowLongPtrW(self.hwnd, GWLP_USERDATA, 0);
            if let Err(e) = DestroyWindow(self.hwnd) {
                warn!("DestroyWindow failed: {}", e);
            }
            drop(Box::from_raw(self.state));
        }
    }
}

unsafe fn create_window(title: &str, width: u32, height: u32, state: *mut WindowState) -> Result<HWND> {
    let instance = GetModuleHandleW(None)?;
    let class_name = HSTRING::from(CLASS_NAME);

    let class = WNDCLASSEXW {
        cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
        style: CS_HREDRAW | CS_VREDRAW,
        lpfnWndProc: Some(window_proc),
        hInstance: instance.into(),
        hCursor: LoadCursorW(None, IDC_ARROW)?,
        lpszClassName: PCWSTR(class_name.as_ptr()),
        ..Default::default()
    };
    // Re-registering an existing class fails harmlessly on a second window.
    if RegisterClassExW(&class) == 0 {
        debug!("window class already registered");
    }

    let mut rect = RECT {
        left: 0,
        top: 0,
        right: width as i32,
        bottom: height as i32,
    };
    AdjustWindowRect(&mut rect, WS_OVERLAPPEDWINDOW, false)?;
    let window_width = rect.right - rect.left;
    let window_height = rect.bottom - rect.top;
    let x = ((GetSystemMetrics(SM_CXSCREEN) - window_width) / 2).max(0);
    let y = ((GetSystemMetrics(SM_CYSCREEN) - window_height) / 2).max(0);

    let hwnd = CreateWindowExW(
        WINDOW_EX_STYLE(0),
        PCWSTR(class_name.as_ptr()),
        &HSTRING::from(title),
        WS_OVERLAPPEDWINDOW,
        x,
        y,
        window_width,
        window_height,
        None,
        None,
        instance,
        Some(state as *const c_void),
    )?;

    let mouse = RAWINPUTDEVICE {
        usUsagePage: 0x01,
        usUsage: 0x02,
        dwFlags: RIDEV_INPUTSINK,
        hwndTarget: hwnd,
    };
    if let Err(e) = RegisterRawInputDevices(&[mouse], std::mem::size_of::<RAWINPUTDEVICE>() as u32) {
        bail!("failed to register raw mouse input: {}", e);
    }

    ShowCursor(false);
    let _ = ShowWindow(hwnd, SW_SHOW);
    Ok(hwnd)
}

unsafe fn state_for(hwnd: HWND) -> Option<&'static mut WindowState> {
    let ptr = GetWindowLongPtrW(hwnd, GWLP_USERDATA) as *mut WindowState;
    ptr.as_mut()
}

extern "system" fn window_proc(hwnd: HWND, message: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    unsafe {
        if message == WM_NCCREATE {
            let create = lparam.0 as *const CREATESTRUCTW;
            SetWindowLongPtrW(hwnd, GWLP_USERDATA, (*create).lpCreateParams as isize);
            return DefWindowProcW(hwnd, message, wparam, lparam);
        }

        let Some(state) = state_for(hwnd) else {
            return DefWindowProcW(hwnd, message, wparam, lparam);
        };

        match message {
            WM_INPUT => {
                if state.focused {
                    if let Some((dx, dy)) = read_mouse_motion(lparam) {
                        state.events.push(InputEvent::MouseMotion { dx, dy });
                    }
                    recenter_cursor(hwnd);
                }
                DefWindowProcW(hwnd, message, wparam, lparam)
            }
            WM_KEYDOWN | WM_SYSKEYDOWN => {
                let key = Key::from_virtual_key(wparam.0 as u32);
                match key {
                    Key::Escape => state.events.push(InputEvent::CloseRequested),
                    Key::F11 => toggle_fullscreen(hwnd, state),
                    _ => {}
                }
                state.events.push(InputEvent::Key { key, pressed: true });
                LRESULT(0)
            }
            WM_KEYUP | WM_SYSKEYUP => {
                state.events.push(InputEvent::Key {
                    key: Key::from_virtual_key(wparam.0 as u32),
                    pressed: false,
                });
                LRESULT(0)
            }
            // Keeps DefWindowProc from beeping on Alt+key.
            WM_SYSCHAR => LRESULT(0),
            WM_SIZE => {
                let mut rect = RECT::default();
                if GetClientRect(hwnd, &mut rect).is_ok() {
                    state.events.push(InputEvent::Resize {
                        width: (rect.right - rect.left).max(0) as u32,
                        height: (rect.bottom - rect.top).max(0) as u32,
                    });
                }
                LRESULT(0)
            }
            WM_SETFOCUS => {
                state.focused = true;
                state.events.push(InputEvent::Focus(true));
                LRESULT(0)
            }
            WM_KILLFOCUS => {
                state.focused = false;
                state.events.push(InputEvent::Focus(false));
                LRESULT(0)
            }
            WM_CLOSE | WM_DESTROY => {
                state.closed = true;
                state.events.push(InputEvent::CloseRequested);
                LRESULT(0)
            }
            _ => DefWindowProcW(hwnd, message, wparam, lparam),
        }
    }
}

unsafe fn read_mouse_motion(lparam: LPARAM) -> Option<(i32, i32)> {
    let mut raw = RAWINPUT::default();
    let mut size = std::mem::size_of::<RAWINPUT>() as u32;
    let read = GetRawInputData(
        HRAWINPUT(lparam.0 as *mut c_void),
        RID_INPUT,
        Some(&mut raw as *mut RAWINPUT as *mut c_void),
        &mut size,
        std::mem::size_of::<RAWINPUTHEADER>() as u32,
    );
    if read == u32::MAX || raw.header.dwType != RIM_TYPEMOUSE.0 {
        return None;
    }
    let mouse = raw.data.mouse;
    Some((mouse.lLastX, mouse.lLastY))
}

unsafe fn recenter_cursor(hwnd: HWND) {
    let mut rect = RECT::default();
    if GetWindowRect(hwnd, &mut rect).is_ok() {
        let _ = SetCursorPos((rect.left + rect.right) / 2, (rect.top + rect.bottom) / 2);
    }
}

/// Borderless fullscreen on the nearest monitor. The resulting `WM_SIZE`
/// reaches the frame driver as a regular resize.
unsafe fn toggle_fullscreen(hwnd: HWND, state: &mut WindowState) {
    state.fullscreen = !state.fullscreen;
    state.events.push(InputEvent::ToggleFullscreen);

    if state.fullscreen {
        let _ = GetWindowRect(hwnd, &mut state.windowed_rect);
        let style = WS_OVERLAPPEDWINDOW.0 & !(WS_CAPTION.0 | WS_SYSMENU.0 | WS_THICKFRAME.0 | WS_MINIMIZEBOX.0 | WS_MAXIMIZEBOX.0);
        SetWindowLongW(hwnd, GWL_STYLE, style as i32);

        let monitor = MonitorFromWindow(hwnd, MONITOR_DEFAULTTONEAREST);
        let mut info = MONITORINFO {
            cbSize: std::mem::size_of::<MONITORINFO>() as u32,
            ..Default::default()
        };
        if GetMonitorInfoW(monitor, &mut info).as_bool() {
            let area = info.rcMonitor;
            let _ = SetWindowPos(
                hwnd,
                HWND_TOP,
                area.left,
                area.top,
                area.right - area.left,
                area.bottom - area.top,
                SWP_FRAMECHANGED | SWP_NOACTIVATE,
            );
        }
        let _ = ShowWindow(hwnd, SW_MAXIMIZE);
    } else {
        SetWindowLongW(hwnd, GWL_STYLE, WS_OVERLAPPEDWINDOW.0 as i32);
        let area = state.windowed_rect;
        let _ = SetWindowPos(
            hwnd,
            HWND_NOTOPMOST,
            area.left,
            area.top,
            area.right - area.left,
            area.bottom - area.top,
            SWP_FRAMECHANGED | SWP_NOACTIVATE,
        );
        let _ = ShowWindow(hwnd, SW_NORMAL);
    }
}
