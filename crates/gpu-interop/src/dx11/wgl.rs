//! A private WGL context on a hidden window.
//!
//! The interop surface draws with GL into D3D11 memory, so it needs a GL
//! context of its own rather than whatever the host has current.

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};
use windows::core::w;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Gdi::{GetDC, ReleaseDC, HDC};
use windows::Win32::Graphics::OpenGL::*;
use windows::Win32::UI::WindowsAndMessaging::{CreateWindowExW, DestroyWindow, WINDOW_EX_STYLE, WS_POPUP};

/// Hidden window + device context + GL rendering context.
pub struct WglContext {
    hwnd: HWND,
    hdc: HDC,
    hglrc: HGLRC,
}

impl WglContext {
    /// Create the window and context. Leaves the previously current context
    /// current.
    pub fn new() -> Result<Self> {
        unsafe {
            let hwnd = CreateWindowExW(
                WINDOW_EX_STYLE(0),
                w!("STATIC"),
                w!("frame-bridge"),
                WS_POPUP,
                0,
                0,
                1,
                1,
                None,
                None,
                None,
                None,
            )
            .context("CreateWindowExW failed for hidden GL window")?;

            let hdc = GetDC(Some(hwnd));
            if hdc.is_invalid() {
                let _ = DestroyWindow(hwnd);
                bail!("GetDC failed for hidden GL window");
            }

            let pfd = PIXELFORMATDESCRIPTOR {
                nSize: std::mem::size_of::<PIXELFORMATDESCRIPTOR>() as u16,
                nVersion: 1,
                dwFlags: PFD_DRAW_TO_WINDOW | PFD_SUPPORT_OPENGL | PFD_DOUBLEBUFFER,
                iPixelType: PFD_TYPE_RGBA,
                cColorBits: 32,
                cAlphaBits: 8,
                ..Default::default()
            };
            let format = ChoosePixelFormat(hdc, &pfd);
            if format == 0 {
                ReleaseDC(Some(hwnd), hdc);
                let _ = DestroyWindow(hwnd);
                bail!("ChoosePixelFormat found no RGBA8 format");
            }
            if let Err(e) = SetPixelFormat(hdc, format, &pfd) {
                ReleaseDC(Some(hwnd), hdc);
                let _ = DestroyWindow(hwnd);
                bail!("SetPixelFormat failed: {e}");
            }

            let hglrc = match wglCreateContext(hdc) {
                Ok(ctx) => ctx,
                Err(e) => {
                    ReleaseDC(Some(hwnd), hdc);
                    let _ = DestroyWindow(hwnd);
                    bail!("wglCreateContext failed: {e}");
                }
            };

            debug!("private WGL context created");
            Ok(Self { hwnd, hdc, hglrc })
        }
    }

    /// Make this context current until the returned guard drops.
    pub fn make_current(&self) -> Result<CurrentGuard> {
        unsafe {
            let previous = (wglGetCurrentDC(), wglGetCurrentContext());
            wglMakeCurrent(self.hdc, self.hglrc).context("wglMakeCurrent failed")?;
            Ok(CurrentGuard { previous })
        }
    }

    /// Whether this context is the one current on the calling thread.
    pub fn is_current(&self) -> bool {
        unsafe { wglGetCurrentContext() == self.hglrc }
    }
}

impl Drop for WglContext {
    fn drop(&mut self) {
        unsafe {
            if self.is_current() {
                let _ = wglMakeCurrent(HDC::default(), HGLRC::default());
            }
            if let Err(e) = wglDeleteContext(self.hglrc) {
                warn!("wglDeleteContext failed: {e}");
            }
            ReleaseDC(Some(self.hwnd), self.hdc);
            let _ = DestroyWindow(self.hwnd);
        }
    }
}

/// Restores the previously current WGL context on drop.
pub struct CurrentGuard {
    previous: (HDC, HGLRC),
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        unsafe {
            let (hdc, hglrc) = self.previous;
            if let Err(e) = wglMakeCurrent(hdc, hglrc) {
                warn!("failed to restore previous WGL context: {e}");
            }
        }
    }
}
