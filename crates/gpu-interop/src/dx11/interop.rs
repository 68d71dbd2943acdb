//! DXGI shared-handle surface rendered by GL via `WGL_NV_DX_interop2`.
//!
//! The backing store is a D3D11 `B8G8R8A8_UNORM` texture created with
//! `D3D11_RESOURCE_MISC_SHARED`; its legacy DXGI shared handle is what the
//! compositor opens. A private WGL context registers the same texture as a
//! GL texture, attaches it to a framebuffer and draws into it while the
//! interop object is locked.

use std::ffi::{c_void, CStr};

use anyhow::{anyhow, bail, Context, Result};
use gl::types::{GLenum, GLint, GLuint};
use tracing::{debug, error, warn};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::IDXGIResource;
use windows::Win32::Graphics::Gdi::HDC;
use windows::Win32::Graphics::OpenGL::*;

use super::device::{create_event_query, flush_and_wait, Dx11Device};
use super::wgl::WglContext;
use crate::gl_state::BoundFramebuffer;
use crate::raw_gl::{load_gl, RawGl};
use crate::surface::{
    OffscreenSurface, PixelFormat, SharedHandle, SurfaceError, SurfaceManager, SurfaceOptions,
};

const WGL_ACCESS_READ_WRITE_NV: GLenum = 0x0001;

/// D3D11 limit on either edge of a 2D texture.
const MAX_TEXTURE_DIMENSION: u32 = D3D11_REQ_TEXTURE2D_U_OR_V_DIMENSION;

type WglDxOpenDeviceNv = unsafe extern "system" fn(dx_device: *mut c_void) -> *mut c_void;
type WglDxCloseDeviceNv = unsafe extern "system" fn(h_device: *mut c_void) -> i32;
type WglDxRegisterObjectNv = unsafe extern "system" fn(
    h_device: *mut c_void,
    dx_object: *mut c_void,
    name: GLuint,
    obj_type: GLenum,
    access: GLenum,
) -> *mut c_void;
type WglDxUnregisterObjectNv =
    unsafe extern "system" fn(h_device: *mut c_void, h_object: *mut c_void) -> i32;
type WglDxLockObjectsNv = unsafe extern "system" fn(
    h_device: *mut c_void,
    count: GLint,
    h_objects: *mut *mut c_void,
) -> i32;
type WglGetExtensionsStringArb = unsafe extern "system" fn(hdc: HDC) -> *const i8;

/// `WGL_NV_DX_interop2` entry points.
#[derive(Clone, Copy)]
struct WglInteropFunctions {
    open_device: WglDxOpenDeviceNv,
    close_device: WglDxCloseDeviceNv,
    register_object: WglDxRegisterObjectNv,
    unregister_object: WglDxUnregisterObjectNv,
    lock_objects: WglDxLockObjectsNv,
    unlock_objects: WglDxLockObjectsNv,
}

/// Resolve a WGL extension entry point in the current context.
unsafe fn wgl_proc(name: &CStr) -> Result<*const c_void> {
    let addr = wglGetProcAddress(windows::core::PCSTR(name.as_ptr() as *const u8))
        .ok_or_else(|| anyhow!("{} is not exported by the driver", name.to_string_lossy()))?;
    Ok(addr as usize as *const c_void)
}

impl WglInteropFunctions {
    /// Load the interop entry points. A GL context must be current.
    fn load() -> Result<Self> {
        if !Self::is_available() {
            bail!("WGL_NV_DX_interop2 is not supported by the current GL driver");
        }
        unsafe {
            Ok(Self {
                open_device: std::mem::transmute::<*const c_void, WglDxOpenDeviceNv>(wgl_proc(
                    c"wglDXOpenDeviceNV",
                )?),
                close_device: std::mem::transmute::<*const c_void, WglDxCloseDeviceNv>(wgl_proc(
                    c"wglDXCloseDeviceNV",
                )?),
                register_object: std::mem::transmute::<*const c_void, WglDxRegisterObjectNv>(
                    wgl_proc(c"wglDXRegisterObjectNV")?,
                ),
                unregister_object: std::mem::transmute::<*const c_void, WglDxUnregisterObjectNv>(
                    wgl_proc(c"wglDXUnregisterObjectNV")?,
                ),
                lock_objects: std::mem::transmute::<*const c_void, WglDxLockObjectsNv>(wgl_proc(
                    c"wglDXLockObjectsNV",
                )?),
                unlock_objects: std::mem::transmute::<*const c_void, WglDxLockObjectsNv>(
                    wgl_proc(c"wglDXUnlockObjectsNV")?,
                ),
            })
        }
    }

    /// Whether the current context advertises `WGL_NV_DX_interop2`.
    fn is_available() -> bool {
        unsafe {
            let Ok(addr) = wgl_proc(c"wglGetExtensionsStringARB") else {
                return false;
            };
            let get_ext = std::mem::transmute::<*const c_void, WglGetExtensionsStringArb>(addr);
            let ext = get_ext(wglGetCurrentDC());
            !ext.is_null() && CStr::from_ptr(ext).to_string_lossy().contains("WGL_NV_DX_interop2")
        }
    }
}

/// An open `wglDXOpenDeviceNV` handle, closed on drop.
struct InteropDevice {
    close: WglDxCloseDeviceNv,
    raw: *mut c_void,
}

impl InteropDevice {
    /// Open `dx_device` for GL interop. A GL context must be current.
    unsafe fn open(fns: &WglInteropFunctions, dx_device: *mut c_void) -> Option<Self> {
        let raw = (fns.open_device)(dx_device);
        (!raw.is_null()).then_some(Self {
            close: fns.close_device,
            raw,
        })
    }

    fn as_raw(&self) -> *mut c_void {
        self.raw
    }
}

impl Drop for InteropDevice {
    fn drop(&mut self) {
        if unsafe { (self.close)(self.raw) } == 0 {
            warn!("wglDXCloseDeviceNV failed");
        }
    }
}

/// Holds a registered interop object locked for GL access; flushes GL and
/// unlocks on drop.
struct InteropLock {
    unlock: WglDxLockObjectsNv,
    device: *mut c_void,
    object: *mut c_void,
}

impl InteropLock {
    unsafe fn acquire(fns: &WglInteropFunctions, device: *mut c_void, object: *mut c_void) -> Option<Self> {
        let mut objects = [object];
        if (fns.lock_objects)(device, 1, objects.as_mut_ptr()) == 0 {
            return None;
        }
        Some(Self {
            unlock: fns.unlock_objects,
            device,
            object,
        })
    }
}

impl Drop for InteropLock {
    fn drop(&mut self) {
        unsafe {
            gl::Flush();
            let mut objects = [self.object];
            if (self.unlock)(self.device, 1, objects.as_mut_ptr()) == 0 {
                warn!("wglDXUnlockObjectsNV failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dx11SurfaceManager
// ---------------------------------------------------------------------------

/// Allocates DXGI-shared [`Dx11Surface`]s on one D3D11 device.
pub struct Dx11SurfaceManager {
    device: Dx11Device,
    options: SurfaceOptions,
}

impl Dx11SurfaceManager {
    pub fn new(options: SurfaceOptions) -> Result<Self> {
        Ok(Self {
            device: Dx11Device::new()?,
            options,
        })
    }
}

impl SurfaceManager for Dx11SurfaceManager {
    type Surface = Dx11Surface;

    fn create(&mut self, width: u32, height: u32) -> Result<Dx11Surface, SurfaceError> {
        if width == 0 || height == 0 {
            return Err(SurfaceError::Creation(anyhow!(
                "invalid surface size {width}x{height}"
            )));
        }
        if width > MAX_TEXTURE_DIMENSION || height > MAX_TEXTURE_DIMENSION {
            return Err(SurfaceError::Creation(anyhow!(
                "{width}x{height} exceeds the D3D11 limit of {MAX_TEXTURE_DIMENSION}"
            )));
        }
        Dx11Surface::new(&self.device, width, height, self.options).map_err(SurfaceError::Creation)
    }
}

// ---------------------------------------------------------------------------
// Dx11Surface
// ---------------------------------------------------------------------------

/// D3D11 texture shared through a DXGI handle and drawn by a private GL
/// context.
pub struct Dx11Surface {
    /// Cloned COM references to the manager's device.
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    query: ID3D11Query,
    d3d_texture: Option<ID3D11Texture2D>,
    shared_handle: usize,
    wgl: Option<WglContext>,
    fns: WglInteropFunctions,
    /// `None` once released.
    interop_device: Option<InteropDevice>,
    interop_object: *mut c_void,
    gl_texture: GLuint,
    fbo: GLuint,
    width: u32,
    height: u32,
    options: SurfaceOptions,
}

impl Dx11Surface {
    fn new(device: &Dx11Device, width: u32, height: u32, options: SurfaceOptions) -> Result<Self> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: D3D11_RESOURCE_MISC_SHARED.0 as u32,
        };
        let mut texture = None;
        unsafe {
            device
                .device()
                .CreateTexture2D(&desc, None, Some(&mut texture as *mut _))
        }
        .with_context(|| format!("CreateTexture2D failed for {width}x{height} shared texture"))?;
        let texture = texture.ok_or_else(|| anyhow!("CreateTexture2D returned no texture"))?;

        let resource: IDXGIResource = texture.cast().context("texture is not a DXGI resource")?;
        let handle = unsafe { resource.GetSharedHandle() }.context("GetSharedHandle failed")?;
        if handle.is_invalid() {
            bail!("DXGI returned a null shared handle");
        }

        let query = create_event_query(device.device())?;

        let wgl = WglContext::new()?;
        let _current = wgl.make_current()?;
        load_gl();
        let fns = WglInteropFunctions::load()?;

        let interop_device = unsafe { InteropDevice::open(&fns, device.device().as_raw()) }
            .ok_or_else(|| anyhow!("wglDXOpenDeviceNV failed"))?;
        let device_raw = interop_device.as_raw();

        // From here on Drop unwinds whatever has been created.
        let mut surface = Self {
            device: device.device().clone(),
            context: device.context().clone(),
            query,
            d3d_texture: Some(texture),
            shared_handle: handle.0 as usize,
            wgl: None,
            fns,
            interop_device: Some(interop_device),
            interop_object: std::ptr::null_mut(),
            gl_texture: 0,
            fbo: 0,
            width,
            height,
            options,
        };

        unsafe {
            gl::GenTextures(1, &mut surface.gl_texture);
            if surface.gl_texture == 0 {
                bail!("failed to generate a GL texture name for interop");
            }
            let d3d_raw = surface
                .d3d_texture
                .as_ref()
                .map_or(std::ptr::null_mut(), |t| t.as_raw());
            surface.interop_object = (fns.register_object)(
                device_raw,
                d3d_raw,
                surface.gl_texture,
                gl::TEXTURE_2D,
                WGL_ACCESS_READ_WRITE_NV,
            );
            if surface.interop_object.is_null() {
                error!("wglDXRegisterObjectNV failed for {width}x{height} texture");
                bail!("wglDXRegisterObjectNV failed");
            }

            gl::GenFramebuffers(1, &mut surface.fbo);
            let lock = InteropLock::acquire(&fns, device_raw, surface.interop_object)
                .ok_or_else(|| anyhow!("wglDXLockObjectsNV failed"))?;
            gl::BindFramebuffer(gl::FRAMEBUFFER, surface.fbo);
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                surface.gl_texture,
                0,
            );
            let status = gl::CheckFramebufferStatus(gl::FRAMEBUFFER);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
            drop(lock);
            if status != gl::FRAMEBUFFER_COMPLETE {
                bail!("interop framebuffer incomplete (status 0x{status:04X})");
            }
        }

        drop(_current);
        surface.wgl = Some(wgl);
        debug!(
            handle = surface.shared_handle,
            width, height, "DXGI shared surface created"
        );
        Ok(surface)
    }

    /// Release GL and interop objects. The owning context must be current.
    unsafe fn release_gl_objects(&mut self) {
        if !self.interop_object.is_null() {
            if let Some(device) = &self.interop_device {
                (self.fns.unregister_object)(device.as_raw(), self.interop_object);
            }
            self.interop_object = std::ptr::null_mut();
        }
        // The shared handle dies with the last reference to the texture.
        self.d3d_texture = None;
        if self.fbo != 0 {
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
            gl::DeleteFramebuffers(1, &self.fbo);
            self.fbo = 0;
        }
        if self.gl_texture != 0 {
            gl::DeleteTextures(1, &self.gl_texture);
            self.gl_texture = 0;
        }
        self.interop_device = None;
    }

    /// Borrow the shared D3D11 texture.
    pub fn d3d_texture(&self) -> Option<&ID3D11Texture2D> {
        self.d3d_texture.as_ref()
    }
}

impl OffscreenSurface for Dx11Surface {
    type Gl = RawGl;

    fn handle(&self) -> SharedHandle {
        SharedHandle::Dxgi(self.shared_handle)
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::Bgra8888
    }

    fn with_render_target<R>(
        &mut self,
        draw: impl FnOnce(&mut RawGl) -> R,
    ) -> Result<R, SurfaceError> {
        let wgl = self.wgl.as_ref().ok_or(SurfaceError::UseAfterTeardown)?;
        let _current = wgl.make_current()?;
        let device = self
            .interop_device
            .as_ref()
            .ok_or(SurfaceError::UseAfterTeardown)?;
        let _lock = unsafe { InteropLock::acquire(&self.fns, device.as_raw(), self.interop_object) }
            .ok_or(SurfaceError::ContextLost)?;
        let _bound = unsafe { BoundFramebuffer::bind(self.fbo, 0, self.width, self.height) };
        let mut gl = RawGl::new();
        Ok(draw(&mut gl))
    }

    fn finalize(&mut self) -> Result<(), SurfaceError> {
        if self.wgl.is_none() {
            return Err(SurfaceError::UseAfterTeardown);
        }
        // Unlocking already ordered GL's writes before later D3D11 work; the
        // event query waits for that work to retire.
        if flush_and_wait(&self.context, &self.query, self.options.fence_timeout) {
            Ok(())
        } else {
            warn!(timeout = ?self.options.fence_timeout, "D3D11 event query timed out");
            Err(SurfaceError::FenceTimeout(self.options.fence_timeout))
        }
    }

    fn is_valid(&self) -> bool {
        self.wgl.is_some() && unsafe { self.device.GetDeviceRemovedReason() }.is_ok()
    }

    fn teardown(&mut self) {
        let Some(wgl) = self.wgl.take() else {
            return;
        };
        match wgl.make_current() {
            Ok(_current) => unsafe { self.release_gl_objects() },
            Err(e) => {
                warn!("cannot make interop context current for teardown: {e:#}");
                self.d3d_texture = None;
                // Closing needs the context; the device goes with it.
                std::mem::forget(self.interop_device.take());
            }
        }
        // Context last.
        drop(wgl);
        debug!(handle = self.shared_handle, "DXGI shared surface torn down");
    }

    fn is_torn_down(&self) -> bool {
        self.wgl.is_none()
    }
}

impl Drop for Dx11Surface {
    fn drop(&mut self) {
        if self.wgl.is_some() {
            self.teardown();
        } else if self.interop_device.is_some() {
            // Construction failed after the interop device opened; the
            // private context is still current in `Dx11Surface::new`.
            unsafe { self.release_gl_objects() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // The fake driver hands the D3D device pointer back as the interop
    // device; tests pass a counter there and `close` bumps it.
    unsafe extern "system" fn open_echo(dx_device: *mut c_void) -> *mut c_void {
        dx_device
    }

    unsafe extern "system" fn open_refused(_dx_device: *mut c_void) -> *mut c_void {
        std::ptr::null_mut()
    }

    unsafe extern "system" fn close_counting(h_device: *mut c_void) -> i32 {
        (*(h_device as *const AtomicUsize)).fetch_add(1, Ordering::SeqCst);
        1
    }

    unsafe extern "system" fn register_none(
        _h_device: *mut c_void,
        _dx_object: *mut c_void,
        _name: GLuint,
        _obj_type: GLenum,
        _access: GLenum,
    ) -> *mut c_void {
        std::ptr::null_mut()
    }

    unsafe extern "system" fn unregister_ok(_h_device: *mut c_void, _h_object: *mut c_void) -> i32 {
        1
    }

    unsafe extern "system" fn lock_ok(
        _h_device: *mut c_void,
        _count: GLint,
        _h_objects: *mut *mut c_void,
    ) -> i32 {
        1
    }

    fn fake_fns(open_device: WglDxOpenDeviceNv) -> WglInteropFunctions {
        WglInteropFunctions {
            open_device,
            close_device: close_counting,
            register_object: register_none,
            unregister_object: unregister_ok,
            lock_objects: lock_ok,
            unlock_objects: lock_ok,
        }
    }

    fn counter_ptr(counter: &AtomicUsize) -> *mut c_void {
        counter as *const AtomicUsize as *mut c_void
    }

    #[test]
    fn interop_device_closes_once_on_drop() {
        let closes = AtomicUsize::new(0);
        let device = unsafe { InteropDevice::open(&fake_fns(open_echo), counter_ptr(&closes)) }
            .expect("fake device opens");
        assert_eq!(device.as_raw(), counter_ptr(&closes));
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        drop(device);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refused_open_has_nothing_to_close() {
        let closes = AtomicUsize::new(0);
        let device = unsafe { InteropDevice::open(&fake_fns(open_refused), counter_ptr(&closes)) };
        assert!(device.is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failure_after_open_still_closes_the_device() {
        fn build(fns: &WglInteropFunctions, dx_device: *mut c_void) -> Result<()> {
            let _device = unsafe { InteropDevice::open(fns, dx_device) }
                .ok_or_else(|| anyhow!("wglDXOpenDeviceNV failed"))?;
            bail!("CreateQuery failed")
        }

        let closes = AtomicUsize::new(0);
        assert!(build(&fake_fns(open_echo), counter_ptr(&closes)).is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
