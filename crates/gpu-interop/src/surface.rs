//! Common interface for shareable offscreen render targets.

use std::time::Duration;

use gl::types::GLuint;

use crate::gl_api::GlApi;

/// Opaque platform identifier for a surface's GPU memory.
///
/// A consumer in another API (or process, for DXGI) opens the same memory
/// through this value without copying pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedHandle {
    /// Legacy DXGI shared resource handle (`IDXGIResource::GetSharedHandle`).
    Dxgi(usize),
    /// GL texture name, shareable within the owning context's share group.
    GlTexture(GLuint),
    /// Entry in a [`SharedTable`](crate::software::SharedTable).
    Software(u64),
}

impl SharedHandle {
    /// Raw integer value of the handle, as handed to the host.
    pub fn as_raw(&self) -> usize {
        match *self {
            SharedHandle::Dxgi(h) => h,
            SharedHandle::GlTexture(name) => name as usize,
            SharedHandle::Software(id) => id as usize,
        }
    }
}

/// Memory layout of a surface's pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra8888,
    Rgba8888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        4
    }

    /// Bytes in a tightly packed `width`×`height` image, or `None` if that
    /// does not fit in `usize`.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(self.bytes_per_pixel())
    }
}

/// Tunables shared by every surface manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceOptions {
    /// Upper bound on a single [`OffscreenSurface::finalize`] wait.
    pub fence_timeout: Duration,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self {
            fence_timeout: Duration::from_millis(500),
        }
    }
}

/// Failures reported by surface managers and surfaces.
#[derive(thiserror::Error, Debug)]
pub enum SurfaceError {
    #[error("surface creation failed: {0:#}")]
    Creation(anyhow::Error),

    #[error("surface used after teardown")]
    UseAfterTeardown,

    #[error("surface context lost")]
    ContextLost,

    #[error("GPU did not finish within {0:?}")]
    FenceTimeout(Duration),

    #[error("platform error: {0:#}")]
    Platform(#[from] anyhow::Error),
}

/// Allocates offscreen surfaces for one GPU device.
pub trait SurfaceManager {
    type Surface: OffscreenSurface;

    /// Allocate a `width`×`height` render target exported through a
    /// shareable handle.
    ///
    /// Fails with [`SurfaceError::Creation`] for zero dimensions or when the
    /// platform refuses the allocation.
    fn create(&mut self, width: u32, height: u32) -> Result<Self::Surface, SurfaceError>;
}

/// One offscreen render target plus the context that draws into it.
///
/// Implementations are single-threaded: the surface must be driven from the
/// thread that created it.
pub trait OffscreenSurface {
    type Gl: GlApi;

    /// Shareable handle of the backing memory. Stable for the surface's
    /// lifetime.
    fn handle(&self) -> SharedHandle;

    fn dimensions(&self) -> (u32, u32);

    fn format(&self) -> PixelFormat;

    /// Make the surface's context and framebuffer current, run `draw`, then
    /// restore whatever was current before, on every exit path.
    fn with_render_target<R>(&mut self, draw: impl FnOnce(&mut Self::Gl) -> R)
        -> Result<R, SurfaceError>;

    /// Block until queued GPU work on this surface has completed and its
    /// contents are visible through [`handle`](Self::handle).
    fn finalize(&mut self) -> Result<(), SurfaceError>;

    /// Whether the surface's GPU objects are still alive.
    fn is_valid(&self) -> bool {
        true
    }

    /// Release the shareable handle, framebuffer objects and context, in
    /// that order. Idempotent; later calls to [`finalize`](Self::finalize)
    /// or [`with_render_target`](Self::with_render_target) fail with
    /// [`SurfaceError::UseAfterTeardown`].
    fn teardown(&mut self);

    fn is_torn_down(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_len_is_checked() {
        assert_eq!(PixelFormat::Rgba8888.frame_len(3, 2), Some(24));
        assert_eq!(PixelFormat::Bgra8888.frame_len(0, 7), Some(0));
        assert_eq!(PixelFormat::Rgba8888.frame_len(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn raw_handle_values() {
        assert_eq!(SharedHandle::Dxgi(0x1234).as_raw(), 0x1234);
        assert_eq!(SharedHandle::GlTexture(7).as_raw(), 7);
        assert_eq!(SharedHandle::Software(42).as_raw(), 42);
    }
}
