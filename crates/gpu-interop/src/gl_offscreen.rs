//! [`GlOffscreenSurface`]: an FBO-backed texture in the caller's GL context.
//!
//! No cross-API transfer happens here. The caller keeps its GL context
//! current on the render thread; the surface allocates an RGBA8 texture and
//! a framebuffer in that context and exports the texture name, which any
//! context in the same share group can sample. Finalization is a GL fence
//! waited on with a bounded timeout.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use gl::types::{GLenum, GLint, GLsync, GLuint};
use tracing::{debug, error, warn};

use crate::gl_state::BoundFramebuffer;
use crate::raw_gl::{load_gl, RawGl};
use crate::surface::{
    OffscreenSurface, PixelFormat, SharedHandle, SurfaceError, SurfaceManager, SurfaceOptions,
};

fn is_context_current() -> bool {
    unsafe { gl::GetString::is_loaded() && !gl::GetString(gl::VERSION).is_null() }
}

fn clear_gl_errors() {
    unsafe { while gl::GetError() != gl::NO_ERROR {} }
}

/// Allocates [`GlOffscreenSurface`]s in the GL context current at
/// [`create`](SurfaceManager::create) time.
#[derive(Debug, Default)]
pub struct GlOffscreenManager {
    options: SurfaceOptions,
}

impl GlOffscreenManager {
    pub fn new(options: SurfaceOptions) -> Self {
        Self { options }
    }
}

impl SurfaceManager for GlOffscreenManager {
    type Surface = GlOffscreenSurface;

    fn create(&mut self, width: u32, height: u32) -> Result<GlOffscreenSurface, SurfaceError> {
        if width == 0 || height == 0 {
            return Err(SurfaceError::Creation(anyhow!(
                "invalid surface size {width}x{height}"
            )));
        }
        load_gl();
        if !is_context_current() {
            return Err(SurfaceError::Creation(anyhow!("no current GL context")));
        }
        GlOffscreenSurface::new(width, height, self.options).map_err(SurfaceError::Creation)
    }
}

/// RGBA8 texture + framebuffer exported as [`SharedHandle::GlTexture`].
pub struct GlOffscreenSurface {
    texture: GLuint,
    fbo: GLuint,
    /// Non-zero only when vertex array objects are available.
    vao: GLuint,
    width: u32,
    height: u32,
    options: SurfaceOptions,
    torn_down: bool,
}

impl GlOffscreenSurface {
    fn new(width: u32, height: u32, options: SurfaceOptions) -> Result<Self> {
        clear_gl_errors();

        let mut max_size: GLint = 0;
        unsafe { gl::GetIntegerv(gl::MAX_TEXTURE_SIZE, &mut max_size) };
        if max_size > 0 && (width > max_size as u32 || height > max_size as u32) {
            bail!("{width}x{height} exceeds GL_MAX_TEXTURE_SIZE {max_size}");
        }

        let mut surface = Self {
            texture: 0,
            fbo: 0,
            vao: 0,
            width,
            height,
            options,
            torn_down: false,
        };

        unsafe {
            let mut prev_texture: GLint = 0;
            let mut prev_fbo: GLint = 0;
            gl::GetIntegerv(gl::TEXTURE_BINDING_2D, &mut prev_texture);
            gl::GetIntegerv(gl::FRAMEBUFFER_BINDING, &mut prev_fbo);

            gl::GenTextures(1, &mut surface.texture);
            gl::BindTexture(gl::TEXTURE_2D, surface.texture);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RGBA8 as GLint,
                width as i32,
                height as i32,
                0,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                std::ptr::null(),
            );
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);

            gl::GenFramebuffers(1, &mut surface.fbo);
            gl::BindFramebuffer(gl::FRAMEBUFFER, surface.fbo);
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                surface.texture,
                0,
            );
            let status = gl::CheckFramebufferStatus(gl::FRAMEBUFFER);

            gl::BindTexture(gl::TEXTURE_2D, prev_texture as GLuint);
            gl::BindFramebuffer(gl::FRAMEBUFFER, prev_fbo as GLuint);

            if gl::GenVertexArrays::is_loaded() {
                gl::GenVertexArrays(1, &mut surface.vao);
            }

            if status != gl::FRAMEBUFFER_COMPLETE {
                // Drop releases what was allocated so far.
                bail!("offscreen framebuffer incomplete (status 0x{status:04X})");
            }
            let err = gl::GetError();
            if err != gl::NO_ERROR {
                bail!("GL error 0x{err:04X} while allocating {width}x{height} surface");
            }
        }

        debug!(
            texture = surface.texture,
            fbo = surface.fbo,
            width,
            height,
            "GL offscreen surface created"
        );
        Ok(surface)
    }

    fn wait_fence(fence: GLsync, timeout: Duration) -> GLenum {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        unsafe {
            let status = gl::ClientWaitSync(fence, gl::SYNC_FLUSH_COMMANDS_BIT, nanos);
            gl::DeleteSync(fence);
            status
        }
    }
}

impl OffscreenSurface for GlOffscreenSurface {
    type Gl = RawGl;

    fn handle(&self) -> SharedHandle {
        SharedHandle::GlTexture(self.texture)
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::Rgba8888
    }

    fn with_render_target<R>(
        &mut self,
        draw: impl FnOnce(&mut RawGl) -> R,
    ) -> Result<R, SurfaceError> {
        if self.torn_down {
            return Err(SurfaceError::UseAfterTeardown);
        }
        if !is_context_current() {
            return Err(SurfaceError::ContextLost);
        }
        let _bound = unsafe { BoundFramebuffer::bind(self.fbo, self.vao, self.width, self.height) };
        let mut gl = RawGl::new();
        Ok(draw(&mut gl))
    }

    fn finalize(&mut self) -> Result<(), SurfaceError> {
        if self.torn_down {
            return Err(SurfaceError::UseAfterTeardown);
        }
        if !is_context_current() {
            return Err(SurfaceError::ContextLost);
        }
        let fence = unsafe { gl::FenceSync(gl::SYNC_GPU_COMMANDS_COMPLETE, 0) };
        if fence.is_null() {
            // No sync objects: fall back to a full pipeline drain.
            unsafe { gl::Finish() };
            return Ok(());
        }
        match Self::wait_fence(fence, self.options.fence_timeout) {
            gl::ALREADY_SIGNALED | gl::CONDITION_SATISFIED => Ok(()),
            gl::TIMEOUT_EXPIRED => {
                warn!(timeout = ?self.options.fence_timeout, "GL fence wait timed out");
                Err(SurfaceError::FenceTimeout(self.options.fence_timeout))
            }
            status => {
                error!("glClientWaitSync failed with status 0x{status:04X}");
                Err(SurfaceError::Platform(anyhow!(
                    "glClientWaitSync failed (0x{status:04X})"
                )))
            }
        }
    }

    fn is_valid(&self) -> bool {
        !self.torn_down
            && is_context_current()
            && unsafe { gl::IsFramebuffer(self.fbo) != 0 && gl::IsTexture(self.texture) != 0 }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if !is_context_current() {
            warn!("GL context gone before teardown; leaking surface objects with it");
            return;
        }
        unsafe {
            // Shareable texture first, then the framebuffer that referenced it.
            if self.texture != 0 {
                gl::DeleteTextures(1, &self.texture);
                self.texture = 0;
            }
            if self.fbo != 0 {
                gl::DeleteFramebuffers(1, &self.fbo);
                self.fbo = 0;
            }
            if self.vao != 0 {
                gl::DeleteVertexArrays(1, &self.vao);
                self.vao = 0;
            }
        }
        debug!("GL offscreen surface torn down");
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

impl Drop for GlOffscreenSurface {
    fn drop(&mut self) {
        self.teardown();
    }
}
