//! Save and restore of the GL bindings a surface touches while drawing.

use gl::types::{GLenum, GLint, GLuint};

/// GL bindings captured before a surface binds its own framebuffer.
pub(crate) struct SavedGlState {
    unpack_buffer: GLint,
    array_buffer: GLint,
    draw_framebuffer: GLint,
    read_framebuffer: GLint,
    program: GLint,
    texture_2d: GLint,
    active_texture: GLint,
    vao: GLint,
    viewport: [GLint; 4],
}

impl SavedGlState {
    /// # Safety
    ///
    /// A GL context must be current and its function pointers loaded.
    pub(crate) unsafe fn save() -> Self {
        let mut s = Self {
            unpack_buffer: 0,
            array_buffer: 0,
            draw_framebuffer: 0,
            read_framebuffer: 0,
            program: 0,
            texture_2d: 0,
            active_texture: gl::TEXTURE0 as GLint,
            vao: 0,
            viewport: [0; 4],
        };
        gl::GetIntegerv(gl::PIXEL_UNPACK_BUFFER_BINDING, &mut s.unpack_buffer);
        gl::GetIntegerv(gl::ARRAY_BUFFER_BINDING, &mut s.array_buffer);
        gl::GetIntegerv(gl::DRAW_FRAMEBUFFER_BINDING, &mut s.draw_framebuffer);
        gl::GetIntegerv(gl::READ_FRAMEBUFFER_BINDING, &mut s.read_framebuffer);
        gl::GetIntegerv(gl::CURRENT_PROGRAM, &mut s.program);
        gl::GetIntegerv(gl::ACTIVE_TEXTURE, &mut s.active_texture);
        gl::ActiveTexture(gl::TEXTURE0);
        gl::GetIntegerv(gl::TEXTURE_BINDING_2D, &mut s.texture_2d);
        gl::ActiveTexture(s.active_texture as GLenum);
        if gl::BindVertexArray::is_loaded() {
            gl::GetIntegerv(gl::VERTEX_ARRAY_BINDING, &mut s.vao);
        }
        gl::GetIntegerv(gl::VIEWPORT, s.viewport.as_mut_ptr());
        s
    }

    /// # Safety
    ///
    /// Must run in the same context [`save`](Self::save) was called in.
    pub(crate) unsafe fn restore(&self) {
        gl::BindBuffer(gl::PIXEL_UNPACK_BUFFER, self.unpack_buffer as GLuint);
        gl::BindBuffer(gl::ARRAY_BUFFER, self.array_buffer as GLuint);
        gl::BindFramebuffer(gl::DRAW_FRAMEBUFFER, self.draw_framebuffer as GLuint);
        gl::BindFramebuffer(gl::READ_FRAMEBUFFER, self.read_framebuffer as GLuint);
        gl::UseProgram(self.program as GLuint);
        gl::ActiveTexture(gl::TEXTURE0);
        gl::BindTexture(gl::TEXTURE_2D, self.texture_2d as GLuint);
        gl::ActiveTexture(self.active_texture as GLenum);
        if gl::BindVertexArray::is_loaded() {
            gl::BindVertexArray(self.vao as GLuint);
        }
        gl::Viewport(
            self.viewport[0],
            self.viewport[1],
            self.viewport[2],
            self.viewport[3],
        );
    }
}

/// Binds `fbo` (and `vao`, when non-zero) for drawing and restores the saved
/// bindings when dropped.
pub(crate) struct BoundFramebuffer {
    saved: SavedGlState,
}

impl BoundFramebuffer {
    /// # Safety
    ///
    /// A GL context owning `fbo` and `vao` must be current and stay current
    /// until the guard drops.
    pub(crate) unsafe fn bind(fbo: GLuint, vao: GLuint, width: u32, height: u32) -> Self {
        let saved = SavedGlState::save();
        gl::BindFramebuffer(gl::FRAMEBUFFER, fbo);
        gl::BindBuffer(gl::PIXEL_UNPACK_BUFFER, 0);
        if vao != 0 {
            gl::BindVertexArray(vao);
        }
        gl::Viewport(0, 0, width as GLint, height as GLint);
        Self { saved }
    }
}

impl Drop for BoundFramebuffer {
    fn drop(&mut self) {
        unsafe { self.saved.restore() };
    }
}
