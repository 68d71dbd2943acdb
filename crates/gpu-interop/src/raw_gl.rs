//! [`GlApi`] over the `gl` crate's global function pointers.

use std::ffi::CString;
use std::sync::Once;

use gl::types::{GLchar, GLenum, GLint, GLsizei, GLsizeiptr, GLuint};
use tracing::warn;

use crate::gl_api::{GlApi, ShaderStage};
use crate::surface::PixelFormat;

static GL_INIT_ONCE: Once = Once::new();

/// Load GL function pointers exactly once via `gl_loader`.
///
/// Must be called with a GL context current on the calling thread so that
/// extension entry points resolve.
pub fn load_gl() {
    GL_INIT_ONCE.call_once(|| {
        gl_loader::init_gl();
        gl::load_with(|s| gl_loader::get_proc_address(s).cast());
    });
}

/// Pass-through [`GlApi`] for the GL context current on this thread.
///
/// Only constructed by surface managers while they hold their context
/// current, so every call lands in the surface's context.
#[derive(Debug)]
pub struct RawGl {
    _private: (),
}

impl RawGl {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

fn info_log(
    object: GLuint,
    get_iv: unsafe fn(GLuint, GLenum, *mut GLint),
    get_log: unsafe fn(GLuint, GLsizei, *mut GLsizei, *mut GLchar),
) -> String {
    unsafe {
        let mut len: GLint = 0;
        get_iv(object, gl::INFO_LOG_LENGTH, &mut len);
        if len <= 0 {
            return String::new();
        }
        let mut buf = vec![0u8; len as usize];
        let mut written: GLsizei = 0;
        get_log(object, len, &mut written, buf.as_mut_ptr().cast());
        buf.truncate(written.max(0) as usize);
        String::from_utf8_lossy(&buf).trim_end().to_string()
    }
}

unsafe fn get_shader_iv(shader: GLuint, pname: GLenum, out: *mut GLint) {
    gl::GetShaderiv(shader, pname, out)
}

unsafe fn get_shader_log(shader: GLuint, len: GLsizei, written: *mut GLsizei, buf: *mut GLchar) {
    gl::GetShaderInfoLog(shader, len, written, buf)
}

unsafe fn get_program_iv(program: GLuint, pname: GLenum, out: *mut GLint) {
    gl::GetProgramiv(program, pname, out)
}

unsafe fn get_program_log(program: GLuint, len: GLsizei, written: *mut GLsizei, buf: *mut GLchar) {
    gl::GetProgramInfoLog(program, len, written, buf)
}

impl GlApi for RawGl {
    fn create_shader(&mut self, stage: ShaderStage) -> GLuint {
        unsafe { gl::CreateShader(stage.gl_enum()) }
    }

    fn compile_shader(&mut self, shader: GLuint, source: &str) -> Result<(), String> {
        let source = CString::new(source).map_err(|_| "shader source contains NUL".to_string())?;
        let mut status: GLint = 0;
        unsafe {
            gl::ShaderSource(shader, 1, &source.as_ptr(), std::ptr::null());
            gl::CompileShader(shader);
            gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut status);
        }
        if status == gl::TRUE as GLint {
            Ok(())
        } else {
            Err(info_log(shader, get_shader_iv, get_shader_log))
        }
    }

    fn delete_shader(&mut self, shader: GLuint) {
        if shader != 0 {
            unsafe { gl::DeleteShader(shader) };
        }
    }

    fn create_program(&mut self) -> GLuint {
        unsafe { gl::CreateProgram() }
    }

    fn attach_shader(&mut self, program: GLuint, shader: GLuint) {
        unsafe { gl::AttachShader(program, shader) };
    }

    fn link_program(&mut self, program: GLuint) -> Result<(), String> {
        let mut status: GLint = 0;
        unsafe {
            gl::LinkProgram(program);
            gl::GetProgramiv(program, gl::LINK_STATUS, &mut status);
        }
        if status == gl::TRUE as GLint {
            Ok(())
        } else {
            Err(info_log(program, get_program_iv, get_program_log))
        }
    }

    fn delete_program(&mut self, program: GLuint) {
        if program != 0 {
            unsafe { gl::DeleteProgram(program) };
        }
    }

    fn attrib_location(&mut self, program: GLuint, name: &str) -> Option<GLuint> {
        let name = CString::new(name).ok()?;
        let loc = unsafe { gl::GetAttribLocation(program, name.as_ptr()) };
        (loc >= 0).then_some(loc as GLuint)
    }

    fn uniform_location(&mut self, program: GLuint, name: &str) -> Option<GLint> {
        let name = CString::new(name).ok()?;
        let loc = unsafe { gl::GetUniformLocation(program, name.as_ptr()) };
        (loc >= 0).then_some(loc)
    }

    fn use_program(&mut self, program: GLuint) {
        unsafe { gl::UseProgram(program) };
    }

    fn uniform_1i(&mut self, location: GLint, value: i32) {
        unsafe { gl::Uniform1i(location, value) };
    }

    fn clear_color_buffer(&mut self, rgba: [f32; 4]) {
        unsafe {
            gl::ClearColor(rgba[0], rgba[1], rgba[2], rgba[3]);
            gl::Clear(gl::COLOR_BUFFER_BIT);
        }
    }

    fn create_texture(&mut self) -> GLuint {
        let mut tex: GLuint = 0;
        unsafe { gl::GenTextures(1, &mut tex) };
        tex
    }

    fn delete_texture(&mut self, texture: GLuint) {
        if texture != 0 {
            unsafe { gl::DeleteTextures(1, &texture) };
        }
    }

    fn active_texture(&mut self, unit: u32) {
        unsafe { gl::ActiveTexture(gl::TEXTURE0 + unit) };
    }

    fn bind_texture_2d(&mut self, texture: GLuint) {
        unsafe { gl::BindTexture(gl::TEXTURE_2D, texture) };
    }

    fn tex_parameter(&mut self, pname: GLenum, value: GLenum) {
        unsafe { gl::TexParameteri(gl::TEXTURE_2D, pname, value as GLint) };
    }

    fn tex_image_2d_rgba(&mut self, width: u32, height: u32, pixels: &[u8]) {
        let Some(expected) = PixelFormat::Rgba8888.frame_len(width, height) else {
            warn!(width, height, "texture upload rejected: size overflows");
            return;
        };
        if pixels.len() < expected {
            // GL would read past the end of the slice.
            warn!(
                len = pixels.len(),
                expected, "texture upload rejected: buffer too short"
            );
            return;
        }
        unsafe {
            gl::PixelStorei(gl::UNPACK_ALIGNMENT, 4);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RGBA as GLint,
                width as GLsizei,
                height as GLsizei,
                0,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                pixels.as_ptr().cast(),
            );
        }
    }

    fn create_buffer(&mut self) -> GLuint {
        let mut buf: GLuint = 0;
        unsafe { gl::GenBuffers(1, &mut buf) };
        buf
    }

    fn delete_buffer(&mut self, buffer: GLuint) {
        if buffer != 0 {
            unsafe { gl::DeleteBuffers(1, &buffer) };
        }
    }

    fn bind_array_buffer(&mut self, buffer: GLuint) {
        unsafe { gl::BindBuffer(gl::ARRAY_BUFFER, buffer) };
    }

    fn array_buffer_data(&mut self, data: &[f32]) {
        unsafe {
            gl::BufferData(
                gl::ARRAY_BUFFER,
                std::mem::size_of_val(data) as GLsizeiptr,
                data.as_ptr().cast(),
                gl::STREAM_DRAW,
            );
        }
    }

    fn vertex_attrib_pointer(
        &mut self,
        index: GLuint,
        components: i32,
        stride_bytes: i32,
        offset_bytes: usize,
    ) {
        unsafe {
            gl::VertexAttribPointer(
                index,
                components,
                gl::FLOAT,
                gl::FALSE,
                stride_bytes,
                offset_bytes as *const _,
            );
        }
    }

    fn enable_vertex_attrib_array(&mut self, index: GLuint) {
        unsafe { gl::EnableVertexAttribArray(index) };
    }

    fn disable_vertex_attrib_array(&mut self, index: GLuint) {
        unsafe { gl::DisableVertexAttribArray(index) };
    }

    fn draw_triangle_strip(&mut self, first: i32, count: i32) {
        unsafe { gl::DrawArrays(gl::TRIANGLE_STRIP, first, count) };
    }

    fn take_error(&mut self) -> Option<GLenum> {
        let err = unsafe { gl::GetError() };
        (err != gl::NO_ERROR).then_some(err)
    }
}
