//! The GL command surface used by the frame pipeline.
//!
//! [`GlApi`] is the OpenGL ES 2.0 subset needed to compile a program, upload
//! a texture and draw a textured quad. Object names and enum values follow
//! the `gl` crate's types and constants so that [`RawGl`](crate::RawGl) is a
//! thin pass-through, while the software backend interprets the same calls
//! on the CPU.

use gl::types::{GLenum, GLint, GLuint};

/// Shader pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    /// The `GL_*_SHADER` enum for this stage.
    pub fn gl_enum(self) -> GLenum {
        match self {
            ShaderStage::Vertex => gl::VERTEX_SHADER,
            ShaderStage::Fragment => gl::FRAGMENT_SHADER,
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// GL command surface for a context that is current on the calling thread.
///
/// Creation calls return `0` when the driver refuses to allocate a name,
/// mirroring the GL convention. Compile and link report the driver's info
/// log on failure.
pub trait GlApi {
    // -- Shaders and programs -------------------------------------------------

    fn create_shader(&mut self, stage: ShaderStage) -> GLuint;

    /// Set the source of `shader` and compile it.
    fn compile_shader(&mut self, shader: GLuint, source: &str) -> Result<(), String>;

    fn delete_shader(&mut self, shader: GLuint);

    fn create_program(&mut self) -> GLuint;

    fn attach_shader(&mut self, program: GLuint, shader: GLuint);

    fn link_program(&mut self, program: GLuint) -> Result<(), String>;

    fn delete_program(&mut self, program: GLuint);

    /// Location of a vertex attribute, or `None` if the linked program does
    /// not expose it.
    fn attrib_location(&mut self, program: GLuint, name: &str) -> Option<GLuint>;

    /// Location of a uniform, or `None` if the linked program does not
    /// expose it.
    fn uniform_location(&mut self, program: GLuint, name: &str) -> Option<GLint>;

    fn use_program(&mut self, program: GLuint);

    fn uniform_1i(&mut self, location: GLint, value: i32);

    // -- Framebuffer ----------------------------------------------------------

    /// Clear the color buffer of the bound target to `rgba`.
    fn clear_color_buffer(&mut self, rgba: [f32; 4]);

    // -- Textures -------------------------------------------------------------

    fn create_texture(&mut self) -> GLuint;

    fn delete_texture(&mut self, texture: GLuint);

    /// Select the active texture unit (`0` is `GL_TEXTURE0`).
    fn active_texture(&mut self, unit: u32);

    fn bind_texture_2d(&mut self, texture: GLuint);

    /// `glTexParameteri` on the bound 2D texture.
    fn tex_parameter(&mut self, pname: GLenum, value: GLenum);

    /// Replace the bound 2D texture's level 0 with tightly packed RGBA8
    /// pixels.
    fn tex_image_2d_rgba(&mut self, width: u32, height: u32, pixels: &[u8]);

    // -- Vertex data ----------------------------------------------------------

    fn create_buffer(&mut self) -> GLuint;

    fn delete_buffer(&mut self, buffer: GLuint);

    fn bind_array_buffer(&mut self, buffer: GLuint);

    /// Upload `data` into the bound array buffer.
    fn array_buffer_data(&mut self, data: &[f32]);

    /// Describe a float attribute read from the bound array buffer.
    fn vertex_attrib_pointer(
        &mut self,
        index: GLuint,
        components: i32,
        stride_bytes: i32,
        offset_bytes: usize,
    );

    fn enable_vertex_attrib_array(&mut self, index: GLuint);

    fn disable_vertex_attrib_array(&mut self, index: GLuint);

    fn draw_triangle_strip(&mut self, first: i32, count: i32);

    // -- Errors ---------------------------------------------------------------

    /// Pop the oldest pending error flag, `None` when clear.
    fn take_error(&mut self) -> Option<GLenum>;

    /// Drain every pending error flag.
    fn clear_errors(&mut self) {
        while self.take_error().is_some() {}
    }
}
