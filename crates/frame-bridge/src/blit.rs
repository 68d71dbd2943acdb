//! Frame blit: upload one CPU frame and draw it as a full-target quad.
//!
//! Every frame runs the same sequence against the bound target:
//! clear, use program, bind + configure the texture, upload the pixels,
//! point the sampler at unit 0, upload the quad and enable its attributes,
//! draw the strip, disable the attributes again.

use gl::types::GLuint;
use gpu_interop::GlApi;
use tracing::{trace, warn};

use crate::config::{BridgeConfig, ChannelOrder};
use crate::error::BlitError;
use crate::shader::ShaderProgram;

/// Interleaved `x, y, u, v` for a 4-vertex triangle strip covering clip
/// space. Texture row 0 lands on framebuffer row 0, so the surface keeps the
/// input's row order.
pub const QUAD: [f32; 16] = [
    -1.0, -1.0, 0.0, 0.0, //
    1.0, -1.0, 1.0, 0.0, //
    -1.0, 1.0, 0.0, 1.0, //
    1.0, 1.0, 1.0, 1.0,
];

const STRIDE_BYTES: i32 = 4 * std::mem::size_of::<f32>() as i32;
const TEX_COORD_OFFSET_BYTES: usize = 2 * std::mem::size_of::<f32>();

/// Texture + vertex buffer reused across frames on one surface.
#[derive(Debug)]
pub struct BlitPipeline {
    config: BridgeConfig,
    texture: GLuint,
    vbo: GLuint,
    /// RGBA copy of BGRA input.
    scratch: Vec<u8>,
}

impl BlitPipeline {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            texture: 0,
            vbo: 0,
            scratch: Vec::new(),
        }
    }

    /// Draw `pixels` (`width`×`height`, 4 bytes per pixel in the configured
    /// channel order) into the currently bound target.
    ///
    /// Size and program-interface checks run before any GL call, so a frame
    /// rejected by them never touches the target.
    pub fn blit<G: GlApi + ?Sized>(
        &mut self,
        gl: &mut G,
        program: &ShaderProgram,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), BlitError> {
        if width == 0 || height == 0 {
            return Err(BlitError::upload(format!(
                "invalid frame size {width}x{height}"
            )));
        }
        let Some(expected) = self.config.input_order.pixel_format().frame_len(width, height)
        else {
            return Err(BlitError::upload(format!(
                "frame size {width}x{height} overflows"
            )));
        };
        if pixels.len() != expected {
            return Err(BlitError::upload(format!(
                "expected {expected} bytes for {width}x{height}, got {}",
                pixels.len()
            )));
        }
        let (Some(position), Some(tex_coord)) = (program.position(), program.tex_coord()) else {
            return Err(BlitError::binding(
                "program does not expose vPosition and vTexCoord",
            ));
        };
        let Some(sampler) = program.sampler() else {
            return Err(BlitError::binding("program does not expose sTexture"));
        };

        let rgba = match self.config.input_order {
            ChannelOrder::Rgba => pixels,
            ChannelOrder::Bgra => {
                swizzle_bgra(pixels, &mut self.scratch);
                &self.scratch[..]
            }
        };

        gl.clear_errors();
        if self.texture == 0 {
            self.texture = gl.create_texture();
        }
        if self.vbo == 0 {
            self.vbo = gl.create_buffer();
        }
        if self.texture == 0 || self.vbo == 0 {
            return Err(BlitError::upload("driver refused to create blit objects"));
        }

        // 1. Clear.
        gl.clear_color_buffer(self.config.clear_color);

        // 2. Program.
        gl.use_program(program.id());

        // 3. Texture and sampling state.
        let filter = self.config.filter.gl_enum();
        gl.active_texture(0);
        gl.bind_texture_2d(self.texture);
        gl.tex_parameter(gl::TEXTURE_MIN_FILTER, filter);
        gl.tex_parameter(gl::TEXTURE_MAG_FILTER, filter);
        gl.tex_parameter(gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE);
        gl.tex_parameter(gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE);

        // 4. Upload.
        gl.tex_image_2d_rgba(width, height, rgba);
        if let Some(err) = gl.take_error() {
            gl.clear_errors();
            warn!("texture upload rejected with GL error 0x{err:04X}");
            return Err(BlitError::upload(format!(
                "{width}x{height} upload failed with GL error 0x{err:04X}"
            )));
        }

        // 5. Sampler on unit 0.
        gl.active_texture(0);
        gl.bind_texture_2d(self.texture);
        gl.uniform_1i(sampler, 0);

        // 6. Quad.
        gl.bind_array_buffer(self.vbo);
        gl.array_buffer_data(&QUAD);
        gl.vertex_attrib_pointer(position, 2, STRIDE_BYTES, 0);
        gl.vertex_attrib_pointer(tex_coord, 2, STRIDE_BYTES, TEX_COORD_OFFSET_BYTES);
        gl.enable_vertex_attrib_array(position);
        gl.enable_vertex_attrib_array(tex_coord);

        // 7. Draw.
        gl.draw_triangle_strip(0, 4);

        // 8. No attribute state outlives the call.
        gl.disable_vertex_attrib_array(position);
        gl.disable_vertex_attrib_array(tex_coord);
        gl.bind_array_buffer(0);

        if let Some(err) = gl.take_error() {
            gl.clear_errors();
            warn!("quad draw rejected with GL error 0x{err:04X}");
            return Err(BlitError::binding(format!(
                "draw failed with GL error 0x{err:04X}"
            )));
        }
        trace!(width, height, "frame blitted");
        Ok(())
    }

    /// Release the cached objects. `gl` must be the context they live in.
    pub fn release<G: GlApi + ?Sized>(&mut self, gl: &mut G) {
        if self.texture != 0 {
            gl.delete_texture(self.texture);
            self.texture = 0;
        }
        if self.vbo != 0 {
            gl.delete_buffer(self.vbo);
            self.vbo = 0;
        }
        self.scratch = Vec::new();
    }
}

fn swizzle_bgra(bgra: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(bgra.len());
    for px in bgra.chunks_exact(4) {
        out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
    }
}
