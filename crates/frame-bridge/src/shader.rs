//! The fixed textured-quad program and its compiler.

use gl::types::{GLint, GLuint};
use gpu_interop::{GlApi, ShaderStage};
use tracing::{debug, error};

use crate::error::{BridgeError, BridgeResult};

/// Passes the texture coordinate through and places the position directly
/// in clip space.
pub const VERTEX_SHADER: &str = "\
attribute vec4 vPosition;
attribute vec2 vTexCoord;
varying vec2 texCoord;
void main() {
    texCoord = vTexCoord;
    gl_Position = vPosition;
}
";

/// Writes the bound texture's sample unmodified.
pub const FRAGMENT_SHADER: &str = "\
#ifdef GL_ES
precision mediump float;
#endif
uniform sampler2D sTexture;
varying vec2 texCoord;
void main() {
    gl_FragColor = texture2D(sTexture, texCoord);
}
";

pub const POSITION_ATTRIB: &str = "vPosition";
pub const TEX_COORD_ATTRIB: &str = "vTexCoord";
pub const SAMPLER_UNIFORM: &str = "sTexture";

/// A linked program plus the locations the blit binds.
///
/// Locations are looked up once at link time; a program that lacks one of
/// them still links, and the blit reports the mismatch per frame.
#[derive(Debug, PartialEq, Eq)]
pub struct ShaderProgram {
    program: GLuint,
    position: Option<GLuint>,
    tex_coord: Option<GLuint>,
    sampler: Option<GLint>,
}

fn compile_stage<G: GlApi + ?Sized>(
    gl: &mut G,
    stage: ShaderStage,
    source: &str,
) -> BridgeResult<GLuint> {
    let shader = gl.create_shader(stage);
    if shader == 0 {
        return Err(BridgeError::ShaderCompile {
            stage,
            log: "driver refused to create a shader object".into(),
        });
    }
    if let Err(log) = gl.compile_shader(shader, source) {
        gl.delete_shader(shader);
        error!("{stage} shader failed to compile: {log}");
        return Err(BridgeError::ShaderCompile { stage, log });
    }
    Ok(shader)
}

impl ShaderProgram {
    /// Compile and link `vertex` + `fragment`.
    ///
    /// Every object created along the way is released on failure.
    pub fn compile<G: GlApi + ?Sized>(
        gl: &mut G,
        vertex: &str,
        fragment: &str,
    ) -> BridgeResult<Self> {
        let vs = compile_stage(gl, ShaderStage::Vertex, vertex)?;
        let fs = match compile_stage(gl, ShaderStage::Fragment, fragment) {
            Ok(fs) => fs,
            Err(e) => {
                gl.delete_shader(vs);
                return Err(e);
            }
        };

        let program = gl.create_program();
        if program == 0 {
            gl.delete_shader(vs);
            gl.delete_shader(fs);
            return Err(BridgeError::ShaderLink {
                log: "driver refused to create a program object".into(),
            });
        }
        gl.attach_shader(program, vs);
        gl.attach_shader(program, fs);
        let linked = gl.link_program(program);

        // The linked program keeps its own copy of the stages.
        gl.delete_shader(vs);
        gl.delete_shader(fs);

        if let Err(log) = linked {
            gl.delete_program(program);
            error!("program failed to link: {log}");
            return Err(BridgeError::ShaderLink { log });
        }

        let compiled = Self {
            program,
            position: gl.attrib_location(program, POSITION_ATTRIB),
            tex_coord: gl.attrib_location(program, TEX_COORD_ATTRIB),
            sampler: gl.uniform_location(program, SAMPLER_UNIFORM),
        };
        debug!(
            program,
            position = ?compiled.position,
            tex_coord = ?compiled.tex_coord,
            sampler = ?compiled.sampler,
            "shader program linked"
        );
        Ok(compiled)
    }

    /// The built-in passthrough program.
    pub fn passthrough<G: GlApi + ?Sized>(gl: &mut G) -> BridgeResult<Self> {
        Self::compile(gl, VERTEX_SHADER, FRAGMENT_SHADER)
    }

    pub fn id(&self) -> GLuint {
        self.program
    }

    pub fn position(&self) -> Option<GLuint> {
        self.position
    }

    pub fn tex_coord(&self) -> Option<GLuint> {
        self.tex_coord
    }

    pub fn sampler(&self) -> Option<GLint> {
        self.sampler
    }

    /// Release the program object. `gl` must be the context it was linked in.
    pub fn delete<G: GlApi + ?Sized>(self, gl: &mut G) {
        gl.delete_program(self.program);
    }
}
