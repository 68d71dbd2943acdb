//! CPU surface backend for headless hosts.
//!
//! [`SoftGl`] interprets the [`GlApi`] subset used by the frame pipeline:
//! it checks shader sources for the GLSL ES 1.00 interface they declare,
//! links vertex and fragment interfaces, and rasterizes triangle strips
//! with a textured pass-through program. Surfaces publish their pixels into
//! a [`SharedTable`], which plays the role of the platform handle table: a
//! consumer opens a [`SharedHandle::Software`] there and only ever sees
//! frames that went through [`OffscreenSurface::finalize`].

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use gl::types::{GLenum, GLint, GLuint};
use tracing::{debug, trace};

use crate::gl_api::{GlApi, ShaderStage};
use crate::surface::{
    OffscreenSurface, PixelFormat, SharedHandle, SurfaceError, SurfaceManager,
};

/// Largest edge accepted by default, matching the D3D11 2D texture limit.
pub const DEFAULT_MAX_DIMENSION: u32 = 16384;

const MAX_VERTEX_ATTRIBS: usize = 16;

/// Pixel centers this close outside an edge still count as covered, so a
/// shared strip diagonal never drops pixels to rounding.
const EDGE_TOLERANCE: f32 = -1e-5;

// ---------------------------------------------------------------------------
// SharedTable
// ---------------------------------------------------------------------------

/// A published frame as seen by a consumer.
#[derive(Debug, Clone)]
pub struct SharedFrame {
    pub width: u32,
    pub height: u32,
    /// Number of frames published so far; `0` until the first finalize.
    pub generation: u64,
    /// BGRA8 pixels, row 0 first.
    pub pixels: Arc<[u8]>,
}

impl SharedFrame {
    /// BGRA bytes of the pixel at (`x`, `y`).
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let p = self.pixels.get(i..i + 4)?;
        Some([p[0], p[1], p[2], p[3]])
    }
}

#[derive(Debug, Default)]
struct TableInner {
    next_id: u64,
    frames: HashMap<u64, SharedFrame>,
}

/// Process-local table of shareable software surfaces.
///
/// Cloning yields another view of the same table, so a consumer can keep a
/// clone while the producer owns the surfaces.
#[derive(Debug, Clone, Default)]
pub struct SharedTable {
    inner: Arc<Mutex<TableInner>>,
}

impl SharedTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self, width: u32, height: u32) -> Option<u64> {
        let len = PixelFormat::Bgra8888.frame_len(width, height)?;
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.frames.insert(
            id,
            SharedFrame {
                width,
                height,
                generation: 0,
                pixels: vec![0u8; len].into(),
            },
        );
        Some(id)
    }

    fn publish(&self, id: u64, pixels: &[u8]) -> bool {
        let mut inner = self.lock();
        match inner.frames.get_mut(&id) {
            Some(frame) => {
                frame.generation += 1;
                frame.pixels = pixels.into();
                true
            }
            None => false,
        }
    }

    fn release(&self, id: u64) {
        self.lock().frames.remove(&id);
    }

    /// Open the frame behind `handle`, if it is a live software handle.
    pub fn open(&self, handle: SharedHandle) -> Option<SharedFrame> {
        match handle {
            SharedHandle::Software(id) => self.lock().frames.get(&id).cloned(),
            _ => None,
        }
    }

    /// Every handle currently exported through this table.
    pub fn live_handles(&self) -> Vec<SharedHandle> {
        let mut ids: Vec<u64> = self.lock().frames.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(SharedHandle::Software).collect()
    }
}

// ---------------------------------------------------------------------------
// Shader interface parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct ShaderInterface {
    attributes: Vec<String>,
    uniforms: Vec<String>,
    varyings: Vec<String>,
    /// Identifier written to `gl_Position`.
    position_source: Option<String>,
    /// `varying = attribute` pass-through assignments.
    forwards: Vec<(String, String)>,
    /// `(sampler, coordinate varying)` read by `texture2D`.
    sample: Option<(String, String)>,
    writes_output: bool,
}

fn leading_ident(s: &str) -> &str {
    let s = s.trim_start();
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(s.len());
    &s[..end]
}

fn parse_sample(rhs: &str) -> Option<(String, String)> {
    let start = rhs.find("texture2D(")? + "texture2D(".len();
    let args = &rhs[start..];
    let end = args.find(')')?;
    let mut parts = args[..end].split(',');
    let sampler = leading_ident(parts.next()?).to_string();
    let coord = leading_ident(parts.next()?).to_string();
    Some((sampler, coord))
}

fn parse_interface(stage: ShaderStage, source: &str) -> Result<ShaderInterface, String> {
    let code: String = source
        .lines()
        .map(|l| l.split("//").next().unwrap_or(""))
        .filter(|l| !l.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");

    let opens = code.matches('{').count();
    let closes = code.matches('}').count();
    if opens != closes {
        return Err(format!(
            "ERROR: 0:0: unbalanced braces ({opens} opening, {closes} closing)"
        ));
    }
    if !code.contains("void main") {
        return Err("ERROR: 0:0: 'main' : entry point not defined".to_string());
    }

    let mut iface = ShaderInterface::default();
    for raw in code.split(';') {
        let stmt = raw.rsplit(&['{', '}'][..]).next().unwrap_or("").trim();
        if stmt.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = stmt.split_whitespace().collect();
        match tokens[0] {
            "attribute" => {
                if stage == ShaderStage::Fragment {
                    return Err(
                        "ERROR: 0:0: 'attribute' : not supported in fragment shaders".to_string(),
                    );
                }
                let name = tokens.last().copied().unwrap_or_default();
                iface.attributes.push(name.to_string());
            }
            "uniform" => {
                let name = tokens.last().copied().unwrap_or_default();
                iface.uniforms.push(name.to_string());
            }
            "varying" => {
                let name = tokens.last().copied().unwrap_or_default();
                iface.varyings.push(name.to_string());
            }
            "precision" => {}
            _ => {
                let Some((lhs, rhs)) = stmt.split_once('=') else {
                    continue;
                };
                let lhs = lhs.trim();
                match lhs {
                    "gl_Position" => {
                        iface.position_source = Some(leading_ident(rhs).to_string());
                        iface.writes_output = true;
                    }
                    "gl_FragColor" => {
                        iface.sample = parse_sample(rhs);
                        iface.writes_output = true;
                    }
                    _ if iface.varyings.iter().any(|v| v == lhs) => {
                        iface
                            .forwards
                            .push((lhs.to_string(), leading_ident(rhs).to_string()));
                    }
                    _ => {}
                }
            }
        }
    }

    if !iface.writes_output {
        let output = match stage {
            ShaderStage::Vertex => "gl_Position",
            ShaderStage::Fragment => "gl_FragColor",
        };
        return Err(format!("ERROR: 0:0: '{output}' : never written"));
    }
    Ok(iface)
}

// ---------------------------------------------------------------------------
// SoftGl
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SoftShader {
    stage: ShaderStage,
    interface: Option<ShaderInterface>,
}

#[derive(Debug, Clone)]
struct LinkedProgram {
    /// Attribute location is the index.
    attributes: Vec<String>,
    /// Uniform location is the index.
    uniforms: Vec<String>,
    position_attr: usize,
    texcoord_attr: Option<usize>,
    sampler_uniform: Option<usize>,
}

#[derive(Debug, Default)]
struct SoftProgram {
    attached: Vec<GLuint>,
    linked: Option<LinkedProgram>,
    uniform_values: HashMap<GLint, i32>,
}

#[derive(Debug)]
struct SoftTexture {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
    min_filter: GLenum,
    mag_filter: GLenum,
    wrap_s: GLenum,
    wrap_t: GLenum,
}

impl Default for SoftTexture {
    fn default() -> Self {
        // GL initial sampler state.
        Self {
            width: 0,
            height: 0,
            rgba: Vec::new(),
            min_filter: gl::NEAREST_MIPMAP_LINEAR,
            mag_filter: gl::LINEAR,
            wrap_s: gl::REPEAT,
            wrap_t: gl::REPEAT,
        }
    }
}

impl SoftTexture {
    /// Only level 0 exists, so a mipmapping minification filter leaves the
    /// texture incomplete.
    fn is_complete(&self) -> bool {
        self.width > 0
            && self.height > 0
            && matches!(self.min_filter, gl::NEAREST | gl::LINEAR)
    }

    fn texel(&self, x: i64, y: i64) -> [f32; 4] {
        let x = wrap(x, self.width, self.wrap_s);
        let y = wrap(y, self.height, self.wrap_t);
        let i = (y * self.width as usize + x) * 4;
        let p = &self.rgba[i..i + 4];
        [
            p[0] as f32 / 255.0,
            p[1] as f32 / 255.0,
            p[2] as f32 / 255.0,
            p[3] as f32 / 255.0,
        ]
    }

    fn sample(&self, u: f32, v: f32, minifying: bool) -> [f32; 4] {
        if !self.is_complete() {
            return [0.0, 0.0, 0.0, 1.0];
        }
        let filter = if minifying { self.min_filter } else { self.mag_filter };
        let x = u * self.width as f32;
        let y = v * self.height as f32;
        if filter == gl::NEAREST {
            return self.texel(x.floor() as i64, y.floor() as i64);
        }
        let x = x - 0.5;
        let y = y - 0.5;
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);
        let t00 = self.texel(x0, y0);
        let t10 = self.texel(x0 + 1, y0);
        let t01 = self.texel(x0, y0 + 1);
        let t11 = self.texel(x0 + 1, y0 + 1);
        let mut out = [0.0; 4];
        for c in 0..4 {
            let top = t00[c] * (1.0 - fx) + t10[c] * fx;
            let bottom = t01[c] * (1.0 - fx) + t11[c] * fx;
            out[c] = top * (1.0 - fy) + bottom * fy;
        }
        out
    }
}

fn wrap(i: i64, size: u32, mode: GLenum) -> usize {
    let size = size as i64;
    match mode {
        gl::CLAMP_TO_EDGE => i.clamp(0, size - 1) as usize,
        gl::MIRRORED_REPEAT => {
            let period = i.rem_euclid(2 * size);
            if period < size {
                period as usize
            } else {
                (2 * size - 1 - period) as usize
            }
        }
        _ => i.rem_euclid(size) as usize,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct AttribState {
    enabled: bool,
    buffer: GLuint,
    components: i32,
    stride: i32,
    offset: usize,
}

fn to_unorm8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// CPU interpreter for the [`GlApi`] subset, drawing into a private BGRA8
/// framebuffer.
#[derive(Debug)]
pub struct SoftGl {
    width: u32,
    height: u32,
    /// BGRA8, row 0 first.
    color: Vec<u8>,
    next_name: GLuint,
    shaders: HashMap<GLuint, SoftShader>,
    programs: HashMap<GLuint, SoftProgram>,
    textures: HashMap<GLuint, SoftTexture>,
    buffers: HashMap<GLuint, Vec<f32>>,
    current_program: GLuint,
    active_unit: u32,
    unit_textures: HashMap<u32, GLuint>,
    array_buffer: GLuint,
    attribs: [AttribState; MAX_VERTEX_ATTRIBS],
    errors: Vec<GLenum>,
}

impl SoftGl {
    /// A context drawing into a zeroed `width`×`height` framebuffer.
    ///
    /// A size whose byte length overflows `usize` yields an empty 0×0
    /// framebuffer.
    pub fn new(width: u32, height: u32) -> Self {
        let (width, height, len) = match PixelFormat::Rgba8888.frame_len(width, height) {
            Some(len) => (width, height, len),
            None => (0, 0, 0),
        };
        Self {
            width,
            height,
            color: vec![0u8; len],
            next_name: 0,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            textures: HashMap::new(),
            buffers: HashMap::new(),
            current_program: 0,
            active_unit: 0,
            unit_textures: HashMap::new(),
            array_buffer: 0,
            attribs: [AttribState::default(); MAX_VERTEX_ATTRIBS],
            errors: Vec::new(),
        }
    }

    /// BGRA8 contents of the framebuffer.
    pub fn framebuffer(&self) -> &[u8] {
        &self.color
    }

    /// Shader, program, texture and buffer objects still allocated.
    pub fn live_objects(&self) -> usize {
        self.shaders.len() + self.programs.len() + self.textures.len() + self.buffers.len()
    }

    /// Number of enabled vertex attribute arrays.
    pub fn enabled_attribs(&self) -> usize {
        self.attribs.iter().filter(|a| a.enabled).count()
    }

    fn gen_name(&mut self) -> GLuint {
        self.next_name += 1;
        self.next_name
    }

    fn error(&mut self, err: GLenum) {
        trace!(err, "soft gl error");
        self.errors.push(err);
    }

    fn read_attrib(&self, index: usize, vertex: usize) -> Option<[f32; 4]> {
        let state = self.attribs.get(index)?;
        if !state.enabled {
            return Some([0.0, 0.0, 0.0, 1.0]);
        }
        let data = self.buffers.get(&state.buffer)?;
        let stride = if state.stride == 0 {
            state.components as usize * 4
        } else {
            state.stride as usize
        };
        let base = (state.offset + vertex * stride) / 4;
        let mut out = [0.0, 0.0, 0.0, 1.0];
        for (c, slot) in out.iter_mut().enumerate().take(state.components as usize) {
            *slot = *data.get(base + c)?;
        }
        Some(out)
    }

    fn rasterize(
        &mut self,
        tri: [([f32; 2], [f32; 2]); 3],
        texture: Option<GLuint>,
    ) {
        let (w, h) = (self.width as f32, self.height as f32);
        let to_px = |p: [f32; 2]| [(p[0] + 1.0) * 0.5 * w, (p[1] + 1.0) * 0.5 * h];
        let a = to_px(tri[0].0);
        let b = to_px(tri[1].0);
        let c = to_px(tri[2].0);
        let edge = |p: [f32; 2], q: [f32; 2], r: [f32; 2]| {
            (q[0] - p[0]) * (r[1] - p[1]) - (q[1] - p[1]) * (r[0] - p[0])
        };
        let area = edge(a, b, c);
        if area == 0.0 {
            return;
        }

        let min_x = a[0].min(b[0]).min(c[0]).floor().max(0.0) as u32;
        let max_x = a[0].max(b[0]).max(c[0]).ceil().min(w) as u32;
        let min_y = a[1].min(b[1]).min(c[1]).floor().max(0.0) as u32;
        let max_y = a[1].max(b[1]).max(c[1]).ceil().min(h) as u32;

        let tex = texture.and_then(|t| self.textures.get(&t));
        let minifying = tex.is_some_and(|t| t.width > self.width || t.height > self.height);

        let mut writes = Vec::new();
        for y in min_y..max_y {
            for x in min_x..max_x {
                let p = [x as f32 + 0.5, y as f32 + 0.5];
                let w0 = edge(b, c, p) / area;
                let w1 = edge(c, a, p) / area;
                let w2 = 1.0 - w0 - w1;
                if w0 < EDGE_TOLERANCE || w1 < EDGE_TOLERANCE || w2 < EDGE_TOLERANCE {
                    continue;
                }
                let u = w0 * tri[0].1[0] + w1 * tri[1].1[0] + w2 * tri[2].1[0];
                let v = w0 * tri[0].1[1] + w1 * tri[1].1[1] + w2 * tri[2].1[1];
                let rgba = match tex {
                    Some(t) => t.sample(u, v, minifying),
                    None => [0.0, 0.0, 0.0, 1.0],
                };
                writes.push((x, y, rgba));
            }
        }

        for (x, y, rgba) in writes {
            let i = (y as usize * self.width as usize + x as usize) * 4;
            self.color[i] = to_unorm8(rgba[2]);
            self.color[i + 1] = to_unorm8(rgba[1]);
            self.color[i + 2] = to_unorm8(rgba[0]);
            self.color[i + 3] = to_unorm8(rgba[3]);
        }
    }
}

impl GlApi for SoftGl {
    fn create_shader(&mut self, stage: ShaderStage) -> GLuint {
        let name = self.gen_name();
        self.shaders.insert(
            name,
            SoftShader {
                stage,
                interface: None,
            },
        );
        name
    }

    fn compile_shader(&mut self, shader: GLuint, source: &str) -> Result<(), String> {
        let Some(entry) = self.shaders.get_mut(&shader) else {
            self.error(gl::INVALID_VALUE);
            return Err(format!("ERROR: {shader} is not a shader object"));
        };
        match parse_interface(entry.stage, source) {
            Ok(iface) => {
                entry.interface = Some(iface);
                Ok(())
            }
            Err(log) => {
                entry.interface = None;
                Err(log)
            }
        }
    }

    fn delete_shader(&mut self, shader: GLuint) {
        if shader != 0 && self.shaders.remove(&shader).is_none() {
            self.error(gl::INVALID_VALUE);
        }
    }

    fn create_program(&mut self) -> GLuint {
        let name = self.gen_name();
        self.programs.insert(name, SoftProgram::default());
        name
    }

    fn attach_shader(&mut self, program: GLuint, shader: GLuint) {
        if !self.shaders.contains_key(&shader) {
            self.error(gl::INVALID_VALUE);
            return;
        }
        match self.programs.get_mut(&program) {
            Some(p) => p.attached.push(shader),
            None => self.error(gl::INVALID_VALUE),
        }
    }

    fn link_program(&mut self, program: GLuint) -> Result<(), String> {
        let Some(p) = self.programs.get(&program) else {
            self.error(gl::INVALID_VALUE);
            return Err(format!("ERROR: {program} is not a program object"));
        };

        let mut vertex = None;
        let mut fragment = None;
        for name in &p.attached {
            let Some(shader) = self.shaders.get(name) else {
                continue;
            };
            match shader.stage {
                ShaderStage::Vertex => vertex = shader.interface.clone(),
                ShaderStage::Fragment => fragment = shader.interface.clone(),
            }
        }
        let (Some(vs), Some(fs)) = (vertex, fragment) else {
            return Err("ERROR: program needs a compiled vertex and fragment shader".to_string());
        };

        if let Some(missing) = fs.varyings.iter().find(|v| !vs.varyings.contains(v)) {
            return Err(format!(
                "ERROR: varying '{missing}' is read by the fragment shader but not declared by the vertex shader"
            ));
        }
        let position_attr = vs
            .position_source
            .as_ref()
            .and_then(|src| vs.attributes.iter().position(|a| a == src))
            .ok_or_else(|| "ERROR: gl_Position is not fed by a vertex attribute".to_string())?;

        let mut uniforms = vs.uniforms.clone();
        for u in &fs.uniforms {
            if !uniforms.contains(u) {
                uniforms.push(u.clone());
            }
        }
        let texcoord_attr = fs.sample.as_ref().and_then(|(_, coord)| {
            let (_, attr) = vs.forwards.iter().find(|(varying, _)| varying == coord)?;
            vs.attributes.iter().position(|a| a == attr)
        });
        let sampler_uniform = fs
            .sample
            .as_ref()
            .and_then(|(sampler, _)| uniforms.iter().position(|u| u == sampler));

        let linked = LinkedProgram {
            attributes: vs.attributes,
            uniforms,
            position_attr,
            texcoord_attr,
            sampler_uniform,
        };
        if let Some(p) = self.programs.get_mut(&program) {
            p.linked = Some(linked);
            p.uniform_values.clear();
        }
        Ok(())
    }

    fn delete_program(&mut self, program: GLuint) {
        if program == 0 {
            return;
        }
        if self.programs.remove(&program).is_none() {
            self.error(gl::INVALID_VALUE);
        }
        if self.current_program == program {
            self.current_program = 0;
        }
    }

    fn attrib_location(&mut self, program: GLuint, name: &str) -> Option<GLuint> {
        let linked = self.programs.get(&program)?.linked.as_ref()?;
        linked
            .attributes
            .iter()
            .position(|a| a == name)
            .map(|i| i as GLuint)
    }

    fn uniform_location(&mut self, program: GLuint, name: &str) -> Option<GLint> {
        let linked = self.programs.get(&program)?.linked.as_ref()?;
        linked
            .uniforms
            .iter()
            .position(|u| u == name)
            .map(|i| i as GLint)
    }

    fn use_program(&mut self, program: GLuint) {
        let linked = program == 0
            || self
                .programs
                .get(&program)
                .is_some_and(|p| p.linked.is_some());
        if linked {
            self.current_program = program;
        } else {
            self.error(gl::INVALID_OPERATION);
        }
    }

    fn uniform_1i(&mut self, location: GLint, value: i32) {
        let program = self.current_program;
        let Some(p) = self.programs.get_mut(&program) else {
            self.error(gl::INVALID_OPERATION);
            return;
        };
        let known = p
            .linked
            .as_ref()
            .is_some_and(|l| location >= 0 && (location as usize) < l.uniforms.len());
        if known {
            p.uniform_values.insert(location, value);
        } else {
            self.error(gl::INVALID_OPERATION);
        }
    }

    fn clear_color_buffer(&mut self, rgba: [f32; 4]) {
        let bgra = [
            to_unorm8(rgba[2]),
            to_unorm8(rgba[1]),
            to_unorm8(rgba[0]),
            to_unorm8(rgba[3]),
        ];
        for px in self.color.chunks_exact_mut(4) {
            px.copy_from_slice(&bgra);
        }
    }

    fn create_texture(&mut self) -> GLuint {
        let name = self.gen_name();
        self.textures.insert(name, SoftTexture::default());
        name
    }

    fn delete_texture(&mut self, texture: GLuint) {
        if texture == 0 {
            return;
        }
        self.textures.remove(&texture);
        self.unit_textures.retain(|_, t| *t != texture);
    }

    fn active_texture(&mut self, unit: u32) {
        self.active_unit = unit;
    }

    fn bind_texture_2d(&mut self, texture: GLuint) {
        if texture != 0 && !self.textures.contains_key(&texture) {
            self.error(gl::INVALID_OPERATION);
            return;
        }
        self.unit_textures.insert(self.active_unit, texture);
    }

    fn tex_parameter(&mut self, pname: GLenum, value: GLenum) {
        let bound = self.unit_textures.get(&self.active_unit).copied();
        let Some(tex) = bound.and_then(|t| self.textures.get_mut(&t)) else {
            self.error(gl::INVALID_OPERATION);
            return;
        };
        match pname {
            gl::TEXTURE_MIN_FILTER => tex.min_filter = value,
            gl::TEXTURE_MAG_FILTER => tex.mag_filter = value,
            gl::TEXTURE_WRAP_S => tex.wrap_s = value,
            gl::TEXTURE_WRAP_T => tex.wrap_t = value,
            _ => self.error(gl::INVALID_ENUM),
        }
    }

    fn tex_image_2d_rgba(&mut self, width: u32, height: u32, pixels: &[u8]) {
        if PixelFormat::Rgba8888.frame_len(width, height) != Some(pixels.len()) {
            self.error(gl::INVALID_VALUE);
            return;
        }
        let bound = self.unit_textures.get(&self.active_unit).copied();
        let Some(tex) = bound.and_then(|t| self.textures.get_mut(&t)) else {
            self.error(gl::INVALID_OPERATION);
            return;
        };
        tex.width = width;
        tex.height = height;
        tex.rgba.clear();
        tex.rgba.extend_from_slice(pixels);
    }

    fn create_buffer(&mut self) -> GLuint {
        let name = self.gen_name();
        self.buffers.insert(name, Vec::new());
        name
    }

    fn delete_buffer(&mut self, buffer: GLuint) {
        if buffer == 0 {
            return;
        }
        self.buffers.remove(&buffer);
        if self.array_buffer == buffer {
            self.array_buffer = 0;
        }
    }

    fn bind_array_buffer(&mut self, buffer: GLuint) {
        if buffer != 0 && !self.buffers.contains_key(&buffer) {
            self.error(gl::INVALID_OPERATION);
            return;
        }
        self.array_buffer = buffer;
    }

    fn array_buffer_data(&mut self, data: &[f32]) {
        let bound = self.array_buffer;
        match self.buffers.get_mut(&bound) {
            Some(buf) => {
                buf.clear();
                buf.extend_from_slice(data);
            }
            None => self.error(gl::INVALID_OPERATION),
        }
    }

    fn vertex_attrib_pointer(
        &mut self,
        index: GLuint,
        components: i32,
        stride_bytes: i32,
        offset_bytes: usize,
    ) {
        let buffer = self.array_buffer;
        match self.attribs.get_mut(index as usize) {
            Some(a) if (1..=4).contains(&components) && buffer != 0 => {
                a.buffer = buffer;
                a.components = components;
                a.stride = stride_bytes;
                a.offset = offset_bytes;
            }
            _ => self.error(gl::INVALID_VALUE),
        }
    }

    fn enable_vertex_attrib_array(&mut self, index: GLuint) {
        match self.attribs.get_mut(index as usize) {
            Some(a) => a.enabled = true,
            None => self.error(gl::INVALID_VALUE),
        }
    }

    fn disable_vertex_attrib_array(&mut self, index: GLuint) {
        match self.attribs.get_mut(index as usize) {
            Some(a) => a.enabled = false,
            None => self.error(gl::INVALID_VALUE),
        }
    }

    fn draw_triangle_strip(&mut self, first: i32, count: i32) {
        let Some(linked) = self
            .programs
            .get(&self.current_program)
            .and_then(|p| p.linked.clone())
        else {
            self.error(gl::INVALID_OPERATION);
            return;
        };
        if first < 0 || count < 0 {
            self.error(gl::INVALID_VALUE);
            return;
        }
        if count < 3 {
            return;
        }

        let mut vertices = Vec::with_capacity(count as usize);
        for v in first as usize..(first + count) as usize {
            let pos = self.read_attrib(linked.position_attr, v);
            let uv = match linked.texcoord_attr {
                Some(i) => self.read_attrib(i, v),
                None => Some([0.0, 0.0, 0.0, 1.0]),
            };
            match (pos, uv) {
                (Some(p), Some(t)) => vertices.push(([p[0], p[1]], [t[0], t[1]])),
                _ => {
                    self.error(gl::INVALID_OPERATION);
                    return;
                }
            }
        }

        let texture = linked.sampler_uniform.and_then(|loc| {
            let unit = self
                .programs
                .get(&self.current_program)
                .and_then(|p| p.uniform_values.get(&(loc as GLint)).copied())
                .unwrap_or(0);
            self.unit_textures.get(&(unit as u32)).copied()
        });

        for i in 0..vertices.len() - 2 {
            // Alternate winding keeps every strip triangle front-facing.
            let tri = if i % 2 == 0 {
                [vertices[i], vertices[i + 1], vertices[i + 2]]
            } else {
                [vertices[i + 1], vertices[i], vertices[i + 2]]
            };
            self.rasterize(tri, texture);
        }
    }

    fn take_error(&mut self) -> Option<GLenum> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.remove(0))
        }
    }
}

// ---------------------------------------------------------------------------
// Current-context tracking
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Software context current on this thread, if any.
pub fn current_context() -> Option<u64> {
    CURRENT_CONTEXT.with(Cell::get)
}

/// Makes a context current and restores the previous one on drop.
struct CurrentContextGuard {
    previous: Option<u64>,
}

impl CurrentContextGuard {
    fn bind(context: u64) -> Self {
        let previous = CURRENT_CONTEXT.with(|c| c.replace(Some(context)));
        Self { previous }
    }
}

impl Drop for CurrentContextGuard {
    fn drop(&mut self) {
        CURRENT_CONTEXT.with(|c| c.set(self.previous));
    }
}

// ---------------------------------------------------------------------------
// SoftwareSurfaceManager / SoftwareSurface
// ---------------------------------------------------------------------------

/// Allocates [`SoftwareSurface`]s exported through a [`SharedTable`].
#[derive(Debug)]
pub struct SoftwareSurfaceManager {
    table: SharedTable,
    max_dimension: u32,
    next_context: u64,
}

impl Default for SoftwareSurfaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareSurfaceManager {
    pub fn new() -> Self {
        Self::with_table(SharedTable::new())
    }

    /// Export surfaces through an existing table.
    pub fn with_table(table: SharedTable) -> Self {
        Self {
            table,
            max_dimension: DEFAULT_MAX_DIMENSION,
            next_context: 0,
        }
    }

    /// Refuse surfaces with an edge longer than `max_dimension`.
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    /// The consumer-side view of exported surfaces.
    pub fn table(&self) -> SharedTable {
        self.table.clone()
    }
}

impl SurfaceManager for SoftwareSurfaceManager {
    type Surface = SoftwareSurface;

    fn create(&mut self, width: u32, height: u32) -> Result<SoftwareSurface, SurfaceError> {
        if width == 0 || height == 0 {
            return Err(SurfaceError::Creation(anyhow!(
                "invalid surface size {width}x{height}"
            )));
        }
        if width > self.max_dimension || height > self.max_dimension {
            return Err(SurfaceError::Creation(anyhow!(
                "{width}x{height} exceeds the {} pixel limit",
                self.max_dimension
            )));
        }

        let id = self.table.allocate(width, height).ok_or_else(|| {
            SurfaceError::Creation(anyhow!("{width}x{height} does not fit in memory"))
        })?;
        self.next_context += 1;
        debug!(id, width, height, "software surface created");

        Ok(SoftwareSurface {
            id,
            context: self.next_context,
            width,
            height,
            gl: Some(SoftGl::new(width, height)),
            table: self.table.clone(),
        })
    }
}

/// CPU render target exported as [`SharedHandle::Software`].
#[derive(Debug)]
pub struct SoftwareSurface {
    id: u64,
    context: u64,
    width: u32,
    height: u32,
    /// `None` once torn down.
    gl: Option<SoftGl>,
    table: SharedTable,
}

impl SoftwareSurface {
    /// Identifier reported by [`current_context`] while drawing.
    pub fn context_id(&self) -> u64 {
        self.context
    }

    /// Objects still allocated in the surface's context.
    pub fn live_gl_objects(&self) -> usize {
        self.gl.as_ref().map_or(0, SoftGl::live_objects)
    }

    /// Vertex attribute arrays left enabled in the surface's context.
    pub fn enabled_attribs(&self) -> usize {
        self.gl.as_ref().map_or(0, SoftGl::enabled_attribs)
    }

    /// Back buffer contents, including unfinalized drawing.
    pub fn back_buffer(&self) -> Option<&[u8]> {
        self.gl.as_ref().map(SoftGl::framebuffer)
    }
}

impl OffscreenSurface for SoftwareSurface {
    type Gl = SoftGl;

    fn handle(&self) -> SharedHandle {
        SharedHandle::Software(self.id)
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::Bgra8888
    }

    fn with_render_target<R>(
        &mut self,
        draw: impl FnOnce(&mut SoftGl) -> R,
    ) -> Result<R, SurfaceError> {
        let gl = self.gl.as_mut().ok_or(SurfaceError::UseAfterTeardown)?;
        let _current = CurrentContextGuard::bind(self.context);
        Ok(draw(gl))
    }

    fn finalize(&mut self) -> Result<(), SurfaceError> {
        let gl = self.gl.as_ref().ok_or(SurfaceError::UseAfterTeardown)?;
        if !self.table.publish(self.id, gl.framebuffer()) {
            return Err(SurfaceError::Platform(anyhow!(
                "shared entry {} is no longer exported",
                self.id
            )));
        }
        trace!(id = self.id, "software surface published");
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.gl.is_some()
    }

    fn teardown(&mut self) {
        if self.gl.is_none() {
            return;
        }
        self.table.release(self.id);
        self.gl = None;
        debug!(id = self.id, "software surface torn down");
    }

    fn is_torn_down(&self) -> bool {
        self.gl.is_none()
    }
}

impl Drop for SoftwareSurface {
    fn drop(&mut self) {
        self.teardown();
    }
}
