//! [`FrameBridge`]: owns one shareable surface and pushes frames into it.
//!
//! Lifecycle: `Uninitialized` → `create` → `Created` (any number of
//! `render`s, further `create`s replace the surface) → `destroy` or drop →
//! `Destroyed`.

use gpu_interop::{OffscreenSurface, SurfaceError, SurfaceManager};
use tracing::{debug, error, trace, warn};

use crate::blit::BlitPipeline;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::registry::{TextureDescriptor, TextureId, TextureRegistry};
use crate::request::{MethodCall, Request, Response};
use crate::shader::ShaderProgram;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Created,
    Destroyed,
}

/// Everything that lives and dies with one surface.
struct Active<S> {
    surface: S,
    program: ShaderProgram,
    blit: BlitPipeline,
    id: TextureId,
    descriptor: TextureDescriptor,
}

/// Release the GL objects living in `surface`'s context, then the surface.
fn release<S: OffscreenSurface>(mut surface: S, program: ShaderProgram, mut blit: BlitPipeline) {
    let released = surface.with_render_target(|gl| {
        blit.release(gl);
        program.delete(gl);
    });
    if let Err(e) = released {
        warn!(handle = ?surface.handle(), "could not release GL objects before teardown: {e}");
    }
    surface.teardown();
}

/// Bridges CPU frames into a surface a host compositor samples directly.
///
/// Single-threaded: drive it from the thread that owns the GPU context.
pub struct FrameBridge<M: SurfaceManager, R: TextureRegistry> {
    manager: M,
    registry: R,
    config: BridgeConfig,
    active: Option<Active<M::Surface>>,
    destroyed: bool,
    frames_rendered: u64,
}

impl<M: SurfaceManager, R: TextureRegistry> FrameBridge<M, R> {
    pub fn new(manager: M, registry: R) -> Self {
        Self::with_config(manager, registry, BridgeConfig::default())
    }

    pub fn with_config(manager: M, registry: R, config: BridgeConfig) -> Self {
        Self {
            manager,
            registry,
            config,
            active: None,
            destroyed: false,
            frames_rendered: 0,
        }
    }

    pub fn state(&self) -> BridgeState {
        if self.destroyed {
            BridgeState::Destroyed
        } else if self.active.is_some() {
            BridgeState::Created
        } else {
            BridgeState::Uninitialized
        }
    }

    /// Identifier of the current registration.
    pub fn texture_id(&self) -> Option<TextureId> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Descriptor published for the current surface.
    pub fn descriptor(&self) -> Option<&TextureDescriptor> {
        self.active.as_ref().map(|a| &a.descriptor)
    }

    /// Frames finalized on the current surface.
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn surface(&self) -> Option<&M::Surface> {
        self.active.as_ref().map(|a| &a.surface)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Allocate a `width`×`height` surface, compile the blit program in its
    /// context and register it with the host.
    ///
    /// A surface that already exists is replaced only after the new one is
    /// registered; on any failure the previous surface and registration stay
    /// as they were.
    pub fn create(&mut self, width: u32, height: u32) -> BridgeResult<TextureId> {
        if self.destroyed {
            return Err(BridgeError::UseAfterTeardown);
        }

        let mut surface = self
            .manager
            .create(width, height)
            .map_err(BridgeError::SurfaceCreation)?;

        let compiled = surface
            .with_render_target(|gl| ShaderProgram::passthrough(gl))
            .map_err(BridgeError::SurfaceCreation);
        let program = match compiled {
            Ok(Ok(program)) => program,
            Ok(Err(e)) | Err(e) => {
                surface.teardown();
                return Err(e);
            }
        };

        let (w, h) = surface.dimensions();
        let descriptor = TextureDescriptor::new(surface.handle(), w, h, surface.format());
        let blit = BlitPipeline::new(self.config);

        let id = match self.registry.register_texture(&descriptor) {
            Ok(id) => id,
            Err(e) => {
                error!("host refused texture {:?}: {e:#}", descriptor.handle);
                release(surface, program, blit);
                return Err(BridgeError::Registration(e));
            }
        };

        let previous = self.active.replace(Active {
            surface,
            program,
            blit,
            id,
            descriptor,
        });
        self.frames_rendered = 0;
        if let Some(old) = previous {
            debug!(old = %old.id, new = %id, "replacing surface");
            self.registry.unregister_texture(old.id);
            release(old.surface, old.program, old.blit);
        }

        debug!(%id, width, height, handle = ?descriptor.handle, "surface created");
        Ok(id)
    }

    /// Blit `pixels` into the surface registered as `id`, wait for it to land
    /// and tell the host a frame is available.
    pub fn render(&mut self, id: TextureId, pixels: &[u8]) -> BridgeResult<()> {
        if self.destroyed {
            return Err(BridgeError::UseAfterTeardown);
        }
        let Some(active) = self.active.as_mut() else {
            return Err(BridgeError::UnknownTexture(id));
        };
        if active.id != id {
            return Err(BridgeError::UnknownTexture(id));
        }

        let (width, height) = (active.descriptor.width, active.descriptor.height);
        let input = self.config.input_order.pixel_format();
        let expected = input.frame_len(width, height);
        if expected != Some(pixels.len()) {
            return Err(BridgeError::validation(format!(
                "frame for texture {id} must be {width}x{height} {input:?}, got {} bytes",
                pixels.len()
            )));
        }
        if !active.surface.is_valid() {
            error!(%id, "surface is no longer valid");
            return Err(BridgeError::Surface(SurfaceError::ContextLost));
        }

        let Active {
            surface,
            program,
            blit,
            ..
        } = active;
        let result = surface
            .with_render_target(|gl| blit.blit(gl, program, pixels, width, height))
            .map_err(BridgeError::from)
            .and_then(|drawn| drawn.map_err(BridgeError::from))
            .and_then(|()| surface.finalize().map_err(BridgeError::from));

        if let Err(e) = result {
            if e.is_fatal_to_surface() {
                error!(%id, "frame failed, surface unusable: {e}");
            } else {
                warn!(%id, "frame dropped: {e}");
            }
            return Err(e);
        }

        self.registry.mark_frame_available(id);
        self.frames_rendered += 1;
        trace!(%id, frame = self.frames_rendered, "frame available");
        Ok(())
    }

    /// Execute a decoded host call.
    pub fn handle(&mut self, call: &MethodCall) -> BridgeResult<Response> {
        match Request::parse(call)? {
            Request::Create { width, height } => self.create(width, height).map(Response::TextureId),
            Request::Render { id, data } => self.render(id, data).map(|()| Response::Empty),
        }
    }

    /// Unregister and release the surface. Later operations fail with
    /// [`BridgeError::UseAfterTeardown`]. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(active) = self.active.take() {
            self.registry.unregister_texture(active.id);
            release(active.surface, active.program, active.blit);
        }
        debug!("frame bridge destroyed");
    }
}

impl<M: SurfaceManager, R: TextureRegistry> Drop for FrameBridge<M, R> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SampleFilter;
    use crate::registry::LocalRegistry;
    use gl::types::{GLenum, GLint, GLuint};
    use gpu_interop::software::SoftwareSurfaceManager;
    use gpu_interop::{GlApi, PixelFormat, ShaderStage, SharedHandle};
    use std::cell::{Cell, RefCell};
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::rc::Rc;

    /// Which program step the next surface's driver rejects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fault {
        None,
        Compile(ShaderStage),
        Link,
    }

    /// Accepts every call and tracks live object names, failing compile or
    /// link when told to.
    struct ScriptedGl {
        fault: Fault,
        next: GLuint,
        shaders: HashMap<GLuint, ShaderStage>,
        live: BTreeSet<GLuint>,
    }

    impl ScriptedGl {
        fn name(&mut self) -> GLuint {
            self.next += 1;
            self.live.insert(self.next);
            self.next
        }
    }

    impl GlApi for ScriptedGl {
        fn create_shader(&mut self, stage: ShaderStage) -> GLuint {
            let name = self.name();
            self.shaders.insert(name, stage);
            name
        }
        fn compile_shader(&mut self, shader: GLuint, _source: &str) -> Result<(), String> {
            match (self.fault, self.shaders.get(&shader)) {
                (Fault::Compile(stage), Some(&s)) if stage == s => {
                    Err(format!("0:1: {stage} syntax error"))
                }
                _ => Ok(()),
            }
        }
        fn delete_shader(&mut self, shader: GLuint) {
            self.live.remove(&shader);
        }
        fn create_program(&mut self) -> GLuint {
            self.name()
        }
        fn attach_shader(&mut self, _program: GLuint, _shader: GLuint) {}
        fn link_program(&mut self, _program: GLuint) -> Result<(), String> {
            match self.fault {
                Fault::Link => Err("varying texCoord not written".into()),
                _ => Ok(()),
            }
        }
        fn delete_program(&mut self, program: GLuint) {
            self.live.remove(&program);
        }
        fn attrib_location(&mut self, _program: GLuint, name: &str) -> Option<GLuint> {
            match name {
                "vPosition" => Some(0),
                "vTexCoord" => Some(1),
                _ => None,
            }
        }
        fn uniform_location(&mut self, _program: GLuint, _name: &str) -> Option<GLint> {
            Some(0)
        }
        fn use_program(&mut self, _program: GLuint) {}
        fn uniform_1i(&mut self, _location: GLint, _value: i32) {}
        fn clear_color_buffer(&mut self, _rgba: [f32; 4]) {}
        fn create_texture(&mut self) -> GLuint {
            self.name()
        }
        fn delete_texture(&mut self, texture: GLuint) {
            self.live.remove(&texture);
        }
        fn active_texture(&mut self, _unit: u32) {}
        fn bind_texture_2d(&mut self, _texture: GLuint) {}
        fn tex_parameter(&mut self, _pname: GLenum, _value: GLenum) {}
        fn tex_image_2d_rgba(&mut self, _width: u32, _height: u32, _pixels: &[u8]) {}
        fn create_buffer(&mut self) -> GLuint {
            self.name()
        }
        fn delete_buffer(&mut self, buffer: GLuint) {
            self.live.remove(&buffer);
        }
        fn bind_array_buffer(&mut self, _buffer: GLuint) {}
        fn array_buffer_data(&mut self, _data: &[f32]) {}
        fn vertex_attrib_pointer(&mut self, _index: GLuint, _c: i32, _stride: i32, _offset: usize) {}
        fn enable_vertex_attrib_array(&mut self, _index: GLuint) {}
        fn disable_vertex_attrib_array(&mut self, _index: GLuint) {}
        fn draw_triangle_strip(&mut self, _first: i32, _count: i32) {}
        fn take_error(&mut self) -> Option<GLenum> {
            None
        }
    }

    /// Surface ids still allocated, and the GL objects each torn-down
    /// surface still held at teardown.
    #[derive(Default)]
    struct Ledger {
        live: BTreeSet<u64>,
        leaked_at_teardown: BTreeMap<u64, usize>,
    }

    struct ScriptedSurface {
        id: u64,
        gl: Option<ScriptedGl>,
        ledger: Rc<RefCell<Ledger>>,
    }

    impl OffscreenSurface for ScriptedSurface {
        type Gl = ScriptedGl;

        fn handle(&self) -> SharedHandle {
            SharedHandle::Software(self.id)
        }
        fn dimensions(&self) -> (u32, u32) {
            (2, 2)
        }
        fn format(&self) -> PixelFormat {
            PixelFormat::Bgra8888
        }
        fn with_render_target<T>(
            &mut self,
            draw: impl FnOnce(&mut ScriptedGl) -> T,
        ) -> Result<T, SurfaceError> {
            let gl = self.gl.as_mut().ok_or(SurfaceError::UseAfterTeardown)?;
            Ok(draw(gl))
        }
        fn finalize(&mut self) -> Result<(), SurfaceError> {
            self.gl.as_ref().map(|_| ()).ok_or(SurfaceError::UseAfterTeardown)
        }
        fn teardown(&mut self) {
            if let Some(gl) = self.gl.take() {
                let mut ledger = self.ledger.borrow_mut();
                ledger.live.remove(&self.id);
                ledger.leaked_at_teardown.insert(self.id, gl.live.len());
            }
        }
        fn is_torn_down(&self) -> bool {
            self.gl.is_none()
        }
    }

    impl Drop for ScriptedSurface {
        fn drop(&mut self) {
            self.teardown();
        }
    }

    struct ScriptedManager {
        next: u64,
        fault: Rc<Cell<Fault>>,
        ledger: Rc<RefCell<Ledger>>,
    }

    impl SurfaceManager for ScriptedManager {
        type Surface = ScriptedSurface;

        fn create(&mut self, _width: u32, _height: u32) -> Result<ScriptedSurface, SurfaceError> {
            self.next += 1;
            self.ledger.borrow_mut().live.insert(self.next);
            Ok(ScriptedSurface {
                id: self.next,
                gl: Some(ScriptedGl {
                    fault: self.fault.get(),
                    next: 0,
                    shaders: HashMap::new(),
                    live: BTreeSet::new(),
                }),
                ledger: self.ledger.clone(),
            })
        }
    }

    fn bridge() -> FrameBridge<SoftwareSurfaceManager, LocalRegistry> {
        FrameBridge::new(SoftwareSurfaceManager::new(), LocalRegistry::new())
    }

    #[test]
    fn starts_uninitialized() {
        let b = bridge();
        assert_eq!(b.state(), BridgeState::Uninitialized);
        assert!(b.texture_id().is_none());
        assert!(b.descriptor().is_none());
    }

    #[test]
    fn create_registers_the_surface_descriptor() {
        let mut b = bridge();
        let id = b.create(3, 2).unwrap();
        assert_eq!(b.state(), BridgeState::Created);
        assert_eq!(b.texture_id(), Some(id));

        let descriptor = b.registry().descriptor(id).unwrap();
        assert_eq!(Some(&descriptor), b.descriptor());
        assert_eq!((descriptor.width, descriptor.height), (3, 2));
        assert_eq!(descriptor.handle, b.surface().unwrap().handle());
    }

    #[test]
    fn zero_size_is_a_creation_error_and_keeps_state() {
        let mut b = bridge();
        let err = b.create(0, 4).unwrap_err();
        assert!(matches!(err, BridgeError::SurfaceCreation(_)));
        assert_eq!(b.state(), BridgeState::Uninitialized);
    }

    #[test]
    fn refused_registration_keeps_the_previous_surface() {
        let mut b = bridge();
        let id = b.create(2, 2).unwrap();
        let table = b.manager().table();

        b.registry().refuse_next_registration();
        let err = b.create(4, 4).unwrap_err();
        assert!(matches!(err, BridgeError::Registration(_)));

        assert_eq!(b.texture_id(), Some(id));
        assert_eq!(b.descriptor().map(|d| d.width), Some(2));
        assert_eq!(table.live_handles().len(), 1);
        b.render(id, &[0u8; 16]).unwrap();
    }

    #[test]
    fn destroy_unregisters_and_blocks_further_use() {
        let mut b = bridge();
        let id = b.create(1, 1).unwrap();
        let registry = b.registry().clone();
        let table = b.manager().table();

        b.destroy();
        assert_eq!(b.state(), BridgeState::Destroyed);
        assert!(registry.registered().is_empty());
        assert!(table.live_handles().is_empty());
        assert!(matches!(
            b.render(id, &[0u8; 4]),
            Err(BridgeError::UseAfterTeardown)
        ));
        assert!(matches!(b.create(1, 1), Err(BridgeError::UseAfterTeardown)));
        b.destroy();
    }

    #[test]
    fn drop_releases_the_surface() {
        let registry = LocalRegistry::new();
        let manager = SoftwareSurfaceManager::new();
        let table = manager.table();
        {
            let mut b = FrameBridge::new(manager, registry.clone());
            b.create(2, 2).unwrap();
        }
        assert!(registry.registered().is_empty());
        assert!(table.live_handles().is_empty());
    }

    #[test]
    fn handle_dispatches_requests() {
        let mut b = bridge();
        let created = b
            .handle(&MethodCall::new("create").arg("width", 1).arg("height", 1))
            .unwrap();
        let Response::TextureId(id) = created else {
            panic!("create returned {created:?}");
        };
        let rendered = b
            .handle(
                &MethodCall::new("render")
                    .arg("id", id.0)
                    .arg("data", vec![0u8, 0, 0, 255]),
            )
            .unwrap();
        assert_eq!(rendered, Response::Empty);
        assert_eq!(b.frames_rendered(), 1);
    }

    #[test]
    fn frame_counter_resets_with_the_surface() {
        let mut b = bridge();
        let id = b.create(1, 1).unwrap();
        b.render(id, &[0u8; 4]).unwrap();
        b.render(id, &[0u8; 4]).unwrap();
        assert_eq!(b.frames_rendered(), 2);
        b.create(1, 1).unwrap();
        assert_eq!(b.frames_rendered(), 0);
    }

    #[test]
    fn program_failure_during_create_keeps_the_current_surface() {
        let fault = Rc::new(Cell::new(Fault::None));
        let ledger = Rc::new(RefCell::new(Ledger::default()));
        let manager = ScriptedManager {
            next: 0,
            fault: fault.clone(),
            ledger: ledger.clone(),
        };
        let registry = LocalRegistry::new();
        let mut b = FrameBridge::new(manager, registry.clone());
        let id = b.create(2, 2).unwrap();
        let descriptor = *b.descriptor().unwrap();

        for injected in [
            Fault::Compile(ShaderStage::Vertex),
            Fault::Compile(ShaderStage::Fragment),
            Fault::Link,
        ] {
            fault.set(injected);
            let err = b.create(2, 2).unwrap_err();
            match injected {
                Fault::Compile(stage) => assert!(
                    matches!(err, BridgeError::ShaderCompile { stage: s, .. } if s == stage),
                    "{err}"
                ),
                _ => assert!(matches!(err, BridgeError::ShaderLink { .. }), "{err}"),
            }

            assert_eq!(b.state(), BridgeState::Created);
            assert_eq!(b.texture_id(), Some(id));
            assert_eq!(b.descriptor(), Some(&descriptor));
            assert!(!b.surface().unwrap().is_torn_down());
            assert_eq!(registry.registered(), vec![id]);

            let ledger = ledger.borrow();
            assert_eq!(ledger.live.iter().copied().collect::<Vec<_>>(), vec![1]);
            let rejected = b.manager().next;
            assert_eq!(ledger.leaked_at_teardown.get(&rejected), Some(&0));
        }

        fault.set(Fault::None);
        b.render(id, &[0u8; 16]).unwrap();
        assert_eq!(registry.frames_available(id), 1);
    }

    #[test]
    fn config_is_carried_into_the_bridge() {
        let config = BridgeConfig::default().with_filter(SampleFilter::Nearest);
        let b = FrameBridge::with_config(SoftwareSurfaceManager::new(), LocalRegistry::new(), config);
        assert_eq!(b.config(), &config);
    }
}
