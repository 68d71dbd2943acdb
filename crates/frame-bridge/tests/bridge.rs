//! End-to-end behaviour of the frame bridge on the software surface backend.

use frame_bridge::{
    BridgeConfig, BridgeError, BridgeState, ChannelOrder, FrameBridge, LocalRegistry, MethodCall,
    Response, SampleFilter, TextureId,
};
use gpu_interop::software::{current_context, SharedTable, SoftwareSurfaceManager};
use gpu_interop::{OffscreenSurface, PixelFormat, SharedHandle};

struct Harness {
    bridge: FrameBridge<SoftwareSurfaceManager, LocalRegistry>,
    registry: LocalRegistry,
    table: SharedTable,
}

fn harness_with(config: BridgeConfig) -> Harness {
    frame_bridge::logging::init();
    let manager = SoftwareSurfaceManager::new();
    let table = manager.table();
    let registry = LocalRegistry::new();
    Harness {
        bridge: FrameBridge::with_config(manager, registry.clone(), config),
        registry,
        table,
    }
}

fn harness() -> Harness {
    harness_with(BridgeConfig::default())
}

fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    rgba.repeat((width * height) as usize)
}

/// Distinct RGBA value for every pixel.
fn gradient(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for y in 0..height {
        for x in 0..width {
            out.extend_from_slice(&[(x * 40) as u8, (y * 40) as u8, 200, 255]);
        }
    }
    out
}

fn rgba_to_bgra(rgba: &[u8]) -> Vec<u8> {
    rgba.chunks_exact(4)
        .flat_map(|p| [p[2], p[1], p[0], p[3]])
        .collect()
}

fn published(h: &Harness, id: TextureId) -> Vec<u8> {
    let handle = h.registry.descriptor(id).expect("registered").handle;
    h.table.open(handle).expect("live handle").pixels.to_vec()
}

#[test]
fn create_then_render_signals_a_frame_for_every_size() {
    for (w, h) in [(1, 1), (2, 2), (3, 5), (7, 1), (16, 9)] {
        let mut t = harness();
        let id = t.bridge.create(w, h).unwrap();
        t.bridge.render(id, &solid(w, h, [10, 20, 30, 255])).unwrap();
        assert_eq!(t.registry.frames_available(id), 1, "{w}x{h}");
        assert_eq!(t.bridge.frames_rendered(), 1);
    }
}

#[test]
fn two_by_two_red_frame_is_red_at_the_center() {
    let mut t = harness();
    let id = t.bridge.create(2, 2).unwrap();
    t.bridge.render(id, &solid(2, 2, [255, 0, 0, 255])).unwrap();
    assert_eq!(t.registry.frames_available(id), 1);

    let handle = t.registry.descriptor(id).unwrap().handle;
    let frame = t.table.open(handle).unwrap();
    // Surfaces are BGRA.
    assert_eq!(frame.pixel(1, 1), Some([0, 0, 255, 255]));
    for px in frame.pixels.chunks_exact(4) {
        assert_eq!(px, [0, 0, 255, 255]);
    }
}

#[test]
fn surface_keeps_the_input_layout() {
    let mut t = harness();
    let (w, h) = (3, 2);
    let id = t.bridge.create(w, h).unwrap();
    let frame = gradient(w, h);
    t.bridge.render(id, &frame).unwrap();
    assert_eq!(published(&t, id), rgba_to_bgra(&frame));
}

#[test]
fn nearest_filter_keeps_the_input_layout_too() {
    let mut t = harness_with(BridgeConfig::default().with_filter(SampleFilter::Nearest));
    let id = t.bridge.create(4, 3).unwrap();
    let frame = gradient(4, 3);
    t.bridge.render(id, &frame).unwrap();
    assert_eq!(published(&t, id), rgba_to_bgra(&frame));
}

#[test]
fn bgra_producers_are_converted() {
    let mut t = harness_with(BridgeConfig::default().with_input_order(ChannelOrder::Bgra));
    let id = t.bridge.create(3, 2).unwrap();
    let rgba = gradient(3, 2);
    let bgra = rgba_to_bgra(&rgba);
    t.bridge.render(id, &bgra).unwrap();
    assert_eq!(published(&t, id), bgra);
}

#[test]
fn wrong_length_is_a_validation_failure_and_draws_nothing() {
    let mut t = harness();
    let id = t.bridge.create(2, 2).unwrap();
    t.bridge.render(id, &solid(2, 2, [0, 255, 0, 255])).unwrap();
    let before = published(&t, id);
    let back_before = t.bridge.surface().unwrap().back_buffer().unwrap().to_vec();

    for len in [0usize, 4, 15, 17, 64] {
        let err = t.bridge.render(id, &vec![255u8; len]).unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)), "{len}: {err}");
        assert!(!err.is_fatal_to_surface());
    }

    assert_eq!(published(&t, id), before);
    assert_eq!(
        t.bridge.surface().unwrap().back_buffer().unwrap(),
        &back_before[..]
    );
    assert_eq!(t.registry.frames_available(id), 1);
    // Still usable.
    t.bridge.render(id, &solid(2, 2, [0, 0, 255, 255])).unwrap();
}

#[test]
fn stale_id_is_unknown_and_leaves_the_surface_alone() {
    let mut t = harness();
    let id = t.bridge.create(2, 2).unwrap();
    t.bridge.render(id, &solid(2, 2, [1, 2, 3, 255])).unwrap();
    let before = published(&t, id);

    let stale = TextureId(id.0 + 100);
    let err = t.bridge.render(stale, &solid(2, 2, [9, 9, 9, 255])).unwrap_err();
    assert!(matches!(err, BridgeError::UnknownTexture(got) if got == stale));

    assert_eq!(published(&t, id), before);
    assert_eq!(t.registry.frames_available(stale), 0);
    assert_eq!(t.bridge.state(), BridgeState::Created);
}

#[test]
fn render_before_create_is_unknown_texture() {
    let mut t = harness();
    let err = t
        .bridge
        .render(TextureId(999), &solid(1, 1, [0, 0, 0, 255]))
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnknownTexture(TextureId(999))));
    assert_eq!(t.bridge.state(), BridgeState::Uninitialized);
}

#[test]
fn unknown_method_is_unsupported() {
    let mut t = harness();
    let err = t.bridge.handle(&MethodCall::new("foo")).unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedOperation(ref m) if m == "foo"));
}

#[test]
fn second_create_leaves_exactly_one_live_handle() {
    let mut t = harness();
    let first = t.bridge.create(2, 2).unwrap();
    let first_handle = t.registry.descriptor(first).unwrap().handle;
    let second = t.bridge.create(4, 3).unwrap();
    assert_ne!(first, second);

    let live = t.table.live_handles();
    assert_eq!(live.len(), 1);
    assert_ne!(live[0], first_handle);
    assert!(t.table.open(first_handle).is_none());

    assert_eq!(t.registry.registered(), vec![second]);
    let descriptor = t.bridge.descriptor().unwrap();
    assert_eq!((descriptor.width, descriptor.height), (4, 3));
    assert_eq!(descriptor.handle, live[0]);

    let err = t.bridge.render(first, &solid(2, 2, [0, 0, 0, 255])).unwrap_err();
    assert!(matches!(err, BridgeError::UnknownTexture(_)));
    t.bridge.render(second, &solid(4, 3, [0, 0, 0, 255])).unwrap();
}

#[test]
fn same_input_gives_identical_output() {
    let mut t = harness();
    let id = t.bridge.create(5, 3).unwrap();
    let red = solid(5, 3, [200, 10, 10, 255]);

    t.bridge.render(id, &red).unwrap();
    let first = published(&t, id);
    t.bridge.render(id, &gradient(5, 3)).unwrap();
    t.bridge.render(id, &red).unwrap();
    let again = published(&t, id);
    assert_eq!(first, again);
}

#[test]
fn frames_become_visible_only_when_finalized() {
    let mut t = harness();
    let id = t.bridge.create(1, 1).unwrap();
    let handle = t.registry.descriptor(id).unwrap().handle;
    assert_eq!(t.table.open(handle).unwrap().generation, 0);

    t.bridge.render(id, &solid(1, 1, [0, 0, 255, 255])).unwrap();
    let frame = t.table.open(handle).unwrap();
    assert_eq!(frame.generation, 1);
    assert_eq!(frame.pixel(0, 0), Some([255, 0, 0, 255]));
}

#[test]
fn rendering_leaves_no_context_or_attribute_state_behind() {
    let mut t = harness();
    let id = t.bridge.create(2, 2).unwrap();
    assert_eq!(current_context(), None);

    let objects = t.bridge.surface().unwrap().live_gl_objects();
    for _ in 0..3 {
        t.bridge.render(id, &solid(2, 2, [1, 1, 1, 255])).unwrap();
        assert_eq!(current_context(), None);
        let surface = t.bridge.surface().unwrap();
        assert_eq!(surface.enabled_attribs(), 0);
    }
    // Program plus the cached texture and vertex buffer.
    assert_eq!(t.bridge.surface().unwrap().live_gl_objects(), objects + 2);
}

#[test]
fn descriptor_matches_the_surface() {
    let mut t = harness();
    let id = t.bridge.create(8, 6).unwrap();
    let descriptor = t.registry.descriptor(id).unwrap();
    let surface = t.bridge.surface().unwrap();
    assert_eq!(descriptor.handle, surface.handle());
    assert!(matches!(descriptor.handle, SharedHandle::Software(_)));
    assert_eq!(descriptor.format, PixelFormat::Bgra8888);
    assert_eq!(
        (descriptor.visible_width, descriptor.visible_height),
        surface.dimensions()
    );
}

#[test]
fn oversized_create_fails_without_touching_the_current_surface() {
    frame_bridge::logging::init();
    let manager = SoftwareSurfaceManager::new().with_max_dimension(64);
    let table = manager.table();
    let registry = LocalRegistry::new();
    let mut bridge = FrameBridge::new(manager, registry.clone());

    let id = bridge.create(4, 4).unwrap();
    let err = bridge.create(65, 4).unwrap_err();
    assert!(matches!(err, BridgeError::SurfaceCreation(_)));
    assert_eq!(bridge.texture_id(), Some(id));
    assert_eq!(table.live_handles().len(), 1);
    assert_eq!(registry.registered(), vec![id]);
}

#[test]
fn request_round_trip_through_handle() {
    let mut t = harness();
    let response = t
        .bridge
        .handle(&MethodCall::new("create").arg("width", 2).arg("height", 2))
        .unwrap();
    let Response::TextureId(id) = response else {
        panic!("create returned {response:?}");
    };

    let render = MethodCall::new("render")
        .arg("id", id.0)
        .arg("data", solid(2, 2, [255, 0, 0, 255]));
    assert_eq!(t.bridge.handle(&render).unwrap(), Response::Empty);
    assert_eq!(t.registry.frames_available(id), 1);

    let missing = MethodCall::new("render").arg("id", id.0);
    assert!(matches!(
        t.bridge.handle(&missing),
        Err(BridgeError::Validation(_))
    ));

    let negative = MethodCall::new("create").arg("width", -2).arg("height", 2);
    assert!(matches!(
        t.bridge.handle(&negative),
        Err(BridgeError::Validation(_))
    ));
    assert_eq!(t.bridge.texture_id(), Some(id));
}

#[test]
fn dropping_the_bridge_releases_everything() {
    let t = harness();
    let Harness {
        mut bridge,
        registry,
        table,
    } = t;
    bridge.create(3, 3).unwrap();
    drop(bridge);
    assert!(table.live_handles().is_empty());
    assert!(registry.registered().is_empty());
}
