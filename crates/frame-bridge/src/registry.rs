//! Boundary to the host's texture registry.
//!
//! The registry learns about a surface only through a [`TextureDescriptor`]
//! and refers back to it by [`TextureId`]; it never owns or mutates the
//! surface.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use gpu_interop::{PixelFormat, SharedHandle};
use tracing::{debug, warn};

/// Host-issued identifier of a registered surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextureId(pub i64);

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the compositor needs to sample a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub handle: SharedHandle,
    pub width: u32,
    pub height: u32,
    pub visible_width: u32,
    pub visible_height: u32,
    pub format: PixelFormat,
}

impl TextureDescriptor {
    /// Descriptor for a surface shown in full.
    pub fn new(handle: SharedHandle, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            handle,
            width,
            height,
            visible_width: width,
            visible_height: height,
            format,
        }
    }
}

/// The host side of texture sharing.
pub trait TextureRegistry {
    /// Publish `descriptor` and return the identifier the host will use for
    /// it.
    fn register_texture(&mut self, descriptor: &TextureDescriptor) -> anyhow::Result<TextureId>;

    /// Forget `id`. The host must stop sampling its handle.
    fn unregister_texture(&mut self, id: TextureId);

    /// Tell the host `id` has a new frame.
    fn mark_frame_available(&mut self, id: TextureId);
}

#[derive(Debug)]
struct Entry {
    descriptor: TextureDescriptor,
    frames: u64,
}

#[derive(Debug, Default)]
struct LocalInner {
    next_id: i64,
    entries: BTreeMap<TextureId, Entry>,
    refuse_next: bool,
}

/// In-process registry for hosts without their own compositor, and for
/// tests. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct LocalRegistry {
    inner: Arc<Mutex<LocalInner>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LocalInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Descriptor registered under `id`, if still registered.
    pub fn descriptor(&self, id: TextureId) -> Option<TextureDescriptor> {
        self.lock().entries.get(&id).map(|e| e.descriptor)
    }

    /// Identifiers currently registered, in issue order.
    pub fn registered(&self) -> Vec<TextureId> {
        self.lock().entries.keys().copied().collect()
    }

    /// Frame-available signals received for `id` while it is registered.
    pub fn frames_available(&self, id: TextureId) -> u64 {
        self.lock().entries.get(&id).map_or(0, |e| e.frames)
    }

    /// Make the next [`register_texture`](TextureRegistry::register_texture)
    /// call fail.
    pub fn refuse_next_registration(&self) {
        self.lock().refuse_next = true;
    }
}

impl TextureRegistry for LocalRegistry {
    fn register_texture(&mut self, descriptor: &TextureDescriptor) -> anyhow::Result<TextureId> {
        let mut inner = self.lock();
        if std::mem::take(&mut inner.refuse_next) {
            bail!("registry refused handle {:#x}", descriptor.handle.as_raw());
        }
        inner.next_id += 1;
        let id = TextureId(inner.next_id);
        inner.entries.insert(
            id,
            Entry {
                descriptor: *descriptor,
                frames: 0,
            },
        );
        debug!(%id, handle = descriptor.handle.as_raw(), "texture registered");
        Ok(id)
    }

    fn unregister_texture(&mut self, id: TextureId) {
        if self.lock().entries.remove(&id).is_some() {
            debug!(%id, "texture unregistered");
        }
    }

    fn mark_frame_available(&mut self, id: TextureId) {
        match self.lock().entries.get_mut(&id) {
            Some(entry) => entry.frames += 1,
            None => warn!(%id, "frame signalled for unregistered texture"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(raw: u64) -> TextureDescriptor {
        TextureDescriptor::new(SharedHandle::Software(raw), 4, 2, PixelFormat::Bgra8888)
    }

    #[test]
    fn descriptor_is_fully_visible_by_default() {
        let d = descriptor(1);
        assert_eq!((d.visible_width, d.visible_height), (4, 2));
    }

    #[test]
    fn ids_are_unique_and_clones_share_state() {
        let mut registry = LocalRegistry::new();
        let observer = registry.clone();
        let a = registry.register_texture(&descriptor(1)).unwrap();
        let b = registry.register_texture(&descriptor(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(observer.registered(), vec![a, b]);
        assert_eq!(observer.descriptor(b).map(|d| d.handle), Some(SharedHandle::Software(2)));

        registry.unregister_texture(a);
        assert_eq!(observer.registered(), vec![b]);
        assert!(observer.descriptor(a).is_none());
    }

    #[test]
    fn unregistered_ids_are_forgotten() {
        let mut registry = LocalRegistry::new();
        let id = registry.register_texture(&descriptor(1)).unwrap();
        registry.mark_frame_available(id);
        registry.unregister_texture(id);
        registry.mark_frame_available(id);
        registry.mark_frame_available(TextureId(999));

        assert_eq!(registry.frames_available(id), 0);
        assert_eq!(registry.frames_available(TextureId(999)), 0);
        assert!(registry.lock().entries.is_empty());
    }

    #[test]
    fn frames_are_counted_per_id() {
        let mut registry = LocalRegistry::new();
        let id = registry.register_texture(&descriptor(1)).unwrap();
        registry.mark_frame_available(id);
        registry.mark_frame_available(id);
        assert_eq!(registry.frames_available(id), 2);
        assert_eq!(registry.frames_available(TextureId(999)), 0);
    }

    #[test]
    fn refusal_applies_once() {
        let mut registry = LocalRegistry::new();
        registry.refuse_next_registration();
        assert!(registry.register_texture(&descriptor(1)).is_err());
        assert!(registry.register_texture(&descriptor(1)).is_ok());
    }
}
