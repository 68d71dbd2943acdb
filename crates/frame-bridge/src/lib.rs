//! CPU frames in, shareable GPU texture out.
//!
//! This crate ties [`gpu_interop`] surfaces to a host texture registry. A
//! producer pushes raw RGBA frames; each one is uploaded as a texture and
//! drawn as a full-target quad into an offscreen surface whose memory the
//! host compositor samples through a shared handle.
//!
//! # Overview
//!
//! - [`FrameBridge`] owns the surface and drives `create` / `render`.
//! - [`ShaderProgram`] is the compiled textured-quad program.
//! - [`BlitPipeline`] uploads one frame and draws it.
//! - [`TextureRegistry`] is the host side: registration and frame signals.
//! - [`MethodCall`] / [`Request`] decode host calls for
//!   [`FrameBridge::handle`].
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = gpu_interop::software::SoftwareSurfaceManager::new();
//! let mut bridge = FrameBridge::new(manager, LocalRegistry::new());
//! let id = bridge.create(1280, 720)?;
//! bridge.render(id, &frame)?;
//! ```

pub mod blit;
pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod request;
pub mod shader;

pub use blit::BlitPipeline;
pub use bridge::{BridgeState, FrameBridge};
pub use config::{BridgeConfig, ChannelOrder, SampleFilter};
pub use error::{BlitError, BridgeError, BridgeResult};
pub use registry::{LocalRegistry, TextureDescriptor, TextureId, TextureRegistry};
pub use request::{MethodCall, Request, Response, Value};
pub use shader::ShaderProgram;
