//! Shareable offscreen GPU surfaces.
//!
//! This crate defines the [`SurfaceManager`] and [`OffscreenSurface`] traits,
//! a common interface for render targets whose memory is exported through a
//! [`SharedHandle`] so a compositor can sample it without a copy. Drawing
//! goes through the [`GlApi`] command surface.
//!
//! Backends:
//! - [`dx11`] (Windows): D3D11 BGRA texture with a DXGI shared handle, drawn
//!   by a private WGL context through `WGL_NV_DX_interop2`.
//! - [`gl_offscreen`]: FBO + texture in the caller's current GL context.
//! - [`software`]: CPU rasterizer publishing into an in-process table, for
//!   headless hosts and tests.

pub mod gl_api;
pub mod raw_gl;
pub mod surface;

mod gl_state;

pub mod gl_offscreen;
pub mod software;

#[cfg(target_os = "windows")]
pub mod dx11;

pub use gl_api::{GlApi, ShaderStage};
pub use raw_gl::{load_gl, RawGl};
pub use surface::{
    OffscreenSurface, PixelFormat, SharedHandle, SurfaceError, SurfaceManager, SurfaceOptions,
};
