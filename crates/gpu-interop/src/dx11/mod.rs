//! DXGI shared-handle surfaces (Windows via WGL_NV_DX_interop2).

pub mod device;
pub mod interop;
pub mod wgl;

pub use device::Dx11Device;
pub use interop::{Dx11Surface, Dx11SurfaceManager};
