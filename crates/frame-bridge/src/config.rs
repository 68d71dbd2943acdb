//! Bridge configuration.

use gl::types::GLenum;
use gpu_interop::PixelFormat;

/// Byte order of the producer's frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelOrder {
    /// R, G, B, A per pixel. Uploaded as-is.
    #[default]
    Rgba,
    /// B, G, R, A per pixel. Swizzled to RGBA before upload.
    Bgra,
}

impl ChannelOrder {
    /// Layout of one producer frame.
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            ChannelOrder::Rgba => PixelFormat::Rgba8888,
            ChannelOrder::Bgra => PixelFormat::Bgra8888,
        }
    }
}

/// Texture filter used for both minification and magnification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SampleFilter {
    #[default]
    Linear,
    Nearest,
}

impl SampleFilter {
    pub fn gl_enum(self) -> GLenum {
        match self {
            SampleFilter::Linear => gl::LINEAR,
            SampleFilter::Nearest => gl::NEAREST,
        }
    }
}

/// Per-bridge settings. Construct with [`Default`] and adjust with the
/// `with_*` builders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeConfig {
    /// Background the target is cleared to before each blit.
    pub clear_color: [f32; 4],
    pub input_order: ChannelOrder,
    pub filter: SampleFilter,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            input_order: ChannelOrder::Rgba,
            filter: SampleFilter::Linear,
        }
    }
}

impl BridgeConfig {
    pub fn with_clear_color(mut self, rgba: [f32; 4]) -> Self {
        self.clear_color = rgba;
        self
    }

    pub fn with_input_order(mut self, order: ChannelOrder) -> Self {
        self.input_order = order;
        self
    }

    pub fn with_filter(mut self, filter: SampleFilter) -> Self {
        self.filter = filter;
        self
    }
}
