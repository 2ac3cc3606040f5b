use super::buffer_broker::EncoderError;
use crate::shared::constants::{
    DEFAULT_BITRATE, DEFAULT_FRAME_RATE, DEFAULT_HEIGHT, DEFAULT_KEYFRAME_INTERVAL_SECS,
    DEFAULT_WIDTH,
};
use crate::shared::frame::yuv420_frame_len;

/// Video codecs reachable through a mime type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
    Vp8,
    Vp9,
    H264,
    Hevc,
    Av1,
    Mpeg4,
}

impl CodecKind {
    pub fn from_mime(mime: &str) -> Result<Self, EncoderError> {
        match mime {
            "video/x-vnd.on2.vp8" => Ok(Self::Vp8),
            "video/x-vnd.on2.vp9" => Ok(Self::Vp9),
            "video/avc" => Ok(Self::H264),
            "video/hevc" => Ok(Self::Hevc),
            "video/av01" => Ok(Self::Av1),
            "video/mp4v-es" => Ok(Self::Mpeg4),
            other => Err(EncoderError::UnsupportedMime(other.to_string())),
        }
    }

    /// Codec tag stored in the IVF file header.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Vp8 => *b"VP80",
            Self::Vp9 => *b"VP90",
            Self::H264 => *b"H264",
            Self::Hevc => *b"H265",
            Self::Av1 => *b"AV01",
            Self::Mpeg4 => *b"MP4V",
        }
    }
}

/// Arrangement of the 4:2:0 chroma samples in each raw frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelLayout {
    /// Interleaved UV plane after luma (colour format 21).
    #[default]
    Nv12,
    /// Separate U and V planes after luma (colour format 19).
    I420,
}

impl PixelLayout {
    pub fn color_format_tag(self) -> i32 {
        match self {
            Self::Nv12 => 21,
            Self::I420 => 19,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BitrateMode {
    ConstantQuality,
    Variable,
    #[default]
    Constant,
}

impl BitrateMode {
    pub fn tag(self) -> i32 {
        match self {
            Self::ConstantQuality => 0,
            Self::Variable => 1,
            Self::Constant => 2,
        }
    }
}

/// Everything needed to create and configure an encoder.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderConfig {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub pixel_layout: PixelLayout,
    pub frame_rate: u32,
    /// Seconds between automatic keyframes.
    pub keyframe_interval_secs: u32,
    pub bitrate_mode: BitrateMode,
    /// Target bitrate in bits per second.
    pub bitrate: u64,
    /// Specific encoder implementation to use (e.g. `h264_nvenc`); `None` picks the codec default.
    pub encoder_name: Option<String>,
}

impl EncoderConfig {
    pub fn new(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            mime: mime.into(),
            width,
            height,
            pixel_layout: PixelLayout::default(),
            frame_rate: DEFAULT_FRAME_RATE,
            keyframe_interval_secs: DEFAULT_KEYFRAME_INTERVAL_SECS,
            bitrate_mode: BitrateMode::default(),
            bitrate: DEFAULT_BITRATE,
            encoder_name: None,
        }
    }

    pub fn with_pixel_layout(mut self, layout: PixelLayout) -> Self {
        self.pixel_layout = layout;
        self
    }

    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = fps;
        self
    }

    pub fn with_keyframe_interval_secs(mut self, secs: u32) -> Self {
        self.keyframe_interval_secs = secs;
        self
    }

    pub fn with_bitrate_mode(mut self, mode: BitrateMode) -> Self {
        self.bitrate_mode = mode;
        self
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_encoder_name(mut self, name: impl Into<String>) -> Self {
        self.encoder_name = Some(name.into());
        self
    }

    pub fn codec(&self) -> Result<CodecKind, EncoderError> {
        CodecKind::from_mime(&self.mime)
    }

    pub fn frame_len(&self) -> usize {
        yuv420_frame_len(self.width, self.height)
    }

    /// Keyframe interval converted to frames, saturating on overflow.
    pub fn gop_frames(&self) -> u32 {
        self.keyframe_interval_secs.saturating_mul(self.frame_rate)
    }

    pub fn validate(&self) -> Result<(), EncoderError> {
        self.codec()?;
        if self.width == 0 || self.height == 0 {
            return Err(EncoderError::InvalidConfig(format!(
                "dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(EncoderError::InvalidConfig(format!(
                "4:2:0 input needs even dimensions, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width > u16::MAX as u32 || self.height > u16::MAX as u32 {
            return Err(EncoderError::InvalidConfig(format!(
                "dimensions {}x{} exceed the container limit",
                self.width, self.height
            )));
        }
        if self.frame_rate == 0 {
            return Err(EncoderError::InvalidConfig("frame rate must be positive".into()));
        }
        Ok(())
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::new(crate::shared::constants::DEFAULT_MIME, DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}
