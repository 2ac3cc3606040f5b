use std::time::Duration;

/// IVF file signature.
pub const IVF_MAGIC: [u8; 4] = *b"DKIF";
pub const IVF_VERSION: u16 = 0;
pub const IVF_HEADER_LEN: usize = 32;
pub const IVF_FRAME_RECORD_LEN: usize = 12;

/// Timestamps are expressed in microseconds.
pub const DEFAULT_TIMEBASE_NUMERATOR: u32 = 1_000_000;
/// Microseconds between consecutive frames at ~60 fps.
pub const DEFAULT_FRAME_INTERVAL: u64 = 16_777;
/// Advisory frame count stored in the header; readers must not rely on it.
pub const DEFAULT_FRAME_COUNT_HINT: u16 = 500;

/// Submitted frames between forced keyframe requests.
pub const DEFAULT_SYNC_INTERVAL: u64 = 60;

pub const DEFAULT_INPUT_TIMEOUT: Duration = Duration::from_millis(10);
pub const DEFAULT_OUTPUT_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const DEFAULT_FRAME_RATE: u32 = 60;
pub const DEFAULT_BITRATE: u64 = 4_000_000;
/// Keyframe interval in seconds; large enough that keyframes only happen on request.
pub const DEFAULT_KEYFRAME_INTERVAL_SECS: u32 = 100_000;
pub const DEFAULT_MIME: &str = "video/x-vnd.on2.vp8";
pub const DEFAULT_OUTPUT_FILE: &str = "output.ivf";

/// Input and output slots the software broker keeps in flight.
pub const DEFAULT_INPUT_SLOTS: usize = 4;
pub const DEFAULT_OUTPUT_SLOTS: usize = 4;
