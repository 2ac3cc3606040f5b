use std::ops::BitOr;
use std::time::Duration;

use thiserror::Error;

use crate::shared::constants::{DEFAULT_INPUT_TIMEOUT, DEFAULT_OUTPUT_TIMEOUT};

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("no encoder available for {0}")]
    Create(String),
    #[error("encoder rejected configuration: {0}")]
    Configure(String),
    #[error("unsupported mime type: {0}")]
    UnsupportedMime(String),
    #[error("invalid encoder configuration: {0}")]
    InvalidConfig(String),
    #[error("{len} bytes do not fit input buffer of {capacity} bytes")]
    InputTooLarge { len: usize, capacity: usize },
    #[error("input of {len} bytes is neither empty nor a whole {frame_len}-byte frame")]
    PartialFrame { len: usize, frame_len: usize },
    #[error("encoder worker failed: {0}")]
    Worker(String),
    #[error("encoder is no longer accepting buffers")]
    Disconnected,
}

/// Per-buffer flags, numerically identical to the platform codec flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(1);
    /// Codec-specific data (parameter sets, sequence headers) rather than a picture.
    pub const CODEC_CONFIG: Self = Self(2);
    pub const END_OF_STREAM: Self = Self(4);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// An encoder-owned input slot lent to the caller.
///
/// Not `Clone`: submitting it moves it back to the encoder, after which the
/// caller has nothing left to write through. A buffer that will not be
/// submitted must go back through `EncoderBufferBroker::return_input`;
/// dropping it loses the slot for the rest of the session.
#[derive(Debug)]
pub struct InputBuffer {
    slot: usize,
    data: Vec<u8>,
}

impl InputBuffer {
    pub fn new(slot: usize, data: Vec<u8>) -> Self {
        Self { slot, data }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Copies `bytes` to the start of the slot and returns the byte count to submit.
    pub fn fill(&mut self, bytes: &[u8]) -> Result<usize, EncoderError> {
        if bytes.len() > self.data.len() {
            return Err(EncoderError::InputTooLarge {
                len: bytes.len(),
                capacity: self.data.len(),
            });
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    pub fn into_parts(self) -> (usize, Vec<u8>) {
        (self.slot, self.data)
    }
}

/// A compressed access unit lent to the caller until `release_output`.
///
/// Not `Clone`: releasing it moves the buffer back to the encoder's pool.
#[derive(Debug)]
pub struct EncodedUnit {
    slot: usize,
    data: Vec<u8>,
    len: usize,
    flags: BufferFlags,
    presentation_timestamp: i64,
}

impl EncodedUnit {
    pub fn new(
        slot: usize,
        data: Vec<u8>,
        len: usize,
        flags: BufferFlags,
        presentation_timestamp: i64,
    ) -> Self {
        debug_assert!(len <= data.len(), "unit length exceeds its buffer");
        Self {
            slot,
            data,
            len,
            flags,
            presentation_timestamp,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn presentation_timestamp(&self) -> i64 {
        self.presentation_timestamp
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    pub fn into_parts(self) -> (usize, Vec<u8>) {
        (self.slot, self.data)
    }
}

/// Bounded waits used by the encode loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerTimeouts {
    pub input: Duration,
    pub output: Duration,
}

impl Default for BrokerTimeouts {
    fn default() -> Self {
        Self {
            input: DEFAULT_INPUT_TIMEOUT,
            output: DEFAULT_OUTPUT_TIMEOUT,
        }
    }
}

/// Producer/consumer buffer queues of an encoder.
///
/// Every wait is bounded; `Ok(None)` means nothing became available in time,
/// which is routine backpressure and not an error.
pub trait EncoderBufferBroker: Send {
    fn acquire_input(&mut self, timeout: Duration) -> Result<Option<InputBuffer>, EncoderError>;

    /// Hands `buffer` back to the encoder with `byte_count` valid bytes:
    /// either a whole frame or, with `END_OF_STREAM`, zero.
    fn submit_input(
        &mut self,
        buffer: InputBuffer,
        byte_count: usize,
        timestamp: i64,
        flags: BufferFlags,
    ) -> Result<(), EncoderError>;

    /// Returns `None` on timeout, and immediately once the encoder has flushed
    /// its last unit after end of stream.
    fn acquire_output(&mut self, timeout: Duration) -> Result<Option<EncodedUnit>, EncoderError>;

    /// Gives an acquired input slot back to the pool without encoding it.
    fn return_input(&mut self, buffer: InputBuffer) -> Result<(), EncoderError>;

    fn release_output(&mut self, unit: EncodedUnit) -> Result<(), EncoderError>;

    /// Asks for the next picture to be a keyframe. Advisory only.
    fn request_sync_frame(&mut self) -> Result<(), EncoderError>;
}
