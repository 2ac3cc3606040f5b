use thiserror::Error;

use crate::shared::constants::{
    IVF_FRAME_RECORD_LEN, IVF_HEADER_LEN, IVF_MAGIC, IVF_VERSION,
};

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to create output {path}: {source}")]
    Create {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write container: {0}")]
    Io(#[from] std::io::Error),
    #[error("file header already written")]
    HeaderAlreadyWritten,
    #[error("file header must be written before any frame")]
    HeaderMissing,
    #[error("{field} {value} does not fit the header field")]
    FieldOverflow { field: &'static str, value: u64 },
    #[error("not an IVF stream (magic {0:?})")]
    BadMagic([u8; 4]),
    #[error("truncated {what}: expected {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("container writer already closed")]
    Closed,
}

/// Byte order used for every multi-byte header field.
///
/// Fields are written one at a time in this order regardless of host
/// endianness. Big-endian is the reference layout; libvpx and most IVF
/// tooling read little-endian.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    #[default]
    BigEndian,
}

impl ByteOrder {
    fn put_u16(self, dst: &mut [u8], value: u16) {
        let bytes = match self {
            Self::LittleEndian => value.to_le_bytes(),
            Self::BigEndian => value.to_be_bytes(),
        };
        dst[..2].copy_from_slice(&bytes);
    }

    fn put_u32(self, dst: &mut [u8], value: u32) {
        let bytes = match self {
            Self::LittleEndian => value.to_le_bytes(),
            Self::BigEndian => value.to_be_bytes(),
        };
        dst[..4].copy_from_slice(&bytes);
    }

    fn put_u64(self, dst: &mut [u8], value: u64) {
        let bytes = match self {
            Self::LittleEndian => value.to_le_bytes(),
            Self::BigEndian => value.to_be_bytes(),
        };
        dst[..8].copy_from_slice(&bytes);
    }

    fn get_u16(self, src: &[u8]) -> u16 {
        let bytes = [src[0], src[1]];
        match self {
            Self::LittleEndian => u16::from_le_bytes(bytes),
            Self::BigEndian => u16::from_be_bytes(bytes),
        }
    }

    fn get_u32(self, src: &[u8]) -> u32 {
        let bytes = [src[0], src[1], src[2], src[3]];
        match self {
            Self::LittleEndian => u32::from_le_bytes(bytes),
            Self::BigEndian => u32::from_be_bytes(bytes),
        }
    }

    fn get_u64(self, src: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&src[..8]);
        match self {
            Self::LittleEndian => u64::from_le_bytes(bytes),
            Self::BigEndian => u64::from_be_bytes(bytes),
        }
    }
}

/// The 32-byte file-level header.
///
/// Layout: magic (0..4), version (4..6), header size (6..8), fourcc (8..12),
/// width (12..14), height (14..16), timebase numerator (16..20),
/// timebase denominator (20..24), frame count hint (24..26), reserved (26..32).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerHeader {
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub timebase_numerator: u32,
    pub timebase_denominator: u32,
    pub frame_count_hint: u16,
}

impl ContainerHeader {
    pub fn encode(&self, order: ByteOrder) -> [u8; IVF_HEADER_LEN] {
        let mut out = [0u8; IVF_HEADER_LEN];
        out[0..4].copy_from_slice(&IVF_MAGIC);
        order.put_u16(&mut out[4..6], IVF_VERSION);
        order.put_u16(&mut out[6..8], IVF_HEADER_LEN as u16);
        out[8..12].copy_from_slice(&self.fourcc);
        order.put_u16(&mut out[12..14], self.width);
        order.put_u16(&mut out[14..16], self.height);
        order.put_u32(&mut out[16..20], self.timebase_numerator);
        order.put_u32(&mut out[20..24], self.timebase_denominator);
        order.put_u16(&mut out[24..26], self.frame_count_hint);
        out
    }

    pub fn decode(bytes: &[u8], order: ByteOrder) -> Result<Self, ContainerError> {
        if bytes.len() < IVF_HEADER_LEN {
            return Err(ContainerError::Truncated {
                what: "file header",
                expected: IVF_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != IVF_MAGIC {
            return Err(ContainerError::BadMagic(magic));
        }
        let header_len = order.get_u16(&bytes[6..8]);
        if header_len as usize != IVF_HEADER_LEN {
            return Err(ContainerError::Truncated {
                what: "file header",
                expected: IVF_HEADER_LEN,
                actual: header_len as usize,
            });
        }
        Ok(Self {
            fourcc: [bytes[8], bytes[9], bytes[10], bytes[11]],
            width: order.get_u16(&bytes[12..14]),
            height: order.get_u16(&bytes[14..16]),
            timebase_numerator: order.get_u32(&bytes[16..20]),
            timebase_denominator: order.get_u32(&bytes[20..24]),
            frame_count_hint: order.get_u16(&bytes[24..26]),
        })
    }
}

/// The 12-byte record in front of every payload: size (0..4), timestamp (4..12).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRecord {
    pub payload_len: u32,
    pub timestamp: u64,
}

impl FrameRecord {
    pub fn encode(&self, order: ByteOrder) -> [u8; IVF_FRAME_RECORD_LEN] {
        let mut out = [0u8; IVF_FRAME_RECORD_LEN];
        order.put_u32(&mut out[0..4], self.payload_len);
        order.put_u64(&mut out[4..12], self.timestamp);
        out
    }

    pub fn decode(bytes: &[u8], order: ByteOrder) -> Result<Self, ContainerError> {
        if bytes.len() < IVF_FRAME_RECORD_LEN {
            return Err(ContainerError::Truncated {
                what: "frame record",
                expected: IVF_FRAME_RECORD_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            payload_len: order.get_u32(&bytes[0..4]),
            timestamp: order.get_u64(&bytes[4..12]),
        })
    }
}
