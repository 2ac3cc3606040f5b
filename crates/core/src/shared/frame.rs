/// Bytes needed for one 4:2:0 frame (full-resolution luma, quarter-resolution chroma pair).
pub fn yuv420_frame_len(width: u32, height: u32) -> usize {
    (width as usize) * (height as usize) * 3 / 2
}

/// A single raw 4:2:0 frame: luma plane followed by chroma samples.
///
/// The layout (planar I420 or semi-planar NV12) is decided by the encoder
/// configuration; the loop treats the bytes as opaque and only copies them.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    index: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, index: u64) -> Self {
        Self { data, index }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Position of this frame in the (cyclic) source stream, counted across wraps.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
