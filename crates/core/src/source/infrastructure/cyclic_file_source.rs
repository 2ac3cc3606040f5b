use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::shared::frame::{yuv420_frame_len, Frame};
use crate::shared::read::read_up_to;
use crate::source::domain::frame_source::{FrameSource, SourceError};

/// Reads raw 4:2:0 frames from a byte stream, looping back to the start
/// whenever the stream is exhausted.
///
/// A trailing partial frame is delivered zero-padded; the following call
/// starts again from the first frame.
pub struct CyclicFileSource<R = BufReader<File>> {
    reader: Option<R>,
    frame_len: usize,
    next_index: u64,
    wraps: u64,
}

impl CyclicFileSource<BufReader<File>> {
    pub fn open(path: &Path, width: u32, height: u32) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| SourceError::Open {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if len == 0 {
            return Err(SourceError::Empty);
        }
        log::info!(
            "Opened input {} ({len} bytes, {width}x{height} frames)",
            path.display()
        );
        Ok(Self::from_reader(BufReader::new(file), width, height))
    }
}

impl<R: Read + Seek> CyclicFileSource<R> {
    pub fn from_reader(reader: R, width: u32, height: u32) -> Self {
        Self {
            reader: Some(reader),
            frame_len: yuv420_frame_len(width, height),
            next_index: 0,
            wraps: 0,
        }
    }

    /// Number of times the stream has been rewound.
    pub fn wraps(&self) -> u64 {
        self.wraps
    }
}

impl<R: Read + Seek + Send> FrameSource for CyclicFileSource<R> {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let reader = self.reader.as_mut().ok_or(SourceError::Closed)?;
        let mut data = vec![0u8; self.frame_len];

        let mut filled = read_up_to(reader, &mut data)?;
        if filled < self.frame_len {
            log::debug!("---- eof ---- (rewinding after {filled} bytes)");
            reader.seek(SeekFrom::Start(0))?;
            self.wraps += 1;

            // Exactly at a frame boundary: the first frame is the next one.
            if filled == 0 {
                filled = read_up_to(reader, &mut data)?;
                if filled == 0 {
                    return Err(SourceError::Empty);
                }
                if filled < self.frame_len {
                    reader.seek(SeekFrom::Start(0))?;
                    self.wraps += 1;
                }
            }
        }

        let frame = Frame::new(data, self.next_index);
        self.next_index += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        self.reader = None;
    }
}
