use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::container::domain::ivf_header::{
    ByteOrder, ContainerError, ContainerHeader, FrameRecord,
};
use crate::shared::constants::{IVF_FRAME_RECORD_LEN, IVF_HEADER_LEN};
use crate::shared::read::read_up_to;

/// Parses an IVF stream produced by [`IvfWriter`](super::ivf_writer::IvfWriter).
pub struct IvfReader<R: Read> {
    reader: R,
    header: ContainerHeader,
    byte_order: ByteOrder,
}

impl IvfReader<BufReader<File>> {
    pub fn open(path: &Path, byte_order: ByteOrder) -> Result<Self, ContainerError> {
        let file = File::open(path)?;
        Self::with_byte_order(BufReader::new(file), byte_order)
    }
}

impl<R: Read> IvfReader<R> {
    pub fn new(reader: R) -> Result<Self, ContainerError> {
        Self::with_byte_order(reader, ByteOrder::default())
    }

    pub fn with_byte_order(mut reader: R, byte_order: ByteOrder) -> Result<Self, ContainerError> {
        let mut bytes = [0u8; IVF_HEADER_LEN];
        let n = read_up_to(&mut reader, &mut bytes)?;
        let header = ContainerHeader::decode(&bytes[..n], byte_order)?;
        Ok(Self {
            reader,
            header,
            byte_order,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Returns the next record and its payload, or `None` at a clean end of stream.
    pub fn next_unit(&mut self) -> Result<Option<(FrameRecord, Vec<u8>)>, ContainerError> {
        let mut bytes = [0u8; IVF_FRAME_RECORD_LEN];
        let n = read_up_to(&mut self.reader, &mut bytes)?;
        if n == 0 {
            return Ok(None);
        }
        let record = FrameRecord::decode(&bytes[..n], self.byte_order)?;

        // Grows with the bytes actually present, not with the declared size.
        let expected = record.payload_len as usize;
        let mut payload = Vec::new();
        let got = Read::by_ref(&mut self.reader)
            .take(u64::from(record.payload_len))
            .read_to_end(&mut payload)?;
        if got < expected {
            return Err(ContainerError::Truncated {
                what: "frame payload",
                expected,
                actual: got,
            });
        }
        Ok(Some((record, payload)))
    }
}
