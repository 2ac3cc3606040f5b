use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::container::domain::container_writer::ContainerWriter;
use crate::container::domain::ivf_header::{
    ByteOrder, ContainerError, ContainerHeader, FrameRecord,
};
use crate::shared::constants::{DEFAULT_FRAME_COUNT_HINT, DEFAULT_FRAME_INTERVAL};

/// Writes an IVF stream (`DKIF` header + size/timestamp records) to any sink.
///
/// Every unit is flushed as soon as it is written, so an interrupted run
/// leaves only whole records behind.
pub struct IvfWriter<W: Write = BufWriter<File>> {
    sink: Option<W>,
    fourcc: [u8; 4],
    byte_order: ByteOrder,
    frame_interval: u64,
    frame_count_hint: u16,
    header_written: bool,
    units_written: u64,
}

impl IvfWriter<BufWriter<File>> {
    pub fn create(path: &Path, fourcc: [u8; 4]) -> Result<Self, ContainerError> {
        let file = File::create(path).map_err(|source| ContainerError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Writing IVF output to {}", path.display());
        Ok(Self::new(BufWriter::new(file), fourcc))
    }
}

impl<W: Write> IvfWriter<W> {
    pub fn new(sink: W, fourcc: [u8; 4]) -> Self {
        Self {
            sink: Some(sink),
            fourcc,
            byte_order: ByteOrder::default(),
            frame_interval: DEFAULT_FRAME_INTERVAL,
            frame_count_hint: DEFAULT_FRAME_COUNT_HINT,
            header_written: false,
            units_written: 0,
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_frame_interval(mut self, frame_interval: u64) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    pub fn with_frame_count_hint(mut self, hint: u16) -> Self {
        self.frame_count_hint = hint;
        self
    }

    pub fn units_written(&self) -> u64 {
        self.units_written
    }

    fn sink(&mut self) -> Result<&mut W, ContainerError> {
        self.sink.as_mut().ok_or(ContainerError::Closed)
    }
}

fn narrow_u16(field: &'static str, value: u32) -> Result<u16, ContainerError> {
    u16::try_from(value).map_err(|_| ContainerError::FieldOverflow {
        field,
        value: value as u64,
    })
}

impl<W: Write + Send> ContainerWriter for IvfWriter<W> {
    fn write_file_header(
        &mut self,
        width: u32,
        height: u32,
        timebase_numerator: u32,
    ) -> Result<(), ContainerError> {
        if self.header_written {
            return Err(ContainerError::HeaderAlreadyWritten);
        }
        let header = ContainerHeader {
            fourcc: self.fourcc,
            width: narrow_u16("width", width)?,
            height: narrow_u16("height", height)?,
            timebase_numerator,
            timebase_denominator: 1,
            frame_count_hint: self.frame_count_hint,
        };
        let bytes = header.encode(self.byte_order);
        let sink = self.sink()?;
        sink.write_all(&bytes)?;
        sink.flush()?;
        self.header_written = true;
        Ok(())
    }

    fn timestamp_for(&self, presentation_index: u64) -> Result<u64, ContainerError> {
        presentation_index
            .checked_mul(self.frame_interval)
            .and_then(|t| t.checked_add(1))
            .ok_or(ContainerError::FieldOverflow {
                field: "timestamp",
                value: presentation_index,
            })
    }

    fn write_unit(
        &mut self,
        payload: &[u8],
        presentation_index: u64,
    ) -> Result<(), ContainerError> {
        if !self.header_written {
            return Err(ContainerError::HeaderMissing);
        }
        let payload_len =
            u32::try_from(payload.len()).map_err(|_| ContainerError::FieldOverflow {
                field: "payload size",
                value: payload.len() as u64,
            })?;
        let timestamp = self.timestamp_for(presentation_index)?;
        let record = FrameRecord {
            payload_len,
            timestamp,
        }
        .encode(self.byte_order);

        let sink = self.sink()?;
        sink.write_all(&record)?;
        sink.write_all(payload)?;
        sink.flush()?;
        self.units_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ContainerError> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush()?;
            log::debug!("IVF writer closed after {} units", self.units_written);
        }
        Ok(())
    }
}
