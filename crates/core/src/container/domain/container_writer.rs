use super::ivf_header::ContainerError;

/// Serializes compressed access units into a chunked container.
///
/// The file header goes out exactly once, before any unit; each unit is a
/// fixed-size record followed by its payload.
pub trait ContainerWriter: Send {
    fn write_file_header(
        &mut self,
        width: u32,
        height: u32,
        timebase_numerator: u32,
    ) -> Result<(), ContainerError>;

    /// Timestamp recorded for the unit at `presentation_index`:
    /// `presentation_index * frame_interval + 1`.
    fn timestamp_for(&self, presentation_index: u64) -> Result<u64, ContainerError>;

    /// Writes one unit stamped with `timestamp_for(presentation_index)`.
    fn write_unit(&mut self, payload: &[u8], presentation_index: u64)
        -> Result<(), ContainerError>;

    /// Flushes and releases the sink. Safe to call more than once.
    fn close(&mut self) -> Result<(), ContainerError>;
}
