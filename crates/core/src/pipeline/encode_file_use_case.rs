use crate::container::domain::container_writer::ContainerWriter;
use crate::encoder::domain::buffer_broker::EncoderBufferBroker;
use crate::pipeline::encode_error::EncodeError;
use crate::pipeline::encode_logger::EncodeLogger;
use crate::pipeline::encode_loop::{EncodeLoop, EncodeLoopConfig, EncodeSummary};
use crate::pipeline::stop_token::StopToken;
use crate::source::domain::frame_source::FrameSource;

/// Stream header fields written before the first unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamHeader {
    pub width: u32,
    pub height: u32,
    pub timebase_numerator: u32,
}

/// Encode pipeline: write header → drive encoder until stopped → close.
///
/// Single use: the collaborators are moved into the loop on the first
/// `execute`.
pub struct EncodeFileUseCase {
    source: Option<Box<dyn FrameSource>>,
    broker: Option<Box<dyn EncoderBufferBroker>>,
    writer: Option<Box<dyn ContainerWriter>>,
    logger: Option<Box<dyn EncodeLogger>>,
    header: StreamHeader,
    config: EncodeLoopConfig,
    stop: StopToken,
}

impl EncodeFileUseCase {
    pub fn new(
        source: Box<dyn FrameSource>,
        broker: Box<dyn EncoderBufferBroker>,
        writer: Box<dyn ContainerWriter>,
        header: StreamHeader,
        config: EncodeLoopConfig,
        stop: StopToken,
    ) -> Self {
        Self {
            source: Some(source),
            broker: Some(broker),
            writer: Some(writer),
            logger: None,
            header,
            config,
            stop,
        }
    }

    pub fn with_logger(mut self, logger: Box<dyn EncodeLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn execute(&mut self) -> Result<EncodeSummary, EncodeError> {
        let (mut source, broker, mut writer) =
            match (self.source.take(), self.broker.take(), self.writer.take()) {
                (Some(s), Some(b), Some(w)) => (s, b, w),
                _ => return Err(EncodeError::AlreadyExecuted),
            };

        let StreamHeader {
            width,
            height,
            timebase_numerator,
        } = self.header;
        if let Err(e) = writer.write_file_header(width, height, timebase_numerator) {
            source.close();
            let _ = writer.close();
            return Err(e.into());
        }
        log::info!("Encoding {width}x{height} frames until stopped");

        let mut encode_loop =
            EncodeLoop::new(source, broker, writer, self.config.clone(), self.stop.clone());
        if let Some(logger) = self.logger.take() {
            encode_loop = encode_loop.with_logger(logger);
        }
        let summary = encode_loop.run()?;

        let counters = summary.counters;
        log::info!(
            "Encode finished: {} submitted, {} emitted, {} dropped",
            counters.submitted,
            counters.emitted,
            counters.dropped
        );
        Ok(summary)
    }
}
