use std::time::Instant;

use crate::container::domain::container_writer::ContainerWriter;
use crate::encoder::domain::buffer_broker::{
    BrokerTimeouts, BufferFlags, EncodedUnit, EncoderBufferBroker,
};
use crate::pipeline::encode_error::EncodeError;
use crate::pipeline::encode_logger::{EncodeLogger, NullEncodeLogger};
use crate::pipeline::stop_token::StopToken;
use crate::shared::constants::DEFAULT_SYNC_INTERVAL;
use crate::source::domain::frame_source::FrameSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Draining,
    Stopped,
}

/// What to do with units that only carry codec configuration.
///
/// Config units never advance the presentation counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConfigUnitPolicy {
    /// Write as a record of its own, stamped with the next presentation index.
    #[default]
    Record,
    /// Prepend to the payload of the next picture unit.
    MergeIntoNext,
    /// Leave out of the container.
    Drop,
}

#[derive(Clone, Debug)]
pub struct EncodeLoopConfig {
    /// Submitted frames between keyframe requests; 0 disables them.
    pub sync_interval: u64,
    pub timeouts: BrokerTimeouts,
    /// Start draining after this many submitted frames.
    pub max_frames: Option<u64>,
    pub config_units: ConfigUnitPolicy,
}

impl Default for EncodeLoopConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            timeouts: BrokerTimeouts::default(),
            max_frames: None,
            config_units: ConfigUnitPolicy::default(),
        }
    }
}

/// Counters owned by the loop thread. `submitted` and `emitted` only grow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeCounters {
    pub submitted: u64,
    pub emitted: u64,
    /// Frames read but not submitted because no input buffer was free in time.
    pub dropped: u64,
    pub config_units: u64,
    pub sync_requests: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeSummary {
    pub counters: EncodeCounters,
    pub final_state: LoopState,
}

impl EncodeSummary {
    pub fn is_balanced(&self) -> bool {
        self.counters.submitted == self.counters.emitted
    }
}

/// Feeds frames into an encoder and writes what comes out.
///
/// `Running` submits one frame and polls for one unit per iteration until a
/// stop is requested; `Draining` sends end of stream and collects units until
/// the encoder goes quiet; `Stopped` closes the source and the writer.
pub struct EncodeLoop {
    source: Box<dyn FrameSource>,
    broker: Box<dyn EncoderBufferBroker>,
    writer: Box<dyn ContainerWriter>,
    logger: Box<dyn EncodeLogger>,
    config: EncodeLoopConfig,
    stop: StopToken,
    state: LoopState,
    counters: EncodeCounters,
    last_sync_at: Option<u64>,
    pending_config: Vec<u8>,
}

impl EncodeLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        broker: Box<dyn EncoderBufferBroker>,
        writer: Box<dyn ContainerWriter>,
        config: EncodeLoopConfig,
        stop: StopToken,
    ) -> Self {
        Self {
            source,
            broker,
            writer,
            logger: Box::new(NullEncodeLogger),
            config,
            stop,
            state: LoopState::Running,
            counters: EncodeCounters::default(),
            last_sync_at: None,
            pending_config: Vec::new(),
        }
    }

    pub fn with_logger(mut self, logger: Box<dyn EncodeLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn counters(&self) -> EncodeCounters {
        self.counters
    }

    /// Runs to completion. The source and writer are closed even when a
    /// fatal error cuts the run short.
    pub fn run(mut self) -> Result<EncodeSummary, EncodeError> {
        let result = self.drive();
        let closed = self.finish();
        result?;
        closed?;

        self.logger.summary();
        Ok(EncodeSummary {
            counters: self.counters,
            final_state: self.state,
        })
    }

    fn drive(&mut self) -> Result<(), EncodeError> {
        while self.state == LoopState::Running {
            if self.stop.is_stop_requested() {
                self.logger.info("Stop requested, draining encoder");
                self.state = LoopState::Draining;
                break;
            }
            if let Some(max) = self.config.max_frames {
                if self.counters.submitted >= max {
                    self.logger
                        .info(&format!("Reached {max} frames, draining encoder"));
                    self.state = LoopState::Draining;
                    break;
                }
            }
            self.step()?;
            self.logger
                .progress(self.counters.submitted, self.counters.emitted);
        }

        if self.state == LoopState::Draining {
            self.drain()?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), EncodeError> {
        let interval = self.config.sync_interval;
        if interval > 0
            && self.counters.submitted % interval == 0
            && self.last_sync_at != Some(self.counters.submitted)
        {
            log::debug!("request-sync at frame {}", self.counters.submitted);
            self.broker.request_sync_frame()?;
            self.last_sync_at = Some(self.counters.submitted);
            self.counters.sync_requests += 1;
        }

        let started = Instant::now();
        let frame = self.source.next_frame()?;
        self.logger.timing("read", elapsed_ms(started));

        let started = Instant::now();
        let timestamp = self.timestamp_for(self.counters.submitted)?;
        match self.broker.acquire_input(self.config.timeouts.input)? {
            Some(mut input) => {
                let len = match input.fill(frame.data()) {
                    Ok(len) => len,
                    Err(e) => {
                        self.broker.return_input(input)?;
                        return Err(e.into());
                    }
                };
                self.broker
                    .submit_input(input, len, timestamp, BufferFlags::NONE)?;
                self.counters.submitted += 1;
            }
            None => self.counters.dropped += 1,
        }
        self.logger.timing("submit", elapsed_ms(started));

        let started = Instant::now();
        if let Some(unit) = self.broker.acquire_output(self.config.timeouts.output)? {
            self.handle_unit(unit)?;
        }
        self.logger.timing("output", elapsed_ms(started));
        Ok(())
    }

    fn drain(&mut self) -> Result<(), EncodeError> {
        let timestamp = self.timestamp_for(self.counters.submitted)?;
        match self.broker.acquire_input(self.config.timeouts.output)? {
            Some(input) => {
                self.broker
                    .submit_input(input, 0, timestamp, BufferFlags::END_OF_STREAM)?;
            }
            None => log::warn!("No input buffer free for end of stream; draining anyway"),
        }

        while let Some(unit) = self.broker.acquire_output(self.config.timeouts.output)? {
            self.handle_unit(unit)?;
            self.logger
                .progress(self.counters.submitted, self.counters.emitted);
        }

        if !self.pending_config.is_empty() {
            let payload = std::mem::take(&mut self.pending_config);
            self.writer.write_unit(&payload, self.counters.emitted)?;
        }

        self.state = LoopState::Stopped;
        Ok(())
    }

    /// Writes one unit and always releases it, even when writing fails.
    fn handle_unit(&mut self, unit: EncodedUnit) -> Result<(), EncodeError> {
        let written = self.write_unit(&unit);
        self.broker.release_output(unit)?;
        written
    }

    fn write_unit(&mut self, unit: &EncodedUnit) -> Result<(), EncodeError> {
        if unit.is_codec_config() {
            self.counters.config_units += 1;
            if unit.is_empty() {
                return Ok(());
            }
            match self.config.config_units {
                ConfigUnitPolicy::Record => {
                    self.writer
                        .write_unit(unit.payload(), self.counters.emitted)?;
                }
                ConfigUnitPolicy::MergeIntoNext => {
                    self.pending_config.extend_from_slice(unit.payload());
                }
                ConfigUnitPolicy::Drop => {}
            }
            return Ok(());
        }

        // Empty end-of-stream markers carry no picture.
        if unit.is_empty() {
            return Ok(());
        }

        if self.pending_config.is_empty() {
            self.writer
                .write_unit(unit.payload(), self.counters.emitted)?;
        } else {
            let mut merged = std::mem::take(&mut self.pending_config);
            merged.extend_from_slice(unit.payload());
            self.writer.write_unit(&merged, self.counters.emitted)?;
        }

        if self.counters.emitted >= self.counters.submitted {
            log::warn!(
                "Encoder produced more units than frames submitted ({} >= {})",
                self.counters.emitted,
                self.counters.submitted
            );
        }
        self.counters.emitted += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EncodeError> {
        self.source.close();
        self.writer.close()?;

        let EncodeCounters {
            submitted, emitted, ..
        } = self.counters;
        if submitted != emitted {
            log::warn!("Frame count mismatch: submitted {submitted}, emitted {emitted}");
        }
        Ok(())
    }

    /// Submission timestamps match the ones the writer records.
    fn timestamp_for(&self, index: u64) -> Result<i64, EncodeError> {
        let timestamp = self.writer.timestamp_for(index)?;
        Ok(timestamp.min(i64::MAX as u64) as i64)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::domain::ivf_header::{ByteOrder, ContainerError};
    use crate::container::infrastructure::ivf_reader::IvfReader;
    use crate::container::infrastructure::ivf_writer::tests::SharedBuf;
    use crate::container::infrastructure::ivf_writer::IvfWriter;
    use crate::encoder::domain::buffer_broker::{EncoderError, InputBuffer};
    use crate::shared::frame::Frame;
    use crate::source::domain::frame_source::SourceError;
    use crate::source::infrastructure::cyclic_file_source::CyclicFileSource;
    use rstest::rstest;
    use std::collections::VecDeque;
    use std::io::{Cursor, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // --- Stubs ---

    #[derive(Default)]
    struct Ledger {
        submitted: Vec<(usize, i64, BufferFlags)>,
        acquired_units: Vec<usize>,
        released_units: Vec<usize>,
        returned_inputs: usize,
        sync_requests: usize,
    }

    /// Echoes each submitted frame back as a unit once `lag` newer frames
    /// have been submitted; end of stream, or a call that found no input
    /// free, releases everything still held.
    struct StubBroker {
        ledger: Arc<Mutex<Ledger>>,
        held: VecDeque<(Vec<u8>, BufferFlags, i64)>,
        lag: usize,
        input_pattern: Vec<bool>,
        input_calls: usize,
        next_unit: usize,
        eos: bool,
        starved: bool,
    }

    impl StubBroker {
        fn new(lag: usize) -> Self {
            Self {
                ledger: Arc::new(Mutex::new(Ledger::default())),
                held: VecDeque::new(),
                lag,
                input_pattern: vec![true],
                input_calls: 0,
                next_unit: 0,
                eos: false,
                starved: false,
            }
        }

        fn with_input_pattern(mut self, pattern: Vec<bool>) -> Self {
            self.input_pattern = pattern;
            self
        }

        fn with_config_unit(mut self, bytes: Vec<u8>) -> Self {
            self.held
                .push_back((bytes, BufferFlags::CODEC_CONFIG, 0));
            self.lag += 1;
            self
        }

        fn ledger(&self) -> Arc<Mutex<Ledger>> {
            self.ledger.clone()
        }
    }

    impl EncoderBufferBroker for StubBroker {
        fn acquire_input(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<InputBuffer>, EncoderError> {
            let available = self.input_pattern[self.input_calls % self.input_pattern.len()];
            self.input_calls += 1;
            self.starved = !available;
            Ok(available.then(|| InputBuffer::new(0, vec![0u8; 6])))
        }

        fn submit_input(
            &mut self,
            buffer: InputBuffer,
            byte_count: usize,
            timestamp: i64,
            flags: BufferFlags,
        ) -> Result<(), EncoderError> {
            let (_, data) = buffer.into_parts();
            self.ledger
                .lock()
                .unwrap()
                .submitted
                .push((byte_count, timestamp, flags));
            if flags.contains(BufferFlags::END_OF_STREAM) {
                self.eos = true;
            } else {
                self.held
                    .push_back((data[..byte_count].to_vec(), BufferFlags::NONE, timestamp));
            }
            Ok(())
        }

        fn acquire_output(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<EncodedUnit>, EncoderError> {
            let flushing = (self.eos || self.starved) && !self.held.is_empty();
            if self.held.len() <= self.lag && !flushing {
                return Ok(None);
            }
            let (data, flags, ts) = self.held.pop_front().unwrap();
            let id = self.next_unit;
            self.next_unit += 1;
            self.ledger.lock().unwrap().acquired_units.push(id);
            let len = data.len();
            Ok(Some(EncodedUnit::new(id, data, len, flags, ts)))
        }

        fn release_output(&mut self, unit: EncodedUnit) -> Result<(), EncoderError> {
            self.ledger
                .lock()
                .unwrap()
                .released_units
                .push(unit.slot());
            Ok(())
        }

        fn return_input(&mut self, _buffer: InputBuffer) -> Result<(), EncoderError> {
            self.ledger.lock().unwrap().returned_inputs += 1;
            Ok(())
        }

        fn request_sync_frame(&mut self) -> Result<(), EncoderError> {
            self.ledger.lock().unwrap().sync_requests += 1;
            Ok(())
        }
    }

    /// Frames of 2x2 pixels whose bytes all equal their index (mod 256).
    struct CountingSource {
        next: u64,
        closed: Arc<Mutex<bool>>,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                next: 0,
                closed: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl FrameSource for CountingSource {
        fn frame_len(&self) -> usize {
            6
        }

        fn next_frame(&mut self) -> Result<Frame, SourceError> {
            let frame = Frame::new(vec![self.next as u8; 6], self.next);
            self.next += 1;
            Ok(frame)
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    struct FailingWriter;

    impl ContainerWriter for FailingWriter {
        fn write_file_header(&mut self, _: u32, _: u32, _: u32) -> Result<(), ContainerError> {
            Ok(())
        }

        fn timestamp_for(&self, presentation_index: u64) -> Result<u64, ContainerError> {
            Ok(presentation_index * 16_777 + 1)
        }

        fn write_unit(&mut self, _: &[u8], _: u64) -> Result<(), ContainerError> {
            Err(ContainerError::Io(std::io::Error::other("disk full")))
        }

        fn close(&mut self) -> Result<(), ContainerError> {
            Ok(())
        }
    }

    /// Records every progress observation and requests a stop after `stop_after` of them.
    struct RecordingLogger {
        observations: Arc<Mutex<Vec<(u64, u64)>>>,
        stop: StopToken,
        stop_after: Option<usize>,
    }

    impl EncodeLogger for RecordingLogger {
        fn progress(&mut self, submitted: u64, emitted: u64) {
            let mut obs = self.observations.lock().unwrap();
            obs.push((submitted, emitted));
            if Some(obs.len()) == self.stop_after {
                self.stop.request_stop();
            }
        }
        fn timing(&mut self, _stage: &str, _duration_ms: f64) {}
        fn info(&mut self, _message: &str) {}
    }

    fn header_written_writer() -> (IvfWriter<SharedBuf>, SharedBuf) {
        let buf = SharedBuf::default();
        let mut writer = IvfWriter::new(buf.clone(), *b"VP80");
        writer.write_file_header(2, 2, 1_000_000).unwrap();
        (writer, buf)
    }

    fn records(bytes: &[u8]) -> Vec<(u64, Vec<u8>)> {
        let mut reader = IvfReader::new(bytes).unwrap();
        let mut out = Vec::new();
        while let Some((record, payload)) = reader.next_unit().unwrap() {
            assert_eq!(record.payload_len as usize, payload.len());
            out.push((record.timestamp, payload));
        }
        out
    }

    fn run_loop(
        broker: StubBroker,
        config: EncodeLoopConfig,
        stop: StopToken,
    ) -> (Result<EncodeSummary, EncodeError>, SharedBuf) {
        let (writer, buf) = header_written_writer();
        let result = EncodeLoop::new(
            Box::new(CountingSource::new()),
            Box::new(broker),
            Box::new(writer),
            config,
            stop,
        )
        .run();
        (result, buf)
    }

    fn limited(max_frames: u64) -> EncodeLoopConfig {
        EncodeLoopConfig {
            max_frames: Some(max_frames),
            ..EncodeLoopConfig::default()
        }
    }

    // --- Scenarios ---

    #[test]
    fn test_stop_before_first_frame_yields_header_only_file() {
        let broker = StubBroker::new(1);
        let ledger = broker.ledger();
        let stop = StopToken::new();
        stop.request_stop();

        let (result, buf) = run_loop(broker, EncodeLoopConfig::default(), stop);
        let summary = result.unwrap();

        assert_eq!(summary.counters.submitted, 0);
        assert_eq!(summary.counters.emitted, 0);
        assert_eq!(summary.final_state, LoopState::Stopped);
        assert!(summary.is_balanced());

        let bytes = buf.bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..4], b"DKIF");

        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.submitted.len(), 1);
        assert!(ledger.submitted[0].2.contains(BufferFlags::END_OF_STREAM));
        assert_eq!(ledger.submitted[0].0, 0);
    }

    #[test]
    fn test_two_frame_file_stopped_after_one_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.yuv");
        let output = dir.path().join("out.ivf");
        let mut frames = vec![0x11u8; 6];
        frames.extend_from_slice(&[0x22; 6]);
        std::fs::File::create(&input)
            .unwrap()
            .write_all(&frames)
            .unwrap();

        let source = CyclicFileSource::open(&input, 2, 2).unwrap();
        let mut writer = IvfWriter::create(&output, *b"VP80").unwrap();
        writer.write_file_header(2, 2, 1_000_000).unwrap();

        let stop = StopToken::new();
        let observations = Arc::new(Mutex::new(Vec::new()));
        let logger = RecordingLogger {
            observations: observations.clone(),
            stop: stop.clone(),
            stop_after: Some(1),
        };

        let summary = EncodeLoop::new(
            Box::new(source),
            Box::new(StubBroker::new(1)),
            Box::new(writer),
            EncodeLoopConfig::default(),
            stop,
        )
        .with_logger(Box::new(logger))
        .run()
        .unwrap();

        assert_eq!(summary.counters.submitted, 1);
        assert_eq!(summary.counters.emitted, 1);

        let bytes = std::fs::read(&output).unwrap();
        let mut reader = IvfReader::new(&bytes[..]).unwrap();
        assert_eq!(&reader.header().fourcc, b"VP80");
        assert_eq!((reader.header().width, reader.header().height), (2, 2));
        let (record, payload) = reader.next_unit().unwrap().unwrap();
        assert_eq!(record.payload_len, 6);
        assert_eq!(record.timestamp, 1);
        assert_eq!(payload, vec![0x11; 6]);
    }

    #[test]
    fn test_every_unit_released_exactly_once() {
        let broker = StubBroker::new(3).with_config_unit(vec![0xC0, 0xC1]);
        let ledger = broker.ledger();

        let (result, _) = run_loop(broker, limited(25), StopToken::new());
        result.unwrap();

        let ledger = ledger.lock().unwrap();
        let mut acquired = ledger.acquired_units.clone();
        let mut released = ledger.released_units.clone();
        acquired.sort_unstable();
        released.sort_unstable();
        assert_eq!(acquired, released);
        released.dedup();
        assert_eq!(released.len(), ledger.released_units.len());
        assert_eq!(acquired.len(), 26);
    }

    #[test]
    fn test_counters_monotonic_and_emitted_never_exceeds_submitted() {
        let broker = StubBroker::new(2).with_input_pattern(vec![true, false, true, true, false]);
        let stop = StopToken::new();
        let observations = Arc::new(Mutex::new(Vec::new()));
        let logger = RecordingLogger {
            observations: observations.clone(),
            stop: stop.clone(),
            stop_after: Some(40),
        };

        let (writer, _) = header_written_writer();
        let summary = EncodeLoop::new(
            Box::new(CountingSource::new()),
            Box::new(broker),
            Box::new(writer),
            EncodeLoopConfig::default(),
            stop,
        )
        .with_logger(Box::new(logger))
        .run()
        .unwrap();

        let obs = observations.lock().unwrap();
        assert!(obs.len() >= 40);
        for pair in obs.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
            assert!(pair[1].1 >= pair[0].1);
        }
        assert!(obs.iter().all(|(submitted, emitted)| emitted <= submitted));

        assert_eq!(summary.counters.submitted, 24);
        assert_eq!(summary.counters.dropped, 16);
        assert!(summary.is_balanced());
    }

    #[test]
    fn test_dropped_frames_are_not_retried() {
        let broker = StubBroker::new(0).with_input_pattern(vec![false, true]);
        let ledger = broker.ledger();

        let (result, buf) = run_loop(broker, limited(3), StopToken::new());
        let summary = result.unwrap();
        assert_eq!(summary.counters.dropped, 3);

        // Frames 0, 2, 4 hit a busy encoder; 1, 3, 5 went through.
        let payloads: Vec<u8> = records(&buf.bytes()).iter().map(|(_, p)| p[0]).collect();
        assert_eq!(payloads, vec![1, 3, 5]);
        let timestamps: Vec<i64> = ledger
            .lock()
            .unwrap()
            .submitted
            .iter()
            .filter(|(_, _, f)| !f.contains(BufferFlags::END_OF_STREAM))
            .map(|(_, ts, _)| *ts)
            .collect();
        assert_eq!(timestamps, vec![1, 16_778, 33_555]);
    }

    #[test]
    fn test_sync_requested_once_per_interval() {
        let broker = StubBroker::new(0).with_input_pattern(vec![true, false]);
        let ledger = broker.ledger();
        let config = EncodeLoopConfig {
            sync_interval: 2,
            ..limited(5)
        };

        let (result, _) = run_loop(broker, config, StopToken::new());
        let summary = result.unwrap();

        // At submitted = 0, 2, 4, despite repeated iterations at each count.
        assert_eq!(summary.counters.sync_requests, 3);
        assert_eq!(ledger.lock().unwrap().sync_requests, 3);
    }

    #[test]
    fn test_sync_disabled_with_zero_interval() {
        let config = EncodeLoopConfig {
            sync_interval: 0,
            ..limited(3)
        };
        let (result, _) = run_loop(StubBroker::new(0), config, StopToken::new());
        assert_eq!(result.unwrap().counters.sync_requests, 0);
    }

    #[test]
    fn test_drain_collects_units_held_by_encoder() {
        let (result, buf) = run_loop(StubBroker::new(4), limited(6), StopToken::new());
        let summary = result.unwrap();
        assert_eq!(summary.counters.emitted, 6);

        let recs = records(&buf.bytes());
        let timestamps: Vec<u64> = recs.iter().map(|(ts, _)| *ts).collect();
        let expected: Vec<u64> = (0..6).map(|i| i * 16_777 + 1).collect();
        assert_eq!(timestamps, expected);
        let payloads: Vec<u8> = recs.iter().map(|(_, p)| p[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4, 5]);
    }

    #[rstest]
    #[case::record(ConfigUnitPolicy::Record, vec![(1, vec![0xC0, 0xC1]), (1, vec![0; 6]), (16_778, vec![1; 6])])]
    #[case::merge(ConfigUnitPolicy::MergeIntoNext, vec![(1, vec![0xC0, 0xC1, 0, 0, 0, 0, 0, 0]), (16_778, vec![1; 6])])]
    #[case::drop(ConfigUnitPolicy::Drop, vec![(1, vec![0; 6]), (16_778, vec![1; 6])])]
    fn test_config_unit_policy(
        #[case] policy: ConfigUnitPolicy,
        #[case] expected: Vec<(u64, Vec<u8>)>,
    ) {
        let broker = StubBroker::new(0).with_config_unit(vec![0xC0, 0xC1]);
        let config = EncodeLoopConfig {
            config_units: policy,
            ..limited(2)
        };

        let (result, buf) = run_loop(broker, config, StopToken::new());
        let summary = result.unwrap();

        assert_eq!(summary.counters.config_units, 1);
        assert_eq!(summary.counters.emitted, 2);
        assert_eq!(records(&buf.bytes()), expected);
    }

    #[test]
    fn test_write_failure_still_releases_unit() {
        let broker = StubBroker::new(0);
        let ledger = broker.ledger();
        let source = CountingSource::new();
        let closed = source.closed.clone();

        let result = EncodeLoop::new(
            Box::new(source),
            Box::new(broker),
            Box::new(FailingWriter),
            limited(5),
            StopToken::new(),
        )
        .run();

        assert!(matches!(result, Err(EncodeError::Container(_))));
        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.acquired_units, ledger.released_units);
        assert_eq!(ledger.acquired_units.len(), 1);
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn test_source_closed_after_clean_run() {
        let source = CountingSource::new();
        let closed = source.closed.clone();
        let (writer, _) = header_written_writer();

        EncodeLoop::new(
            Box::new(source),
            Box::new(StubBroker::new(0)),
            Box::new(writer),
            limited(2),
            StopToken::new(),
        )
        .run()
        .unwrap();

        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn test_wrapping_source_feeds_loop_cyclically() {
        let mut bytes = vec![7u8; 6];
        bytes.extend_from_slice(&[8u8; 6]);
        let source = CyclicFileSource::from_reader(Cursor::new(bytes), 2, 2);
        let (writer, buf) = header_written_writer();

        EncodeLoop::new(
            Box::new(source),
            Box::new(StubBroker::new(0)),
            Box::new(writer),
            limited(5),
            StopToken::new(),
        )
        .run()
        .unwrap();

        let payloads: Vec<u8> = records(&buf.bytes()).iter().map(|(_, p)| p[0]).collect();
        assert_eq!(payloads, vec![7, 8, 7, 8, 7]);
    }

    #[test]
    fn test_little_endian_output_through_loop() {
        let buf = SharedBuf::default();
        let mut writer =
            IvfWriter::new(buf.clone(), *b"VP80").with_byte_order(ByteOrder::LittleEndian);
        writer.write_file_header(2, 2, 1_000_000).unwrap();

        EncodeLoop::new(
            Box::new(CountingSource::new()),
            Box::new(StubBroker::new(0)),
            Box::new(writer),
            limited(1),
            StopToken::new(),
        )
        .run()
        .unwrap();

        let bytes = buf.bytes();
        assert_eq!(&bytes[32..36], &[6, 0, 0, 0]);
        assert_eq!(&bytes[36..44], &1u64.to_le_bytes());
    }

    #[test]
    fn test_drain_without_free_input_still_collects_units() {
        // The fourth acquire, made for end of stream, finds nothing free.
        let broker = StubBroker::new(1).with_input_pattern(vec![true, true, true, false]);
        let ledger = broker.ledger();

        let (result, buf) = run_loop(broker, limited(3), StopToken::new());
        let summary = result.unwrap();

        assert_eq!(summary.final_state, LoopState::Stopped);
        assert_eq!(summary.counters.submitted, 3);
        assert_eq!(summary.counters.emitted, 3);
        assert!(summary.is_balanced());

        let ledger = ledger.lock().unwrap();
        assert!(ledger
            .submitted
            .iter()
            .all(|(_, _, flags)| !flags.contains(BufferFlags::END_OF_STREAM)));
        assert_eq!(ledger.acquired_units, ledger.released_units);
        assert_eq!(ledger.acquired_units.len(), 3);

        let payloads: Vec<u8> = records(&buf.bytes()).iter().map(|(_, p)| p[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2]);
    }

    #[test]
    fn test_unfillable_input_goes_back_to_broker() {
        // 2x4 frames are 12 bytes; the stub hands out 6-byte inputs.
        let source = CyclicFileSource::from_reader(Cursor::new(vec![1u8; 12]), 2, 4);
        let broker = StubBroker::new(0);
        let ledger = broker.ledger();
        let (writer, _) = header_written_writer();

        let result = EncodeLoop::new(
            Box::new(source),
            Box::new(broker),
            Box::new(writer),
            limited(1),
            StopToken::new(),
        )
        .run();

        assert!(matches!(
            result,
            Err(EncodeError::Encoder(EncoderError::InputTooLarge {
                len: 12,
                capacity: 6
            }))
        ));
        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.returned_inputs, 1);
        assert!(ledger.submitted.is_empty());
    }

    #[test]
    fn test_submitted_timestamps_follow_writer_interval() {
        let broker = StubBroker::new(0);
        let ledger = broker.ledger();
        let buf = SharedBuf::default();
        let mut writer = IvfWriter::new(buf.clone(), *b"VP80").with_frame_interval(1000);
        writer.write_file_header(2, 2, 1_000_000).unwrap();

        EncodeLoop::new(
            Box::new(CountingSource::new()),
            Box::new(broker),
            Box::new(writer),
            limited(3),
            StopToken::new(),
        )
        .run()
        .unwrap();

        let submitted: Vec<u64> = ledger
            .lock()
            .unwrap()
            .submitted
            .iter()
            .filter(|(_, _, f)| !f.contains(BufferFlags::END_OF_STREAM))
            .map(|(_, ts, _)| *ts as u64)
            .collect();
        let recorded: Vec<u64> = records(&buf.bytes()).iter().map(|(ts, _)| *ts).collect();
        assert_eq!(submitted, vec![1, 1001, 2001]);
        assert_eq!(recorded, submitted);
    }
}
