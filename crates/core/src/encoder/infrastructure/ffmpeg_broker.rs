use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ffmpeg_next::format::Pixel;

use crate::encoder::domain::buffer_broker::{
    BufferFlags, EncodedUnit, EncoderBufferBroker, EncoderError, InputBuffer,
};
use crate::encoder::domain::encoder_config::{
    BitrateMode, CodecKind, EncoderConfig, PixelLayout,
};
use crate::shared::constants::{DEFAULT_INPUT_SLOTS, DEFAULT_OUTPUT_SLOTS};

type Slot = (usize, Vec<u8>);

enum WorkItem {
    Frame {
        slot: usize,
        data: Vec<u8>,
        len: usize,
        timestamp: i64,
        flags: BufferFlags,
    },
    /// Slot handed back unused; goes straight to the free pool.
    Return { slot: usize, data: Vec<u8> },
    RequestSync,
}

/// Drives an ffmpeg-next encoder through fixed pools of input and output
/// buffers. Frames are uploaded from system memory, so any encoder that
/// accepts software frames works, including `h264_nvenc`.
///
/// The encoder lives on its own worker thread. Input slots come back to the
/// pool once the worker has consumed them; output slots only come back when
/// the caller releases the unit, so holding units stalls the encoder.
pub struct FfmpegBufferBroker {
    free_inputs: Receiver<Slot>,
    work_tx: Option<Sender<WorkItem>>,
    ready_rx: Receiver<EncodedUnit>,
    free_outputs_tx: Option<Sender<Slot>>,
    failure_rx: Receiver<String>,
    worker: Option<JoinHandle<()>>,
    frame_len: usize,
    flushed: bool,
    outstanding: usize,
}

impl FfmpegBufferBroker {
    pub fn new(config: &EncoderConfig) -> Result<Self, EncoderError> {
        Self::with_slots(config, DEFAULT_INPUT_SLOTS, DEFAULT_OUTPUT_SLOTS)
    }

    /// Creates and configures the encoder; fails before any buffer is handed out.
    pub fn with_slots(
        config: &EncoderConfig,
        input_slots: usize,
        output_slots: usize,
    ) -> Result<Self, EncoderError> {
        config.validate()?;
        let input_slots = input_slots.max(1);
        let output_slots = output_slots.max(1);

        let (free_inputs_tx, free_inputs) = crossbeam_channel::bounded::<Slot>(input_slots);
        for slot in 0..input_slots {
            // Capacity matches the pool size, so pre-filling cannot block.
            let _ = free_inputs_tx.send((slot, vec![0u8; config.frame_len()]));
        }

        let (free_outputs_tx, free_outputs_rx) = crossbeam_channel::bounded::<Slot>(output_slots);
        for slot in 0..output_slots {
            let _ = free_outputs_tx.send((slot, Vec::new()));
        }

        let (work_tx, work_rx) = crossbeam_channel::unbounded::<WorkItem>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<EncodedUnit>(output_slots);
        let (failure_tx, failure_rx) = crossbeam_channel::bounded::<String>(1);
        let (setup_tx, setup_rx) = crossbeam_channel::bounded::<Result<(), EncoderError>>(1);

        let worker_config = config.clone();
        let worker = std::thread::Builder::new()
            .name("ivfenc-encoder".into())
            .spawn(move || {
                let mut worker = match EncoderWorker::open(&worker_config) {
                    Ok(w) => {
                        let _ = setup_tx.send(Ok(()));
                        w
                    }
                    Err(e) => {
                        let _ = setup_tx.send(Err(e));
                        return;
                    }
                };
                let channels = WorkerChannels {
                    work_rx,
                    recycle_inputs: free_inputs_tx,
                    free_outputs: free_outputs_rx,
                    ready_tx,
                };
                if let Err(e) = run_guarded(|| worker.run(&channels)) {
                    log::error!("Encoder worker stopped: {e}");
                    let _ = failure_tx.send(e);
                }
            })
            .map_err(|e| EncoderError::Create(format!("failed to spawn encoder thread: {e}")))?;

        match setup_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(EncoderError::Create("encoder thread exited during setup".into()));
            }
        }

        log::info!(
            "Encoder ready: {} {}x{} @ {} fps, colour format {}, {} bps (bitrate mode {})",
            config.encoder_name.as_deref().unwrap_or(&config.mime),
            config.width,
            config.height,
            config.frame_rate,
            config.pixel_layout.color_format_tag(),
            config.bitrate,
            config.bitrate_mode.tag(),
        );

        Ok(Self {
            free_inputs,
            work_tx: Some(work_tx),
            ready_rx,
            free_outputs_tx: Some(free_outputs_tx),
            failure_rx,
            worker: Some(worker),
            frame_len: config.frame_len(),
            flushed: false,
            outstanding: 0,
        })
    }

    /// Units acquired and not yet released.
    pub fn outstanding_outputs(&self) -> usize {
        self.outstanding
    }

    fn check_worker(&self) -> Result<(), EncoderError> {
        match self.failure_rx.try_recv() {
            Ok(msg) => Err(EncoderError::Worker(msg)),
            Err(_) => Ok(()),
        }
    }

    fn worker_gone(&self) -> EncoderError {
        match self.failure_rx.try_recv() {
            Ok(msg) => EncoderError::Worker(msg),
            Err(_) => EncoderError::Disconnected,
        }
    }
}

impl EncoderBufferBroker for FfmpegBufferBroker {
    fn acquire_input(&mut self, timeout: Duration) -> Result<Option<InputBuffer>, EncoderError> {
        self.check_worker()?;
        if self.work_tx.is_none() {
            return Err(EncoderError::Disconnected);
        }
        match self.free_inputs.recv_timeout(timeout) {
            Ok((slot, data)) => Ok(Some(InputBuffer::new(slot, data))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.worker_gone()),
        }
    }

    fn submit_input(
        &mut self,
        buffer: InputBuffer,
        byte_count: usize,
        timestamp: i64,
        flags: BufferFlags,
    ) -> Result<(), EncoderError> {
        let rejection = if byte_count > buffer.capacity() {
            Some(EncoderError::InputTooLarge {
                len: byte_count,
                capacity: buffer.capacity(),
            })
        } else if byte_count != 0 && byte_count != self.frame_len {
            Some(EncoderError::PartialFrame {
                len: byte_count,
                frame_len: self.frame_len,
            })
        } else {
            None
        };
        if let Some(e) = rejection {
            self.return_input(buffer)?;
            return Err(e);
        }

        let tx = self.work_tx.as_ref().ok_or(EncoderError::Disconnected)?;
        let (slot, data) = buffer.into_parts();
        tx.send(WorkItem::Frame {
            slot,
            data,
            len: byte_count,
            timestamp,
            flags,
        })
        .map_err(|_| self.worker_gone())?;

        if flags.contains(BufferFlags::END_OF_STREAM) {
            // Nothing may follow end of stream.
            self.work_tx = None;
        }
        Ok(())
    }

    fn acquire_output(&mut self, timeout: Duration) -> Result<Option<EncodedUnit>, EncoderError> {
        if self.flushed {
            return Ok(None);
        }
        match self.ready_rx.recv_timeout(timeout) {
            Ok(unit) => {
                self.outstanding += 1;
                Ok(Some(unit))
            }
            Err(RecvTimeoutError::Timeout) => {
                self.check_worker()?;
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.flushed = true;
                self.check_worker()?;
                Ok(None)
            }
        }
    }

    fn return_input(&mut self, buffer: InputBuffer) -> Result<(), EncoderError> {
        // After end of stream nothing will be acquired again; the slot is dropped.
        if let Some(tx) = &self.work_tx {
            let (slot, data) = buffer.into_parts();
            tx.send(WorkItem::Return { slot, data })
                .map_err(|_| self.worker_gone())?;
        }
        Ok(())
    }

    fn release_output(&mut self, unit: EncodedUnit) -> Result<(), EncoderError> {
        self.outstanding = self.outstanding.saturating_sub(1);
        if let Some(tx) = &self.free_outputs_tx {
            // The worker may already have exited after flushing; the slot is simply dropped then.
            let _ = tx.send(unit.into_parts());
        }
        Ok(())
    }

    fn request_sync_frame(&mut self) -> Result<(), EncoderError> {
        match &self.work_tx {
            Some(tx) => tx
                .send(WorkItem::RequestSync)
                .map_err(|_| self.worker_gone()),
            None => Ok(()),
        }
    }
}

impl Drop for FfmpegBufferBroker {
    fn drop(&mut self) {
        self.work_tx = None;
        self.free_outputs_tx = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("Encoder thread panicked");
            }
        }
    }
}

/// Runs the worker body, turning a panic into an error the broker can report.
fn run_guarded<F>(body: F) -> Result<(), String>
where
    F: FnOnce() -> Result<(), String>,
{
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        Err(format!("encoder thread panicked: {}", panic_message(&*payload)))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown cause"
    }
}

struct WorkerChannels {
    work_rx: Receiver<WorkItem>,
    recycle_inputs: Sender<Slot>,
    free_outputs: Receiver<Slot>,
    ready_tx: Sender<EncodedUnit>,
}

/// State owned by the encoder thread. ffmpeg contexts never leave it.
struct EncoderWorker {
    encoder: ffmpeg_next::encoder::video::Encoder,
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    input_format: Pixel,
    width: u32,
    height: u32,
    force_key: bool,
    next_pts: i64,
    timestamps: HashMap<i64, i64>,
    extradata: Option<Vec<u8>>,
}

fn codec_id(kind: CodecKind) -> ffmpeg_next::codec::Id {
    use ffmpeg_next::codec::Id;
    match kind {
        CodecKind::Vp8 => Id::VP8,
        CodecKind::Vp9 => Id::VP9,
        CodecKind::H264 => Id::H264,
        CodecKind::Hevc => Id::HEVC,
        CodecKind::Av1 => Id::AV1,
        CodecKind::Mpeg4 => Id::MPEG4,
    }
}

fn pixel_format(layout: PixelLayout) -> Pixel {
    match layout {
        PixelLayout::Nv12 => Pixel::NV12,
        PixelLayout::I420 => Pixel::YUV420P,
    }
}

fn configure_err(e: ffmpeg_next::Error) -> EncoderError {
    EncoderError::Configure(e.to_string())
}

impl EncoderWorker {
    fn open(config: &EncoderConfig) -> Result<Self, EncoderError> {
        ffmpeg_next::init().map_err(|e| EncoderError::Create(e.to_string()))?;

        let kind = config.codec()?;
        let codec = match &config.encoder_name {
            Some(name) => ffmpeg_next::encoder::find_by_name(name),
            None => ffmpeg_next::encoder::find(codec_id(kind)),
        }
        .ok_or_else(|| {
            EncoderError::Create(
                config
                    .encoder_name
                    .clone()
                    .unwrap_or_else(|| config.mime.clone()),
            )
        })?;

        let input_format = pixel_format(config.pixel_layout);
        let supported: Vec<Pixel> = codec
            .video()
            .ok()
            .and_then(|v| v.formats().map(|f| f.collect()))
            .unwrap_or_default();
        let encoder_format = if supported.is_empty() || supported.contains(&input_format) {
            input_format
        } else if supported.contains(&Pixel::YUV420P) {
            Pixel::YUV420P
        } else {
            supported[0]
        };

        let mut encoder_ctx = ffmpeg_next::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(configure_err)?;

        encoder_ctx.set_width(config.width);
        encoder_ctx.set_height(config.height);
        encoder_ctx.set_format(encoder_format);
        // Timestamps inside ffmpeg are frame counts; caller timestamps are mapped back on output.
        encoder_ctx.set_time_base(ffmpeg_next::Rational(1, config.frame_rate as i32));
        encoder_ctx.set_frame_rate(Some(ffmpeg_next::Rational(config.frame_rate as i32, 1)));
        encoder_ctx.set_gop(config.gop_frames().min(i32::MAX as u32));

        match config.bitrate_mode {
            BitrateMode::Constant => {
                let rate = config.bitrate as usize;
                encoder_ctx.set_bit_rate(rate);
                encoder_ctx.set_max_bit_rate(rate);
                // Safety: plain field write on a context we exclusively own, before open.
                unsafe {
                    (*encoder_ctx.as_mut_ptr()).rc_buffer_size =
                        config.bitrate.min(i32::MAX as u64) as i32;
                }
            }
            BitrateMode::Variable => encoder_ctx.set_bit_rate(config.bitrate as usize),
            BitrateMode::ConstantQuality => {}
        }

        let encoder = encoder_ctx
            .open_with(ffmpeg_next::Dictionary::new())
            .map_err(configure_err)?;

        let scaler = if encoder_format != input_format {
            log::info!("Converting {input_format:?} input to {encoder_format:?} for the encoder");
            Some(
                ffmpeg_next::software::scaling::Context::get(
                    input_format,
                    config.width,
                    config.height,
                    encoder_format,
                    config.width,
                    config.height,
                    ffmpeg_next::software::scaling::Flags::BILINEAR,
                )
                .map_err(configure_err)?,
            )
        } else {
            None
        };

        // Safety: reads the extradata buffer of an opened context we exclusively own.
        let extradata = unsafe {
            let ctx = encoder.as_ptr();
            let size = (*ctx).extradata_size;
            if (*ctx).extradata.is_null() || size <= 0 {
                None
            } else {
                Some(std::slice::from_raw_parts((*ctx).extradata, size as usize).to_vec())
            }
        };

        Ok(Self {
            encoder,
            scaler,
            input_format,
            width: config.width,
            height: config.height,
            force_key: false,
            next_pts: 0,
            timestamps: HashMap::new(),
            extradata,
        })
    }

    fn run(&mut self, ch: &WorkerChannels) -> Result<(), String> {
        if let Some(config) = self.extradata.take() {
            let len = config.len();
            if !self.emit(ch, &config, len, BufferFlags::CODEC_CONFIG, 0)? {
                return Ok(());
            }
        }

        for item in ch.work_rx.iter() {
            match item {
                WorkItem::RequestSync => self.force_key = true,
                WorkItem::Return { slot, data } => {
                    let _ = ch.recycle_inputs.send((slot, data));
                }
                WorkItem::Frame {
                    slot,
                    data,
                    len,
                    timestamp,
                    flags,
                } => {
                    if len > 0 {
                        let result = self.send_frame(&data[..len], timestamp);
                        let _ = ch.recycle_inputs.send((slot, data));
                        result?;
                    } else {
                        let _ = ch.recycle_inputs.send((slot, data));
                    }

                    if flags.contains(BufferFlags::END_OF_STREAM) {
                        self.encoder.send_eof().map_err(|e| e.to_string())?;
                        let mut remaining = self.receive_packets()?;
                        match remaining.last_mut() {
                            Some(last) => last.1.insert(BufferFlags::END_OF_STREAM),
                            // Nothing was buffered: signal the end with an empty unit.
                            None => remaining.push((Vec::new(), BufferFlags::END_OF_STREAM, 0)),
                        }
                        for (payload, flags, pts) in remaining {
                            if !self.emit(ch, &payload, payload.len(), flags, pts)? {
                                break;
                            }
                        }
                        log::debug!("Encoder flushed");
                        return Ok(());
                    }

                    for (payload, flags, pts) in self.receive_packets()? {
                        if !self.emit(ch, &payload, payload.len(), flags, pts)? {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn send_frame(&mut self, bytes: &[u8], timestamp: i64) -> Result<(), String> {
        let mut frame = ffmpeg_next::util::frame::video::Video::new(
            self.input_format,
            self.width,
            self.height,
        );
        copy_into_frame(&mut frame, bytes, self.input_format, self.width, self.height);

        let mut frame = match self.scaler.as_mut() {
            Some(scaler) => {
                let mut converted = ffmpeg_next::util::frame::video::Video::empty();
                scaler.run(&frame, &mut converted).map_err(|e| e.to_string())?;
                converted
            }
            None => frame,
        };

        let pts = self.next_pts;
        self.next_pts += 1;
        self.timestamps.insert(pts, timestamp);
        frame.set_pts(Some(pts));
        if std::mem::take(&mut self.force_key) {
            frame.set_kind(ffmpeg_next::picture::Type::I);
        }

        self.encoder.send_frame(&frame).map_err(|e| e.to_string())
    }

    fn receive_packets(&mut self) -> Result<Vec<(Vec<u8>, BufferFlags, i64)>, String> {
        let mut out = Vec::new();
        let mut packet = ffmpeg_next::Packet::empty();
        loop {
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    let flags = if packet.is_key() {
                        BufferFlags::KEY_FRAME
                    } else {
                        BufferFlags::NONE
                    };
                    let pts = packet
                        .pts()
                        .and_then(|p| self.timestamps.remove(&p))
                        .unwrap_or(0);
                    out.push((packet.data().map(|d| d.to_vec()).unwrap_or_default(), flags, pts));
                }
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::error::EAGAIN => {
                    break
                }
                Err(ffmpeg_next::Error::Eof) => break,
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(out)
    }

    /// Copies a unit into a free output slot and publishes it.
    /// Returns `false` once the broker side has gone away.
    fn emit(
        &self,
        ch: &WorkerChannels,
        payload: &[u8],
        len: usize,
        flags: BufferFlags,
        pts: i64,
    ) -> Result<bool, String> {
        let Ok((slot, mut data)) = ch.free_outputs.recv() else {
            return Ok(false);
        };
        data.clear();
        data.extend_from_slice(&payload[..len]);
        Ok(ch
            .ready_tx
            .send(EncodedUnit::new(slot, data, len, flags, pts))
            .is_ok())
    }
}

/// Copies a packed 4:2:0 buffer into an ffmpeg frame, respecting line strides.
fn copy_into_frame(
    frame: &mut ffmpeg_next::util::frame::video::Video,
    src: &[u8],
    format: Pixel,
    width: u32,
    height: u32,
) {
    let w = width as usize;
    let h = height as usize;
    let luma = w * h;

    copy_plane(frame, 0, &src[..luma], w, h);
    match format {
        Pixel::NV12 => copy_plane(frame, 1, &src[luma..luma + luma / 2], w, h / 2),
        _ => {
            let chroma = luma / 4;
            copy_plane(frame, 1, &src[luma..luma + chroma], w / 2, h / 2);
            copy_plane(
                frame,
                2,
                &src[luma + chroma..luma + 2 * chroma],
                w / 2,
                h / 2,
            );
        }
    }
}

fn copy_plane(
    frame: &mut ffmpeg_next::util::frame::video::Video,
    plane: usize,
    src: &[u8],
    row_len: usize,
    rows: usize,
) {
    let stride = frame.stride(plane);
    let dst = frame.data_mut(plane);
    for row in 0..rows {
        dst[row * stride..row * stride + row_len]
            .copy_from_slice(&src[row * row_len..(row + 1) * row_len]);
    }
}
