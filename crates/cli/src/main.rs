use std::path::{Path, PathBuf};
use std::process;

use clap::{Args, Parser, Subcommand};

use ivfenc_core::container::domain::ivf_header::ByteOrder;
use ivfenc_core::container::infrastructure::ivf_reader::IvfReader;
use ivfenc_core::container::infrastructure::ivf_writer::IvfWriter;
use ivfenc_core::encoder::domain::encoder_config::{CodecKind, EncoderConfig, PixelLayout};
use ivfenc_core::encoder::infrastructure::ffmpeg_broker::FfmpegBufferBroker;
use ivfenc_core::pipeline::encode_file_use_case::{EncodeFileUseCase, StreamHeader};
use ivfenc_core::pipeline::encode_logger::StdoutEncodeLogger;
use ivfenc_core::pipeline::encode_loop::{ConfigUnitPolicy, EncodeLoopConfig};
use ivfenc_core::pipeline::stop_token::StopToken;
use ivfenc_core::shared::constants::{
    DEFAULT_BITRATE, DEFAULT_FRAME_INTERVAL, DEFAULT_FRAME_RATE, DEFAULT_HEIGHT,
    DEFAULT_KEYFRAME_INTERVAL_SECS, DEFAULT_MIME, DEFAULT_OUTPUT_FILE, DEFAULT_SYNC_INTERVAL,
    DEFAULT_TIMEBASE_NUMERATOR, DEFAULT_WIDTH,
};
use ivfenc_core::source::infrastructure::cyclic_file_source::CyclicFileSource;

/// Drive a video encoder from a raw 4:2:0 file and write IVF output.
#[derive(Parser)]
#[command(name = "ivfenc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encode a raw file, looping over it until interrupted.
    Encode(EncodeArgs),
    /// Print the header and unit table of an IVF file.
    Probe(ProbeArgs),
}

#[derive(Args)]
struct EncodeArgs {
    /// Raw 4:2:0 input file.
    #[arg(long)]
    file: PathBuf,

    /// Frame width in pixels.
    #[arg(long, default_value_t = DEFAULT_WIDTH)]
    width: u32,

    /// Frame height in pixels.
    #[arg(long, default_value_t = DEFAULT_HEIGHT)]
    height: u32,

    /// Target bitrate in bits per second.
    #[arg(long, default_value_t = DEFAULT_BITRATE)]
    bitrate: u64,

    /// Codec mime type.
    #[arg(long, default_value = DEFAULT_MIME)]
    code_type: String,

    /// Output IVF file.
    #[arg(long, default_value = DEFAULT_OUTPUT_FILE)]
    output: PathBuf,

    /// ffmpeg encoder to use instead of the codec default (e.g. h264_nvenc).
    #[arg(long)]
    encoder: Option<String>,

    /// Chroma layout of the input: nv12 or i420.
    #[arg(long, default_value = "nv12")]
    pixel_format: String,

    /// Nominal frames per second.
    #[arg(long, default_value_t = DEFAULT_FRAME_RATE)]
    frame_rate: u32,

    /// Submitted frames between keyframe requests (0 disables).
    #[arg(long, default_value_t = DEFAULT_SYNC_INTERVAL)]
    sync_interval: u64,

    /// Stop after this many frames instead of waiting for Ctrl-C.
    #[arg(long)]
    max_frames: Option<u64>,

    /// Codec config units: record, merge or drop.
    #[arg(long, default_value = "record")]
    config_units: String,

    /// Write header and record fields little-endian, as libvpx tools expect.
    #[arg(long)]
    little_endian: bool,
}

#[derive(Args)]
struct ProbeArgs {
    /// IVF file to inspect.
    input: PathBuf,

    /// Read header and record fields little-endian.
    #[arg(long)]
    little_endian: bool,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Encode(args) => run_encode(&args),
        Command::Probe(args) => run_probe(&args.input, byte_order(args.little_endian)),
    }
}

fn run_encode(args: &EncodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    validate(args)?;

    let codec = CodecKind::from_mime(&args.code_type)?;
    let mut config = EncoderConfig::new(args.code_type.as_str(), args.width, args.height)
        .with_pixel_layout(parse_pixel_layout(&args.pixel_format))
        .with_frame_rate(args.frame_rate)
        .with_keyframe_interval_secs(DEFAULT_KEYFRAME_INTERVAL_SECS)
        .with_bitrate(args.bitrate);
    if let Some(name) = &args.encoder {
        config = config.with_encoder_name(name.as_str());
    }
    config.validate()?;

    let source = CyclicFileSource::open(&args.file, args.width, args.height)?;
    let writer = IvfWriter::create(&args.output, codec.fourcc())?
        .with_byte_order(byte_order(args.little_endian))
        .with_frame_interval(DEFAULT_FRAME_INTERVAL);
    let broker = FfmpegBufferBroker::new(&config)?;

    let stop = StopToken::new();
    install_signal_handler(stop.clone())?;

    let loop_config = EncodeLoopConfig {
        sync_interval: args.sync_interval,
        max_frames: args.max_frames,
        config_units: parse_config_units(&args.config_units),
        ..EncodeLoopConfig::default()
    };
    let header = StreamHeader {
        width: args.width,
        height: args.height,
        timebase_numerator: DEFAULT_TIMEBASE_NUMERATOR,
    };

    let mut use_case = EncodeFileUseCase::new(
        Box::new(source),
        Box::new(broker),
        Box::new(writer),
        header,
        loop_config,
        stop,
    )
    .with_logger(Box::new(StdoutEncodeLogger::new(u64::from(args.frame_rate))));

    log::info!("Press Ctrl-C to stop");
    let summary = use_case.execute()?;
    if !summary.is_balanced() {
        eprintln!(
            "Warning: {} frames submitted but {} units emitted",
            summary.counters.submitted, summary.counters.emitted
        );
    }
    log::info!("Output written to {}", args.output.display());
    Ok(())
}

fn run_probe(input: &Path, order: ByteOrder) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = IvfReader::open(input, order)?;
    let header = reader.header();
    println!(
        "{}: {} {}x{} timebase {}/{} frames(hint) {}",
        input.display(),
        String::from_utf8_lossy(&header.fourcc),
        header.width,
        header.height,
        header.timebase_numerator,
        header.timebase_denominator,
        header.frame_count_hint
    );

    let mut units = 0u64;
    let mut total_bytes = 0u64;
    while let Some((record, _payload)) = reader.next_unit()? {
        println!(
            "  #{units:<6} ts {:>12}  {:>8} bytes",
            record.timestamp, record.payload_len
        );
        units += 1;
        total_bytes += u64::from(record.payload_len);
    }
    println!("{units} units, {total_bytes} payload bytes");
    Ok(())
}

fn install_signal_handler(stop: StopToken) -> Result<(), Box<dyn std::error::Error>> {
    ctrlc::set_handler(move || {
        if stop.is_stop_requested() {
            eprintln!("Interrupted twice, exiting without draining");
            process::exit(130);
        }
        log::info!("Interrupt received, finishing encode");
        stop.request_stop();
    })?;
    Ok(())
}

fn validate(args: &EncodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    if !args.file.exists() {
        return Err(format!("Input file not found: {}", args.file.display()).into());
    }
    if args.frame_rate == 0 {
        return Err("Frame rate must be positive".into());
    }
    if args.pixel_format != "nv12" && args.pixel_format != "i420" {
        return Err(format!(
            "Pixel format must be 'nv12' or 'i420', got '{}'",
            args.pixel_format
        )
        .into());
    }
    let valid_policies = ["record", "merge", "drop"];
    if !valid_policies.contains(&args.config_units.as_str()) {
        return Err(format!(
            "Config units must be one of: record, merge, drop, got '{}'",
            args.config_units
        )
        .into());
    }
    Ok(())
}

fn byte_order(little_endian: bool) -> ByteOrder {
    if little_endian {
        ByteOrder::LittleEndian
    } else {
        ByteOrder::BigEndian
    }
}

fn parse_pixel_layout(format: &str) -> PixelLayout {
    if format == "i420" {
        PixelLayout::I420
    } else {
        PixelLayout::Nv12
    }
}

fn parse_config_units(policy: &str) -> ConfigUnitPolicy {
    match policy {
        "merge" => ConfigUnitPolicy::MergeIntoNext,
        "drop" => ConfigUnitPolicy::Drop,
        _ => ConfigUnitPolicy::Record,
    }
}
