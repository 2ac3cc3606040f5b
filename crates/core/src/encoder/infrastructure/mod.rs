pub mod ffmpeg_broker;
