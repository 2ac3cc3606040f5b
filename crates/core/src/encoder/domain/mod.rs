pub mod buffer_broker;
pub mod encoder_config;
