pub mod encode_error;
pub mod encode_file_use_case;
pub mod encode_logger;
pub mod encode_loop;
pub mod stop_token;
