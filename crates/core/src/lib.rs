pub mod container;
pub mod encoder;
pub mod pipeline;
pub mod shared;
pub mod source;
