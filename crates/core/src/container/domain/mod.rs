pub mod container_writer;
pub mod ivf_header;
