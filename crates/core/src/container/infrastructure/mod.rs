pub mod ivf_reader;
pub mod ivf_writer;
