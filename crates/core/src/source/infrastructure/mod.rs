pub mod cyclic_file_source;
