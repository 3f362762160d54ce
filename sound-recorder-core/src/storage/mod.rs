pub mod container;
pub mod disk_writer;
pub mod encoder;
pub mod file_writer;
pub mod metadata;
