//! Request extractors that reject with the shared error body

pub mod uuid_path;

pub use uuid_path::UuidPath;
