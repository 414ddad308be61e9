mod digests;
mod errors;

pub mod fixtures;
pub mod hashing_reader;
pub mod image;
pub mod manifest;
pub mod puller;
pub mod tree;

#[cfg(feature = "fuse")]
pub mod fs;

pub use digests::{Algorithm, Digest};
pub use errors::Error;
