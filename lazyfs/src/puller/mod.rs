use async_trait::async_trait;

use crate::manifest::Index;
use crate::{Digest, Error};

mod cache;
mod local;
mod memory;

pub use self::cache::BlobCache;
pub use self::local::LocalPuller;
pub use self::memory::MemoryPuller;

/// The base trait all pullers need to implement.
/// It provides a way to retrieve the index of an image, and to read (and
/// seek) a blob of an image, by its digest.
///
/// The image is an opaque location, its meaning is up to the implementation.
#[async_trait]
pub trait Puller: Send + Sync {
    /// Retrieve the index of the image.
    async fn pull_index(&self, image: &str) -> Result<Index, Error>;

    /// Request a blob of the image, by its digest.
    /// Implementations don't need to verify the content, that's done by
    /// [BlobCache].
    async fn pull_blob(&self, image: &str, digest: &Digest) -> Result<Box<dyn BlobReader>, Error>;
}

#[async_trait]
impl<A> Puller for A
where
    A: AsRef<dyn Puller> + Send + Sync,
{
    async fn pull_index(&self, image: &str) -> Result<Index, Error> {
        self.as_ref().pull_index(image).await
    }

    async fn pull_blob(&self, image: &str, digest: &Digest) -> Result<Box<dyn BlobReader>, Error> {
        self.as_ref().pull_blob(image, digest).await
    }
}

/// BlobReader is a [tokio::io::AsyncRead] that also allows seeking.
/// Dropping it closes it.
pub trait BlobReader: tokio::io::AsyncRead + tokio::io::AsyncSeek + Send + Unpin + 'static {}

impl BlobReader for std::io::Cursor<&'static [u8]> {}
impl BlobReader for std::io::Cursor<Vec<u8>> {}
impl BlobReader for tokio::fs::File {}
