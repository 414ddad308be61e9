use std::path::Path;

use async_trait::async_trait;
use tracing::instrument;

use super::{BlobReader, Puller};
use crate::manifest::Index;
use crate::{image, Digest, Error};

/// Reads images from the local filesystem, the image being the path to an
/// OCI image layout.
///
/// This does no caching, wrap it in a [super::BlobCache].
#[derive(Clone, Default)]
pub struct LocalPuller {}

impl LocalPuller {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Puller for LocalPuller {
    #[instrument(skip(self), err)]
    async fn pull_index(&self, image: &str) -> Result<Index, Error> {
        image::read_index(Path::new(image)).await
    }

    #[instrument(skip(self, digest), fields(blob.digest=%digest), err)]
    async fn pull_blob(&self, image: &str, digest: &Digest) -> Result<Box<dyn BlobReader>, Error> {
        let file = image::open_blob(Path::new(image), digest).await?;
        Ok(Box::new(file))
    }
}
