use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::instrument;

use super::{BlobReader, Puller};
use crate::manifest::Index;
use crate::{Digest, Error};

/// Serves a single in-memory image, regardless of the image location asked
/// for. Counts how often each blob was pulled.
#[derive(Clone, Default)]
pub struct MemoryPuller {
    index: Arc<RwLock<Option<Index>>>,
    db: Arc<RwLock<HashMap<Digest, Vec<u8>>>>,
    pulls: Arc<RwLock<HashMap<Digest, usize>>>,
}

impl MemoryPuller {
    pub fn set_index(&self, index: Index) {
        *self.index.write() = Some(index);
    }

    /// Inserts a blob, returning its sha256 digest.
    pub fn insert(&self, data: impl Into<Vec<u8>>) -> Digest {
        let data = data.into();
        let digest = Digest::sha256(&data);
        self.db.write().insert(digest.clone(), data);
        digest
    }

    /// Inserts data under the given digest, without checking it matches.
    pub fn insert_unchecked(&self, digest: Digest, data: impl Into<Vec<u8>>) {
        self.db.write().insert(digest, data.into());
    }

    /// Returns how often the blob was requested.
    pub fn pulls(&self, digest: &Digest) -> usize {
        self.pulls.read().get(digest).copied().unwrap_or_default()
    }
}

#[async_trait]
impl Puller for MemoryPuller {
    async fn pull_index(&self, _image: &str) -> Result<Index, Error> {
        self.index.read().clone().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no index set",
            ))
        })
    }

    #[instrument(skip(self, _image, digest), fields(blob.digest=%digest), err)]
    async fn pull_blob(&self, _image: &str, digest: &Digest) -> Result<Box<dyn BlobReader>, Error> {
        *self.pulls.write().entry(digest.clone()).or_default() += 1;

        match self.db.read().get(digest) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("blob {} not found", digest),
            ))),
        }
    }
}
