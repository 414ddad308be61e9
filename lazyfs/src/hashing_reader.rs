use pin_project_lite::pin_project;
use tokio::io::AsyncRead;

pin_project! {
    /// Wraps an existing AsyncRead, and allows querying for the digest of all
    /// data read "through" it, as well as the number of bytes.
    /// The hash function is configurable by type parameter.
    pub struct HashingReader<R, H>
    where
        R: AsyncRead,
        H: digest::Digest,
    {
        #[pin]
        inner: R,
        hasher: H,
        bytes_read: u64,
    }
}

impl<R, H> HashingReader<R, H>
where
    R: AsyncRead,
    H: digest::Digest,
{
    pub fn from(r: R) -> Self {
        Self {
            inner: r,
            hasher: H::new(),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Return the digest.
    pub fn digest(self) -> digest::Output<H> {
        self.hasher.finalize()
    }
}

impl<R, H> tokio::io::AsyncRead for HashingReader<R, H>
where
    R: AsyncRead,
    H: digest::Digest,
{
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let buf_filled_len_before = buf.filled().len();

        let this = self.project();
        let ret = this.inner.poll_read(cx, buf);

        // write everything new filled into the hasher.
        let new = &buf.filled()[buf_filled_len_before..];
        this.hasher.update(new);
        *this.bytes_read += new.len() as u64;

        ret
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rstest::rstest;
    use sha2::{Sha256, Sha512};

    use super::HashingReader;
    use crate::digests::Algorithm;
    use crate::fixtures::{BLOB_A, BLOB_B};
    use crate::Digest;

    #[rstest]
    #[case::blob_a(&BLOB_A)]
    #[case::blob_b(&BLOB_B)]
    #[case::empty_blob(&[])]
    #[tokio::test]
    async fn test_sha256_hashing_reader(#[case] data: &[u8]) {
        let mut hr = HashingReader::<_, Sha256>::from(Cursor::new(data));

        tokio::io::copy(&mut hr, &mut tokio::io::sink())
            .await
            .expect("read must succeed");

        assert_eq!(data.len() as u64, hr.bytes_read());
        assert_eq!(
            Digest::sha256(data),
            Digest::from_raw(Algorithm::Sha256, &hr.digest())
        );
    }

    #[tokio::test]
    async fn test_sha512_hashing_reader() {
        let mut hr = HashingReader::<_, Sha512>::from(Cursor::new(&BLOB_B[..]));

        tokio::io::copy(&mut hr, &mut tokio::io::sink())
            .await
            .expect("read must succeed");

        assert_eq!(
            Digest::sha512(&BLOB_B),
            Digest::from_raw(Algorithm::Sha512, &hr.digest())
        );
    }
}
