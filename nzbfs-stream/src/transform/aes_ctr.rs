//! AES-256-CTR decryption

use aes::Aes256;
use async_trait::async_trait;
use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;

use super::{BoxedByteStream, ByteStream};
use crate::descriptor::AesParams;
use crate::error::{Error, Result};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Decrypts an AES-256-CTR-encrypted inner stream.
///
/// CTR keystreams are position-addressable: seeking to offset `O` sets the
/// counter to `iv + O / 16` and skips `O mod 16` bytes into that block, so
/// a seek never decrypts the prefix. Reads decrypt in place on whatever the
/// inner stream returned; output is byte-identical to decrypting the whole
/// stream from the start.
pub struct AesCtrStream {
    inner: BoxedByteStream,
    cipher: Aes256Ctr,
}

impl AesCtrStream {
    /// Wrap `inner`, decrypting with `params`.
    pub fn new(inner: BoxedByteStream, params: &AesParams) -> Self {
        let cipher = Aes256Ctr::new(&params.key.into(), &params.iv.into());
        Self { inner, cipher }
    }
}

#[async_trait]
impl ByteStream for AesCtrStream {
    async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(dst).await?;
        self.cipher
            .try_apply_keystream(&mut dst[..n])
            .map_err(|_| Error::unavailable("AES-CTR keystream exhausted"))?;
        Ok(n)
    }

    async fn seek(&mut self, position: u64) -> Result<()> {
        self.inner.seek(position).await?;
        self.cipher
            .try_seek(position)
            .map_err(|_| Error::unavailable("AES-CTR seek out of keystream range"))?;
        Ok(())
    }

    fn len(&self) -> Option<u64> {
        self.inner.len()
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::slice::tests::{MemoryStream, read_all};

    fn params() -> AesParams {
        AesParams {
            key: [0x42; 32],
            iv: [0x07; 16],
        }
    }

    fn encrypt(plain: &[u8], params: &AesParams) -> Vec<u8> {
        let mut data = plain.to_vec();
        let mut cipher = Aes256Ctr::new(&params.key.into(), &params.iv.into());
        cipher.apply_keystream(&mut data);
        data
    }

    #[tokio::test]
    async fn test_full_decrypt_round_trip() {
        let plain: Vec<u8> = (0..4096u32).map(|i| (i * 17 + 3) as u8).collect();
        let params = params();
        let ciphertext = encrypt(&plain, &params);

        let mut stream = AesCtrStream::new(Box::new(MemoryStream::new(ciphertext)), &params);
        assert_eq!(read_all(&mut stream).await, plain);
    }

    #[tokio::test]
    async fn test_partial_range_equals_slice_of_full_decrypt() {
        let plain: Vec<u8> = (0..8192u32).map(|i| (i * 31 + 11) as u8).collect();
        let params = params();
        let ciphertext = encrypt(&plain, &params);

        // Offsets straddling block boundaries on both sides.
        for offset in [0u64, 1, 15, 16, 17, 4095, 4096, 4100] {
            let mut stream =
                AesCtrStream::new(Box::new(MemoryStream::new(ciphertext.clone())), &params);
            stream.seek(offset).await.unwrap();
            let mut buf = vec![0u8; 64];
            let mut got = Vec::new();
            while got.len() < 64 {
                let n = stream.read(&mut buf[got.len()..]).await.unwrap();
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[got.len()..got.len() + n]);
            }
            let expected = &plain[offset as usize..offset as usize + got.len()];
            assert_eq!(&got[..], expected, "mismatch at offset {offset}");
        }
    }

    #[tokio::test]
    async fn test_seek_back_and_forth() {
        let plain: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let params = params();
        let ciphertext = encrypt(&plain, &params);

        let mut stream = AesCtrStream::new(Box::new(MemoryStream::new(ciphertext)), &params);
        stream.seek(500).await.unwrap();
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &plain[500..500 + n]);

        stream.seek(3).await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &plain[3..3 + n]);
    }
}
