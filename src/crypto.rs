//! Pre-shared key tunnel cipher.
//!
//! Every chunk is sealed with ChaCha20-Poly1305 under a fresh random nonce, and the nonce is
//! prepended to the sealed output. There is no length prefix: one read is one chunk, matching
//! the relay's one request per connection model.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
/// Bytes a sealed chunk carries on top of its plaintext.
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key length {0}, expected 32 bytes")]
    InvalidKeyLength(usize),
    #[error("encryption failed")]
    Encryption,
    #[error("ciphertext too short")]
    TooShort,
    #[error("authentication failed")]
    Authentication,
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection closed before a chunk was read")]
    Closed,
}

/// Symmetric tunnel cipher
///
/// Built once from a static key. Stateless per call apart from the key material.
#[derive(Clone)]
pub struct Cipher {
    aead: ChaCha20Poly1305,
    buffer_size: usize,
}

impl Cipher {
    /// `key` must be exactly [`KEY_SIZE`] bytes. `buffer_size` bounds plaintext chunks read
    /// by the stream helpers.
    pub fn new(key: &[u8], buffer_size: usize) -> Result<Self, CryptoError> {
        let aead = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;

        Ok(Self { aead, buffer_size })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|_| CryptoError::Encryption)?;

        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(CryptoError::TooShort);
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        self.aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Authentication)
    }

    /// Read one plaintext chunk from `src`, write it sealed to `dst`.
    ///
    /// Exactly one chunk, not a copy loop. Returns the number of bytes written.
    pub async fn encrypt_stream<W, R>(&self, dst: &mut W, src: &mut R) -> Result<usize, TunnelError>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let chunk = read_chunk(src, self.buffer_size).await?;
        let sealed = self.encrypt(&chunk)?;

        dst.write_all(&sealed).await?;
        dst.flush().await?;
        Ok(sealed.len())
    }

    /// Read one sealed chunk from `src`, write its plaintext to `dst`.
    pub async fn decrypt_stream<W, R>(&self, dst: &mut W, src: &mut R) -> Result<usize, TunnelError>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let chunk = read_chunk(src, self.buffer_size + OVERHEAD).await?;
        let plain = self.decrypt(&chunk)?;

        dst.write_all(&plain).await?;
        dst.flush().await?;
        Ok(plain.len())
    }

    /// Tunnel one request/response pair: seal a chunk from `src` into `dst`, then open the
    /// reply from `dst` back into `src`.
    pub async fn encrypt_round_trip<D, S>(&self, dst: &mut D, src: &mut S) -> Result<(), TunnelError>
    where
        D: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.encrypt_stream(dst, src).await?;
        self.decrypt_stream(src, dst).await?;
        Ok(())
    }

    /// Serving side of [`Cipher::encrypt_round_trip`]: open a chunk from `src` into `dst`,
    /// then seal the reply from `dst` back into `src`.
    pub async fn decrypt_round_trip<D, S>(&self, dst: &mut D, src: &mut S) -> Result<(), TunnelError>
    where
        D: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.decrypt_stream(dst, src).await?;
        self.encrypt_stream(src, dst).await?;
        Ok(())
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(src: &mut R, limit: usize) -> Result<Vec<u8>, TunnelError> {
    let mut buf = vec![0; limit];
    let n = src.read(&mut buf).await?;
    if n == 0 {
        return Err(TunnelError::Closed);
    }

    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const KEY: &[u8; 32] = b"passphrasewhichneedstobe32bytes!";

    fn cipher() -> Cipher {
        Cipher::new(KEY, 1024).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let c = cipher();
        for payload in [&b""[..], &b"x"[..], &b"hello tunnel"[..], &[0xffu8; 1024][..]] {
            let sealed = c.encrypt(payload).unwrap();
            assert_eq!(sealed.len(), payload.len() + OVERHEAD);
            assert_eq!(c.decrypt(&sealed).unwrap(), payload);
        }
    }

    #[test]
    fn test_any_flipped_bit_fails_authentication() {
        let c = cipher();
        let sealed = c.encrypt(b"hello").unwrap();

        for i in 0..sealed.len() * 8 {
            let mut tampered = sealed.clone();
            tampered[i / 8] ^= 1 << (i % 8);
            assert!(matches!(
                c.decrypt(&tampered),
                Err(CryptoError::Authentication)
            ));
        }
    }

    #[test]
    fn test_fresh_nonce_per_encrypt() {
        let c = cipher();
        let a = c.encrypt(b"same").unwrap();
        let b = c.encrypt(b"same").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn test_too_short() {
        let c = cipher();
        assert!(matches!(c.decrypt(&[0; 11]), Err(CryptoError::TooShort)));
        assert!(matches!(c.decrypt(&[]), Err(CryptoError::TooShort)));
        // a bare nonce has no tag to verify
        assert!(matches!(
            c.decrypt(&[0; NONCE_SIZE]),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_bad_key_length() {
        assert!(matches!(
            Cipher::new(b"short", 1024),
            Err(CryptoError::InvalidKeyLength(5))
        ));
    }

    #[test]
    fn test_wrong_key() {
        let sealed = cipher().encrypt(b"secret").unwrap();
        let other = Cipher::new(&[7u8; 32], 1024).unwrap();
        assert!(matches!(
            other.decrypt(&sealed),
            Err(CryptoError::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_stream_reads_one_bounded_chunk() {
        let c = Cipher::new(KEY, 4).unwrap();
        let (mut app, mut app_remote) = duplex(64);
        let (mut wire, mut wire_remote) = duplex(64);

        app_remote.write_all(b"abcdefgh").await.unwrap();
        let n = c.encrypt_stream(&mut wire, &mut app).await.unwrap();
        assert_eq!(n, 4 + OVERHEAD);

        let mut buf = [0u8; 64];
        let n = wire_remote.read(&mut buf).await.unwrap();
        assert_eq!(c.decrypt(&buf[..n]).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_stream_eof_is_not_an_empty_message() {
        let c = cipher();
        let (mut src, src_remote) = duplex(64);
        let (mut dst, _dst_remote) = duplex(64);
        drop(src_remote);

        assert!(matches!(
            c.decrypt_stream(&mut dst, &mut src).await,
            Err(TunnelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_round_trip_over_streams() {
        let client_side = cipher();
        let server_side = cipher();

        let (mut app, mut app_remote) = duplex(4096);
        let (mut relay, mut relay_remote) = duplex(4096);
        let (mut service, mut service_remote) = duplex(4096);

        let served = tokio::spawn(async move {
            server_side
                .decrypt_round_trip(&mut service, &mut relay_remote)
                .await
        });

        let svc = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = service_remote.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            service_remote.write_all(b"pong").await.unwrap();
        });

        app_remote.write_all(b"ping").await.unwrap();
        client_side
            .encrypt_round_trip(&mut relay, &mut app)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = app_remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        served.await.unwrap().unwrap();
        svc.await.unwrap();
    }
}
