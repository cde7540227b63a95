//! # Content Cipher
//!
//! Streaming encryption for hosted media. Every content item gets its own
//! random [`ContentKey`] (AES-256 key plus a 7-byte IV). The plaintext is
//! cut into 64 KiB chunks and each chunk is sealed with AES-256-GCM, so
//! files of any size stream through a fixed amount of memory and every
//! chunk carries its own authentication tag.
//!
//! ## Chunk nonces
//!
//! ```text
//! nonce(i) = iv[0..7] || u32_be(i) || last_flag
//! ```
//!
//! The counter pins each chunk to its position, and the last-chunk flag
//! makes truncation at a chunk boundary fail authentication. Empty input
//! still produces one (empty, flagged) chunk, so an empty file and a
//! missing file are distinguishable.
//!
//! ## Content hash
//!
//! The SHA-256 content hash is computed over the *plaintext* as it streams
//! in, before each chunk is sealed. It identifies the content regardless
//! of which key it was encrypted under.
//!
//! ## Wire format
//!
//! `chunk_0 || chunk_1 || ... || chunk_n`, where each chunk is the GCM
//! ciphertext followed by its 16-byte tag. No header: the key and IV live
//! in the sidecar manifest.

use std::fmt;
use std::io;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{AES_KEY_LENGTH, AES_TAG_LENGTH, CIPHER_CHUNK_SIZE, CIPHER_IV_LENGTH};
use crate::crypto::hash::ContentHasher;

/// Size of one sealed chunk on disk (all chunks but the last).
const SEALED_CHUNK_SIZE: usize = CIPHER_CHUNK_SIZE + AES_TAG_LENGTH;

/// Errors from the content cipher.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid content key")]
    InvalidKey,

    #[error("encryption failed")]
    EncryptFailed,

    #[error("chunk {chunk} failed authentication")]
    Tampered { chunk: u32 },

    #[error("ciphertext truncated")]
    Truncated,

    #[error("content exceeds the maximum chunk count")]
    TooLarge,
}

/// Per-item key material.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey {
    key: [u8; AES_KEY_LENGTH],
    iv: [u8; CIPHER_IV_LENGTH],
}

/// What [`encrypt_stream`] learned about the plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionSummary {
    /// Hex SHA-256 of the plaintext.
    pub content_hash: String,
    pub plaintext_len: u64,
    pub ciphertext_len: u64,
}

impl ContentKey {
    /// Fresh random key and IV from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_LENGTH];
        let mut iv = [0u8; CIPHER_IV_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut key);
        rand::rngs::OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    pub fn from_parts(key: [u8; AES_KEY_LENGTH], iv: [u8; CIPHER_IV_LENGTH]) -> Self {
        Self { key, iv }
    }

    /// Hex of `key || iv`, as stored in the sidecar manifest.
    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(AES_KEY_LENGTH + CIPHER_IV_LENGTH);
        bytes.extend_from_slice(&self.key);
        bytes.extend_from_slice(&self.iv);
        hex::encode(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CipherError::InvalidKey)?;
        if bytes.len() != AES_KEY_LENGTH + CIPHER_IV_LENGTH {
            return Err(CipherError::InvalidKey);
        }
        let mut key = [0u8; AES_KEY_LENGTH];
        let mut iv = [0u8; CIPHER_IV_LENGTH];
        key.copy_from_slice(&bytes[..AES_KEY_LENGTH]);
        iv.copy_from_slice(&bytes[AES_KEY_LENGTH..]);
        Ok(Self { key, iv })
    }

    fn cipher(&self) -> Result<Aes256Gcm, CipherError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)
    }

    fn nonce(&self, counter: u32, last: bool) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..CIPHER_IV_LENGTH].copy_from_slice(&self.iv);
        nonce[CIPHER_IV_LENGTH..CIPHER_IV_LENGTH + 4].copy_from_slice(&counter.to_be_bytes());
        nonce[11] = u8::from(last);
        nonce
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(<redacted>)")
    }
}

/// Ciphertext size for a plaintext of `plaintext_len` bytes.
pub fn ciphertext_len(plaintext_len: u64) -> u64 {
    let chunk = CIPHER_CHUNK_SIZE as u64;
    let chunks = if plaintext_len == 0 {
        1
    } else {
        plaintext_len.div_ceil(chunk)
    };
    plaintext_len + chunks * AES_TAG_LENGTH as u64
}

fn seal_chunk(
    cipher: &Aes256Gcm,
    key: &ContentKey,
    counter: u32,
    last: bool,
    chunk: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let nonce = key.nonce(counter, last);
    cipher
        .encrypt(Nonce::from_slice(&nonce), chunk)
        .map_err(|_| CipherError::EncryptFailed)
}

fn open_chunk(
    cipher: &Aes256Gcm,
    key: &ContentKey,
    counter: u32,
    last: bool,
    sealed: &[u8],
) -> Result<Vec<u8>, CipherError> {
    if sealed.len() < AES_TAG_LENGTH {
        return Err(CipherError::Truncated);
    }
    let nonce = key.nonce(counter, last);
    cipher
        .decrypt(Nonce::from_slice(&nonce), sealed)
        .map_err(|_| CipherError::Tampered { chunk: counter })
}

/// Read from `reader` until `buf` holds `target` bytes or EOF.
async fn fill_to<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    target: usize,
) -> io::Result<()> {
    let mut scratch = [0u8; 16 * 1024];
    while buf.len() < target {
        let want = (target - buf.len()).min(scratch.len());
        let n = reader.read(&mut scratch[..want]).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&scratch[..n]);
    }
    Ok(())
}

/// Encrypt everything `reader` yields into `writer`, hashing the plaintext
/// on the way through.
pub async fn encrypt_stream<R, W>(
    key: &ContentKey,
    mut reader: R,
    mut writer: W,
) -> Result<EncryptionSummary, CipherError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cipher = key.cipher()?;
    let mut hasher = ContentHasher::new();
    let mut pending = Vec::with_capacity(CIPHER_CHUNK_SIZE + 1);
    let mut counter: u32 = 0;
    let mut plaintext_len = 0u64;
    let mut ciphertext_len = 0u64;

    loop {
        // One byte of lookahead tells us whether this chunk is the last.
        fill_to(&mut reader, &mut pending, CIPHER_CHUNK_SIZE + 1).await?;
        let last = pending.len() <= CIPHER_CHUNK_SIZE;
        let take = pending.len().min(CIPHER_CHUNK_SIZE);
        let chunk: Vec<u8> = pending.drain(..take).collect();

        hasher.update(&chunk);
        let sealed = seal_chunk(&cipher, key, counter, last, &chunk)?;
        writer.write_all(&sealed).await?;

        plaintext_len += chunk.len() as u64;
        ciphertext_len += sealed.len() as u64;

        if last {
            break;
        }
        counter = counter.checked_add(1).ok_or(CipherError::TooLarge)?;
    }

    writer.flush().await?;

    Ok(EncryptionSummary {
        content_hash: hasher.finalize_hex(),
        plaintext_len,
        ciphertext_len,
    })
}

/// Decrypt a stream produced by [`encrypt_stream`]. Returns the number of
/// plaintext bytes written.
///
/// Chunks are authenticated one at a time; on failure the bytes of earlier,
/// already-verified chunks have been written.
pub async fn decrypt_stream<R, W>(
    key: &ContentKey,
    mut reader: R,
    mut writer: W,
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cipher = key.cipher()?;
    let mut pending = Vec::with_capacity(SEALED_CHUNK_SIZE + 1);
    let mut counter: u32 = 0;
    let mut written = 0u64;

    loop {
        fill_to(&mut reader, &mut pending, SEALED_CHUNK_SIZE + 1).await?;
        let last = pending.len() <= SEALED_CHUNK_SIZE;
        let take = pending.len().min(SEALED_CHUNK_SIZE);
        let sealed: Vec<u8> = pending.drain(..take).collect();

        let plain = open_chunk(&cipher, key, counter, last, &sealed)?;
        writer.write_all(&plain).await?;
        written += plain.len() as u64;

        if last {
            break;
        }
        counter = counter.checked_add(1).ok_or(CipherError::TooLarge)?;
    }

    writer.flush().await?;
    Ok(written)
}

/// In-memory encryption. Returns the ciphertext and the plaintext hash.
pub fn encrypt(key: &ContentKey, plaintext: &[u8]) -> Result<(Vec<u8>, String), CipherError> {
    let cipher = key.cipher()?;
    let mut hasher = ContentHasher::new();
    let mut out = Vec::with_capacity(ciphertext_len(plaintext.len() as u64) as usize);

    let chunks: Vec<&[u8]> = if plaintext.is_empty() {
        vec![&[][..]]
    } else {
        plaintext.chunks(CIPHER_CHUNK_SIZE).collect()
    };
    let total = chunks.len();

    for (i, chunk) in chunks.into_iter().enumerate() {
        let counter = u32::try_from(i).map_err(|_| CipherError::TooLarge)?;
        hasher.update(chunk);
        out.extend(seal_chunk(&cipher, key, counter, i + 1 == total, chunk)?);
    }

    Ok((out, hasher.finalize_hex()))
}

/// In-memory decryption of [`encrypt`] output.
pub fn decrypt(key: &ContentKey, data: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = key.cipher()?;
    if data.len() < AES_TAG_LENGTH {
        return Err(CipherError::Truncated);
    }

    let chunks: Vec<&[u8]> = data.chunks(SEALED_CHUNK_SIZE).collect();
    let total = chunks.len();
    let mut out = Vec::with_capacity(data.len());

    for (i, sealed) in chunks.into_iter().enumerate() {
        let counter = u32::try_from(i).map_err(|_| CipherError::TooLarge)?;
        out.extend(open_chunk(&cipher, key, counter, i + 1 == total, sealed)?);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha256_hex;

    fn test_key() -> ContentKey {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        ContentKey::from_parts(key, [9u8; CIPHER_IV_LENGTH])
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn roundtrip_across_chunk_boundaries() {
        let key = test_key();
        for len in [
            0,
            1,
            CIPHER_CHUNK_SIZE - 1,
            CIPHER_CHUNK_SIZE,
            CIPHER_CHUNK_SIZE + 1,
            3 * CIPHER_CHUNK_SIZE + 17,
        ] {
            let plaintext = payload(len);
            let (sealed, hash) = encrypt(&key, &plaintext).unwrap();
            assert_eq!(sealed.len() as u64, ciphertext_len(len as u64), "len={len}");
            assert_eq!(hash, sha256_hex(&plaintext));
            assert_eq!(decrypt(&key, &sealed).unwrap(), plaintext, "len={len}");
        }
    }

    #[test]
    fn empty_plaintext_is_a_single_tag() {
        let (sealed, hash) = encrypt(&test_key(), b"").unwrap();
        assert_eq!(sealed.len(), AES_TAG_LENGTH);
        assert_eq!(hash, sha256_hex(b""));
    }

    #[test]
    fn flipped_bit_is_detected() {
        let key = test_key();
        let (mut sealed, _) = encrypt(&key, &payload(1000)).unwrap();
        sealed[10] ^= 0x01;
        assert!(matches!(
            decrypt(&key, &sealed),
            Err(CipherError::Tampered { chunk: 0 })
        ));
    }

    #[test]
    fn truncation_at_chunk_boundary_is_detected() {
        let key = test_key();
        let (sealed, _) = encrypt(&key, &payload(2 * CIPHER_CHUNK_SIZE + 5)).unwrap();
        // Drop the final chunk entirely; the new last chunk was not sealed as last.
        let truncated = &sealed[..2 * SEALED_CHUNK_SIZE];
        assert!(decrypt(&key, truncated).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let (sealed, _) = encrypt(&test_key(), b"secret film").unwrap();
        assert!(decrypt(&ContentKey::generate(), &sealed).is_err());
    }

    #[test]
    fn key_hex_roundtrip() {
        let key = ContentKey::generate();
        assert_eq!(ContentKey::from_hex(&key.to_hex()).unwrap(), key);
        assert!(ContentKey::from_hex("abcd").is_err());
        assert_eq!(format!("{:?}", key), "ContentKey(<redacted>)");
    }

    #[tokio::test]
    async fn stream_roundtrip_matches_in_memory_format() {
        let key = test_key();
        let plaintext = payload(2 * CIPHER_CHUNK_SIZE + 123);

        let mut sealed = Vec::new();
        let summary = encrypt_stream(&key, plaintext.as_slice(), &mut sealed)
            .await
            .unwrap();
        assert_eq!(summary.plaintext_len, plaintext.len() as u64);
        assert_eq!(summary.ciphertext_len, sealed.len() as u64);
        assert_eq!(summary.content_hash, sha256_hex(&plaintext));

        // Streaming and in-memory encryption agree byte for byte.
        let (expected, _) = encrypt(&key, &plaintext).unwrap();
        assert_eq!(sealed, expected);

        let mut recovered = Vec::new();
        let n = decrypt_stream(&key, sealed.as_slice(), &mut recovered)
            .await
            .unwrap();
        assert_eq!(n, plaintext.len() as u64);
        assert_eq!(recovered, plaintext);
    }

    #[tokio::test]
    async fn stream_empty_input() {
        let key = test_key();
        let mut sealed = Vec::new();
        let summary = encrypt_stream(&key, &b""[..], &mut sealed).await.unwrap();
        assert_eq!(summary.plaintext_len, 0);

        let mut recovered = Vec::new();
        decrypt_stream(&key, sealed.as_slice(), &mut recovered)
            .await
            .unwrap();
        assert!(recovered.is_empty());
    }

    #[tokio::test]
    async fn stream_rejects_missing_ciphertext() {
        let mut out = Vec::new();
        let result = decrypt_stream(&test_key(), &b""[..], &mut out).await;
        assert!(matches!(result, Err(CipherError::Truncated)));
    }
}
