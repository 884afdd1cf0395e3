// Segment decryption (AES-CBC) and transport stream realignment.

use aes::{Aes128, Aes192, Aes256};
use bytes::Bytes;
use cipher::block_padding::NoPadding;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, InnerIvInit, KeyInit};

use crate::DownloadError;

/// First byte of every MPEG transport stream packet.
pub const TS_SYNC_BYTE: u8 = 0x47;

pub const BLOCK_SIZE: usize = 16;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Key bytes plus the IV every segment of the batch is decrypted with.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub key: Bytes,
    pub iv: [u8; BLOCK_SIZE],
}

impl KeyMaterial {
    /// Resolves the IV: the playlist IV when given, otherwise the leading
    /// bytes of the key, truncated or zero-padded to the block size.
    pub fn new(key: Bytes, explicit_iv: Option<[u8; BLOCK_SIZE]>) -> Result<Self, DownloadError> {
        if key.is_empty() {
            return Err(DownloadError::InvalidKey("key is empty".to_string()));
        }

        let iv = explicit_iv.unwrap_or_else(|| {
            let mut iv = [0u8; BLOCK_SIZE];
            let n = key.len().min(BLOCK_SIZE);
            iv[..n].copy_from_slice(&key[..n]);
            iv
        });

        Ok(Self { key, iv })
    }
}

/// Expanded key schedule, sized by the key length.
#[derive(Clone)]
enum BlockCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl BlockCipher {
    fn new(key: &[u8]) -> Result<Self, DownloadError> {
        let cipher = match key.len() {
            16 => Aes128::new_from_slice(key).map(Self::Aes128),
            24 => Aes192::new_from_slice(key).map(Self::Aes192),
            32 => Aes256::new_from_slice(key).map(Self::Aes256),
            n => {
                return Err(DownloadError::InvalidKey(format!(
                    "unsupported AES key length {n}, expected 16, 24 or 32 bytes"
                )));
            }
        };
        cipher.map_err(|e| DownloadError::InvalidKey(e.to_string()))
    }
}

/// Reusable AES-CBC decryptor bound to one key and IV. AES-128, AES-192 and
/// AES-256 are selected by the key length.
///
/// The key schedule is expanded once; each call works on its own copy of it,
/// so concurrent callers never contend.
#[derive(Clone)]
pub struct SegmentCipher {
    cipher: BlockCipher,
    iv: [u8; BLOCK_SIZE],
}

impl std::fmt::Debug for SegmentCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentCipher").finish_non_exhaustive()
    }
}

impl SegmentCipher {
    pub fn new(material: &KeyMaterial) -> Result<Self, DownloadError> {
        Ok(Self {
            cipher: BlockCipher::new(&material.key)?,
            iv: material.iv,
        })
    }

    /// Decrypts a whole segment and strips its padding with [`pkcs7_unpad`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, DownloadError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(DownloadError::DecryptFailed(format!(
                "ciphertext length {} is not a multiple of the block size",
                data.len()
            )));
        }

        let iv = GenericArray::from(self.iv);
        let mut buffer = data.to_vec();
        let plain = match &self.cipher {
            BlockCipher::Aes128(c) => Aes128CbcDec::inner_iv_init(c.clone(), &iv)
                .decrypt_padded_mut::<NoPadding>(&mut buffer)
                .map(|p| p.len()),
            BlockCipher::Aes192(c) => Aes192CbcDec::inner_iv_init(c.clone(), &iv)
                .decrypt_padded_mut::<NoPadding>(&mut buffer)
                .map(|p| p.len()),
            BlockCipher::Aes256(c) => Aes256CbcDec::inner_iv_init(c.clone(), &iv)
                .decrypt_padded_mut::<NoPadding>(&mut buffer)
                .map(|p| p.len()),
        };
        let plain_len = plain.map_err(|e| DownloadError::DecryptFailed(e.to_string()))?;
        buffer.truncate(plain_len);

        let unpadded_len = pkcs7_unpad(&buffer).len();
        buffer.truncate(unpadded_len);
        Ok(buffer)
    }
}

/// Removes PKCS#7 padding without validating it.
///
/// The last byte is taken as the pad length; if it is larger than the buffer
/// the buffer is returned unchanged.
pub fn pkcs7_unpad(data: &[u8]) -> &[u8] {
    let Some(&last) = data.last() else {
        return data;
    };
    let pad = last as usize;
    if pad > data.len() {
        return data;
    }
    &data[..data.len() - pad]
}

/// Offset of the first sync byte, if any.
#[inline]
pub fn sync_offset(data: &[u8]) -> Option<usize> {
    memchr::memchr(TS_SYNC_BYTE, data)
}

/// Drops any garbage before the first sync byte. Input without a sync byte is
/// returned unchanged.
pub fn realign(data: &[u8]) -> &[u8] {
    match sync_offset(data) {
        Some(offset) => &data[offset..],
        None => data,
    }
}

/// [`realign`] for owned buffers, without copying.
pub fn realign_bytes(data: Bytes) -> Bytes {
    match sync_offset(&data) {
        Some(0) | None => data,
        Some(offset) => data.slice(offset..),
    }
}
