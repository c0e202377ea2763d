//! AEAD cipher suite for the shadowsocks wire protocol: password KDF,
//! per-connection sub-key derivation, counter-nonce stream AEAD, and the
//! single-shot datagram construction.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, Aes128Gcm, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest as Md5Digest, Md5};
use rand::RngCore;
use sha1::Sha1;

use crate::common::{Error, Result};

/// Maximum plaintext bytes per stream chunk. The high two bits of the length
/// field must stay zero on the wire.
pub const MAX_PAYLOAD: usize = 0x3FFF;

pub const AEAD_AES_128_GCM: &str = "AEAD_AES_128_GCM";
pub const AEAD_AES_256_GCM: &str = "AEAD_AES_256_GCM";
pub const AEAD_CHACHA20_POLY1305: &str = "AEAD_CHACHA20_POLY1305";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    /// Accepts the logical method names and the canonical AEAD names,
    /// case-insensitively.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "AES-128-GCM" | AEAD_AES_128_GCM => Ok(CipherKind::Aes128Gcm),
            "AES-256-GCM" | AEAD_AES_256_GCM => Ok(CipherKind::Aes256Gcm),
            "CHACHA20-IETF-POLY1305" | AEAD_CHACHA20_POLY1305 => Ok(CipherKind::ChaCha20Poly1305),
            _ => Err(Error::CipherUnsupported(s.to_string())),
        }
    }

    pub fn canonical_name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => AEAD_AES_128_GCM,
            CipherKind::Aes256Gcm => AEAD_AES_256_GCM,
            CipherKind::ChaCha20Poly1305 => AEAD_CHACHA20_POLY1305,
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// Salt length equals key length for all three ciphers.
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    pub fn tag_len(&self) -> usize {
        16
    }

    pub fn nonce_len(&self) -> usize {
        12
    }
}

/// Canonical AEAD names, sorted alphabetically.
pub fn list_ciphers() -> Vec<&'static str> {
    let mut names = vec![AEAD_AES_128_GCM, AEAD_AES_256_GCM, AEAD_CHACHA20_POLY1305];
    names.sort_unstable();
    names
}

/// Derive a long-term key from a password, OpenSSL EVP_BytesToKey style:
/// D_1 = MD5(password), D_i = MD5(D_{i-1} || password), concatenated until
/// `key_len` bytes are available.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Option<Vec<u8>> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(ref digest) = prev {
            hasher.update(digest);
        }
        hasher.update(password);
        let digest = hasher.finalize().to_vec();
        key.extend_from_slice(&digest);
        prev = Some(digest);
    }

    key.truncate(key_len);
    key
}

/// The long-term key: taken verbatim when supplied, derived from the
/// password otherwise.
pub fn master_key(kind: CipherKind, key: Option<&[u8]>, password: &str) -> Result<Vec<u8>> {
    match key {
        Some(k) if !k.is_empty() => {
            if k.len() != kind.key_len() {
                return Err(Error::KeySizeMismatch {
                    expected: kind.key_len(),
                    got: k.len(),
                });
            }
            Ok(k.to_vec())
        }
        _ => Ok(evp_bytes_to_key(password.as_bytes(), kind.key_len())),
    }
}

/// Per-connection sub-key: HKDF-SHA1 over the salt with info "ss-subkey".
pub fn derive_subkey(key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(b"ss-subkey", &mut subkey)
        .map_err(|_| Error::Params("HKDF expand failed".into()))?;
    Ok(subkey)
}

pub fn random_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

fn seal_in_place(kind: CipherKind, key: &[u8], nonce: &[u8; 12], buf: &mut Vec<u8>) -> Result<()> {
    let nonce = GenericArray::from_slice(nonce);
    let tag = match kind {
        CipherKind::Aes128Gcm => Aes128Gcm::new(GenericArray::from_slice(key))
            .encrypt_in_place_detached(nonce, b"", buf)
            .map_err(|_| Error::AeadOpenFailed)?,
        CipherKind::Aes256Gcm => Aes256Gcm::new(GenericArray::from_slice(key))
            .encrypt_in_place_detached(nonce, b"", buf)
            .map_err(|_| Error::AeadOpenFailed)?,
        CipherKind::ChaCha20Poly1305 => ChaCha20Poly1305::new(GenericArray::from_slice(key))
            .encrypt_in_place_detached(nonce, b"", buf)
            .map_err(|_| Error::AeadOpenFailed)?,
    };
    buf.extend_from_slice(&tag);
    Ok(())
}

fn open_detached(
    kind: CipherKind,
    key: &[u8],
    nonce: &[u8; 12],
    ciphertext_with_tag: &[u8],
) -> Result<Vec<u8>> {
    let tag_len = kind.tag_len();
    if ciphertext_with_tag.len() < tag_len {
        return Err(Error::AeadOpenFailed);
    }
    let ct_len = ciphertext_with_tag.len() - tag_len;
    let mut buf = ciphertext_with_tag[..ct_len].to_vec();
    let tag = GenericArray::from_slice(&ciphertext_with_tag[ct_len..]);
    let nonce = GenericArray::from_slice(nonce);

    let opened = match kind {
        CipherKind::Aes128Gcm => Aes128Gcm::new(GenericArray::from_slice(key))
            .decrypt_in_place_detached(nonce, b"", &mut buf, tag),
        CipherKind::Aes256Gcm => Aes256Gcm::new(GenericArray::from_slice(key))
            .decrypt_in_place_detached(nonce, b"", &mut buf, tag),
        CipherKind::ChaCha20Poly1305 => ChaCha20Poly1305::new(GenericArray::from_slice(key))
            .decrypt_in_place_detached(nonce, b"", &mut buf, tag),
    };
    opened.map_err(|_| Error::AeadOpenFailed)?;
    Ok(buf)
}

/// Stream AEAD with the shadowsocks nonce discipline: a 12-byte little-endian
/// counter starting at zero, incremented after every seal or open.
pub struct AeadCipher {
    kind: CipherKind,
    key: Vec<u8>,
    nonce: u64,
}

impl AeadCipher {
    pub fn new(kind: CipherKind, subkey: Vec<u8>) -> Self {
        Self {
            kind,
            key: subkey,
            nonce: 0,
        }
    }

    fn nonce_bytes_and_increment(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce += 1;
        nonce
    }

    /// Seal one frame, returning ciphertext plus tag.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce_bytes_and_increment();
        let mut buf = plaintext.to_vec();
        seal_in_place(self.kind, &self.key, &nonce, &mut buf)?;
        Ok(buf)
    }

    /// Open one frame (ciphertext plus tag), returning the plaintext.
    pub fn decrypt(&mut self, ciphertext_with_tag: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce_bytes_and_increment();
        open_detached(self.kind, &self.key, &nonce, ciphertext_with_tag)
    }

    #[cfg(test)]
    pub(crate) fn nonce(&self) -> u64 {
        self.nonce
    }
}

/// Seal one UDP datagram: fresh random salt, then a single AEAD pass over
/// `address || payload` with a zero nonce. Salt freshness is what makes the
/// (salt, nonce) pair unique.
pub fn seal_packet(kind: CipherKind, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let salt = random_salt(kind.salt_len());
    let subkey = derive_subkey(key, &salt, kind.key_len())?;
    let mut body = plaintext.to_vec();
    seal_in_place(kind, &subkey, &[0u8; 12], &mut body)?;

    let mut out = Vec::with_capacity(salt.len() + body.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Open one UDP datagram sealed by `seal_packet`.
pub fn open_packet(kind: CipherKind, key: &[u8], datagram: &[u8]) -> Result<Vec<u8>> {
    let salt_len = kind.salt_len();
    if datagram.len() < salt_len + kind.tag_len() {
        return Err(Error::AeadOpenFailed);
    }
    let subkey = derive_subkey(key, &datagram[..salt_len], kind.key_len())?;
    open_detached(kind, &subkey, &[0u8; 12], &datagram[salt_len..])
}
