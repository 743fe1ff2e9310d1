//! Cryptographic primitives for the envelope scheme.
//!
//! This module implements the building blocks everything else composes:
//! - Argon2id for password → KEK derivation
//! - AES-256-GCM for content encryption and CEK wrapping
//! - SHA-256 for transfer digests, HMAC-SHA256 for integrity tags
//!
//! All keys are 256 bits (32 bytes). AEAD outputs carry the 16-byte GCM tag
//! appended to the ciphertext, and every digest that crosses the wire is
//! base64 (standard alphabet, padded).

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, XferError};

// =============================================================================
// Constants
// =============================================================================

/// Argon2id memory parameter (128 MiB).
const ARGON2_MEMORY_KIB: u32 = 128 * 1024;

/// Argon2id passes.
const ARGON2_ITERATIONS: u32 = 6;

/// Argon2id lanes.
const ARGON2_PARALLELISM: u32 = 1;

/// Key size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Nonce size in bytes for AES-GCM (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Salt size in bytes for Argon2id (256 bits).
pub const SALT_SIZE: usize = 32;

/// HMAC-SHA256 alias used for integrity tags and request signing.
type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Types
// =============================================================================

/// A 256-bit cryptographic key that is securely zeroed when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Creates a new random key.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Creates a key from existing bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a key from a slice, validating the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(XferError::Internal(format!(
                "key size: expected {}, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Returns a reference to the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for SecretKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A variable-length secret buffer (passwords, session keys) that is
/// securely zeroed when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretVec(Vec<u8>);

impl SecretVec {
    /// Wraps existing bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns a reference to the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for SecretVec {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<String> for SecretVec {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Derives a Key Encryption Key (KEK) from a password using Argon2id.
///
/// Parameters are fixed: 6 passes over 128 MiB with a single lane. This
/// takes seconds on purpose; callers on async threads must move the call
/// to a blocking pool.
pub fn derive_kek(password: &[u8], salt: &[u8]) -> Result<SecretKey> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(KEY_SIZE),
    )
    .map_err(|e| XferError::Internal(format!("invalid Argon2 params: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut kek = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut kek)
        .map_err(|e| XferError::Internal(format!("Argon2 hashing failed: {}", e)))?;

    Ok(SecretKey::from_bytes(kek))
}

/// Generates `n` random bytes from the OS RNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
    bytes
}

/// Generates a fresh random KDF salt.
pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::Rng::fill(&mut rand::thread_rng(), &mut salt);
    salt
}

/// Generates a fresh random AES-GCM nonce.
fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::Rng::fill(&mut rand::thread_rng(), &mut nonce);
    nonce
}

// =============================================================================
// AEAD
// =============================================================================

/// Encrypts data with AES-256-GCM under a fresh random nonce.
///
/// The returned ciphertext has the 16-byte tag appended.
pub fn aead_seal(key: &SecretKey, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE])> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce_bytes = random_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| XferError::Internal(format!("AES-GCM encryption failed: {}", e)))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypts AES-256-GCM data (tag appended).
///
/// An authentication failure surfaces as `Integrity`; key-unwrap call
/// sites remap it to `AuthFailed` where a wrong password is the likely
/// cause.
pub fn aead_open(key: &SecretKey, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(XferError::Integrity("nonce size does not match".into()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(nonce);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| XferError::Integrity("AEAD open failed".into()))
}

// =============================================================================
// Key Wrapping
// =============================================================================

/// Wraps key material under a KEK.
///
/// Returns the wrapped key (WEK) and the nonce used. Wrapping is plain
/// AES-GCM over the key bytes, so a double-wrapped key is simply the WEK
/// sealed again under a second KEK.
pub fn wrap(kek: &SecretKey, key_material: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE])> {
    aead_seal(kek, key_material)
}

/// Unwraps a WEK under a KEK, recovering the key material.
///
/// Authentication failure maps to `AuthFailed`: an unwrap only fails when
/// the KEK (and therefore the password behind it) is wrong, or the record
/// was tampered with.
pub fn unwrap(kek: &SecretKey, wek: &[u8], nonce: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_SIZE {
        return Err(XferError::AuthFailed("nonce size does not match".into()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_bytes()));
    let nonce = Nonce::from_slice(nonce);

    cipher
        .decrypt(nonce, wek)
        .map(Zeroizing::new)
        .map_err(|_| XferError::AuthFailed("failed to unwrap key".into()))
}

/// Unwraps a WEK that must contain exactly one 256-bit key.
pub fn unwrap_key(kek: &SecretKey, wek: &[u8], nonce: &[u8]) -> Result<SecretKey> {
    let material = unwrap(kek, wek, nonce)?;
    SecretKey::from_slice(&material)
        .map_err(|_| XferError::AuthFailed("unwrapped key has wrong size".into()))
}

// =============================================================================
// File Encryption
// =============================================================================

/// Encrypts the file at `src` under `cek` and writes the ciphertext to
/// `dst`. Returns the nonce.
///
/// Whole-file AEAD: the file is read into memory, sealed, written out.
/// Callers on async threads must use a blocking pool.
pub fn seal_file(cek: &SecretKey, src: &Path, dst: &Path) -> Result<[u8; NONCE_SIZE]> {
    let raw = Zeroizing::new(std::fs::read(src)?);
    let (enc, nonce) = aead_seal(cek, &raw)?;
    std::fs::write(dst, enc)?;
    Ok(nonce)
}

/// Decrypts the file at `src` under `cek` and `nonce`, writing the
/// plaintext to `dst`.
pub fn open_file(cek: &SecretKey, nonce: &[u8], src: &Path, dst: &Path) -> Result<()> {
    let enc = std::fs::read(src)?;
    let raw = Zeroizing::new(aead_open(cek, &enc, nonce)?);
    std::fs::write(dst, &*raw)?;
    Ok(())
}

// =============================================================================
// Digests
// =============================================================================

/// SHA-256 of the file at `path`, streamed, base64-encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(encode_base64(&hasher.finalize()))
}

/// SHA-256 of `data`, base64-encoded.
pub fn sha256_bytes(data: &[u8]) -> String {
    encode_base64(&Sha256::digest(data))
}

/// HMAC-SHA256 of the file at `path` under `key`, streamed, base64-encoded.
pub fn hmac_file(path: &Path, key: &[u8]) -> Result<String> {
    let mut file = File::open(path)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| XferError::Internal(format!("HMAC key error: {}", e)))?;

    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        mac.update(&buf[..n]);
    }

    Ok(encode_base64(&mac.finalize().into_bytes()))
}

/// HMAC-SHA256 of `data` under `key`, base64-encoded.
pub fn hmac_bytes(data: &[u8], key: &[u8]) -> Result<String> {
    Ok(encode_base64(&hmac_raw(data, key)?))
}

/// HMAC-SHA256 of `data` under `key`, raw bytes.
pub fn hmac_raw(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| XferError::Internal(format!("HMAC key error: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

// =============================================================================
// Base64 Utilities
// =============================================================================

/// Encodes bytes to a base64 string (standard alphabet, padded).
pub fn encode_base64(data: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(data)
}

/// Decodes a base64 string to bytes.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD
        .decode(encoded)
        .map_err(|e| XferError::Transport(format!("base64 decode failed: {}", e)))
}
