//! Envelope key hierarchy.
//!
//! Two levels of keys protect every file:
//! - the bucket CEK, unwrapped at login from the bucket cipher descriptor
//!   and held only in session memory;
//! - a per-file CEK, wrapped under a bucket KEK (derived on demand from
//!   the bucket CEK material and a fresh salt) and optionally wrapped a
//!   second time under a file-password KEK.
//!
//! Every function here that derives a KEK runs Argon2id and takes
//! seconds; async callers move these onto the blocking pool.

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::cipher::{self, SecretKey, NONCE_SIZE, SALT_SIZE};
use crate::error::{Result, XferError};
use crate::session::Session;
use crate::types::{BucketCipher, FileCipherData};

// =============================================================================
// Bucket cipher descriptor
// =============================================================================

/// Builds a fresh bucket cipher descriptor at registration time.
///
/// Generates the bucket CEK, derives a KEK from the password under a fresh
/// salt, wraps the CEK and serializes the descriptor for the server. The
/// CEK itself is dropped; login recovers it by unwrapping.
pub fn create_bucket_cipher(password: &[u8]) -> Result<Vec<u8>> {
    let bucket_cek = SecretKey::random();

    let kek_salt = cipher::random_salt();
    let kek = cipher::derive_kek(password, &kek_salt)?;
    let (wek, wek_nonce) = cipher::wrap(&kek, bucket_cek.as_ref())?;

    let descriptor = BucketCipher {
        kek_salt: cipher::encode_base64(&kek_salt),
        wek: cipher::encode_base64(&wek),
        wek_nonce: cipher::encode_base64(&wek_nonce),
    };

    serde_json::to_vec(&descriptor).map_err(|e| XferError::Internal(e.to_string()))
}

/// Recovers the bucket CEK from a descriptor using the password.
///
/// A wrong password shows up as an AEAD failure on the unwrap and maps to
/// `AuthFailed`.
pub fn open_bucket_cipher(descriptor: &[u8], password: &[u8]) -> Result<SecretKey> {
    let descriptor: BucketCipher = serde_json::from_slice(descriptor)
        .map_err(|e| XferError::AuthFailed(format!("bad bucket descriptor: {}", e)))?;

    let kek_salt = cipher::decode_base64(&descriptor.kek_salt)?;
    let wek = cipher::decode_base64(&descriptor.wek)?;
    let wek_nonce = cipher::decode_base64(&descriptor.wek_nonce)?;

    let kek = cipher::derive_kek(password, &kek_salt)?;
    cipher::unwrap_key(&kek, &wek, &wek_nonce)
}

// =============================================================================
// Bucket-bound derivations
// =============================================================================

/// Key operations bound to the live session's bucket CEK.
///
/// Cheap to clone; holds only the session handle. The CEK is fetched
/// under the session's read lock per operation so a logout mid-pipeline
/// fails cleanly instead of using stale key material.
#[derive(Clone)]
pub struct EnvelopeKeys {
    session: Arc<Session>,
}

impl EnvelopeKeys {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Derives a fresh bucket KEK under a new random salt.
    pub fn bucket_kek_fresh(&self) -> Result<(SecretKey, [u8; SALT_SIZE])> {
        let cek = self.session.bucket_cek()?;
        let salt = cipher::random_salt();
        let kek = cipher::derive_kek(cek.as_ref(), &salt)?;
        Ok((kek, salt))
    }

    /// Re-derives the bucket KEK for a recorded salt.
    pub fn bucket_kek_for_salt(&self, salt: &[u8]) -> Result<SecretKey> {
        let cek = self.session.bucket_cek()?;
        cipher::derive_kek(cek.as_ref(), salt)
    }

    /// Seals `data` under the bucket CEK.
    pub fn seal_with_bucket(&self, data: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE])> {
        let cek = self.session.bucket_cek()?;
        cipher::aead_seal(&cek, data)
    }

    /// Opens bucket-CEK-sealed data.
    pub fn open_with_bucket(&self, enc: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        let cek = self.session.bucket_cek()?;
        cipher::aead_open(&cek, enc, nonce)
    }
}

/// Derives a file-password KEK under a fresh random salt.
pub fn file_kek_fresh(file_password: &[u8]) -> Result<(SecretKey, [u8; SALT_SIZE])> {
    let salt = cipher::random_salt();
    let kek = cipher::derive_kek(file_password, &salt)?;
    Ok((kek, salt))
}

/// Re-derives a file-password KEK for a recorded salt.
pub fn file_kek_for_salt(file_password: &[u8], salt: &[u8]) -> Result<SecretKey> {
    cipher::derive_kek(file_password, salt)
}

// =============================================================================
// Per-file key wrapping
// =============================================================================

/// Output of wrapping a file CEK.
pub struct FileKeyWrap {
    /// The stored wrapped key, possibly double-wrapped.
    pub wrapped_key: Vec<u8>,
    /// Nonce of the bucket-KEK wrap.
    pub b_wrap_nonce: [u8; NONCE_SIZE],
    /// Salt of the file-password KEK, when a file password was supplied.
    pub p_kek_salt: Option<[u8; SALT_SIZE]>,
    /// Nonce of the file-password wrap, when a file password was supplied.
    pub p_wrap_nonce: Option<[u8; NONCE_SIZE]>,
}

impl FileKeyWrap {
    pub fn has_file_password(&self) -> bool {
        self.p_kek_salt.is_some()
    }
}

/// Wraps a file CEK under the bucket KEK, then optionally under a KEK
/// derived from the file password.
pub fn wrap_file_key(
    bucket_kek: &SecretKey,
    file_password: Option<&[u8]>,
    file_cek: &SecretKey,
) -> Result<FileKeyWrap> {
    let (wek_b, b_wrap_nonce) = cipher::wrap(bucket_kek, file_cek.as_ref())?;

    match file_password {
        Some(password) if !password.is_empty() => {
            let (pwd_kek, p_kek_salt) = file_kek_fresh(password)?;
            let (wrapped_key, p_wrap_nonce) = cipher::wrap(&pwd_kek, &wek_b)?;
            Ok(FileKeyWrap {
                wrapped_key,
                b_wrap_nonce,
                p_kek_salt: Some(p_kek_salt),
                p_wrap_nonce: Some(p_wrap_nonce),
            })
        }
        _ => Ok(FileKeyWrap {
            wrapped_key: wek_b,
            b_wrap_nonce,
            p_kek_salt: None,
            p_wrap_nonce: None,
        }),
    }
}

/// Unwraps a stored file key back to the file CEK.
///
/// When the record carries a file-password layer, the caller must supply
/// the password: a missing one is `PasswordRequired`, a wrong one is
/// `AuthFailed` from the outer unwrap.
pub fn unwrap_file_key(
    file_cipher: &FileCipherData,
    has_file_password: bool,
    bucket_kek: &SecretKey,
    file_password: Option<&[u8]>,
) -> Result<SecretKey> {
    let mut wrapped: Zeroizing<Vec<u8>> =
        Zeroizing::new(cipher::decode_base64(&file_cipher.wrapped_key)?);

    if has_file_password {
        let password = match file_password {
            Some(p) if !p.is_empty() => p,
            _ => return Err(XferError::PasswordRequired),
        };

        let p_kek_salt = cipher::decode_base64(&file_cipher.p_kek_salt)?;
        let p_wrap_nonce = cipher::decode_base64(&file_cipher.p_wrap_nonce)?;

        let pwd_kek = file_kek_for_salt(password, &p_kek_salt)?;
        wrapped = cipher::unwrap(&pwd_kek, &wrapped, &p_wrap_nonce)?;
    }

    let b_wrap_nonce = cipher::decode_base64(&file_cipher.b_wrap_nonce)?;
    cipher::unwrap_key(bucket_kek, &wrapped, &b_wrap_nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::SecretVec;

    fn session_with_cek() -> Arc<Session> {
        let session = Arc::new(Session::new());
        session
            .set(
                "sess-1".into(),
                SecretVec::new(vec![0x11; 32]),
                "AAA-BBB-01".into(),
                SecretKey::from_bytes([0x22; 32]),
                3600,
            )
            .unwrap();
        session
    }

    fn cipher_record(wrap: &FileKeyWrap, file_nonce: &[u8], b_kek_salt: &[u8]) -> FileCipherData {
        FileCipherData {
            file_nonce: cipher::encode_base64(file_nonce),
            b_kek_salt: cipher::encode_base64(b_kek_salt),
            p_kek_salt: wrap
                .p_kek_salt
                .map(|s| cipher::encode_base64(&s))
                .unwrap_or_default(),
            wrapped_key: cipher::encode_base64(&wrap.wrapped_key),
            b_wrap_nonce: cipher::encode_base64(&wrap.b_wrap_nonce),
            p_wrap_nonce: wrap
                .p_wrap_nonce
                .map(|n| cipher::encode_base64(&n))
                .unwrap_or_default(),
        }
    }

    #[test]
    fn test_bucket_cipher_roundtrip() {
        let descriptor = create_bucket_cipher(b"correct horse battery").unwrap();

        // Opening twice with the right password yields the same CEK.
        let cek1 = open_bucket_cipher(&descriptor, b"correct horse battery").unwrap();
        let cek2 = open_bucket_cipher(&descriptor, b"correct horse battery").unwrap();
        assert_eq!(cek1.as_bytes(), cek2.as_bytes());
    }

    #[test]
    fn test_bucket_cipher_rejects_wrong_password() {
        let descriptor = create_bucket_cipher(b"correct horse battery").unwrap();
        let result = open_bucket_cipher(&descriptor, b"incorrect horse battery");
        assert!(matches!(result, Err(XferError::AuthFailed(_))));
    }

    #[test]
    fn test_bucket_cipher_rejects_garbage_descriptor() {
        let result = open_bucket_cipher(b"not json at all", b"pw");
        assert!(matches!(result, Err(XferError::AuthFailed(_))));
    }

    #[test]
    fn test_file_key_wrap_without_password() {
        let bucket_kek = SecretKey::random();
        let file_cek = SecretKey::random();

        let wrap = wrap_file_key(&bucket_kek, None, &file_cek).unwrap();
        assert!(!wrap.has_file_password());

        let record = cipher_record(&wrap, &[0u8; 12], &[1u8; 32]);
        let recovered = unwrap_file_key(&record, false, &bucket_kek, None).unwrap();
        assert_eq!(recovered.as_bytes(), file_cek.as_bytes());
    }

    #[test]
    fn test_file_key_wrap_with_password() {
        let bucket_kek = SecretKey::random();
        let file_cek = SecretKey::random();

        let wrap = wrap_file_key(&bucket_kek, Some(b"pw2-Strong!"), &file_cek).unwrap();
        assert!(wrap.has_file_password());

        let record = cipher_record(&wrap, &[0u8; 12], &[1u8; 32]);

        // Missing password is a distinct, user-actionable failure.
        assert!(matches!(
            unwrap_file_key(&record, true, &bucket_kek, None),
            Err(XferError::PasswordRequired)
        ));

        // Wrong password fails on the outer unwrap.
        assert!(matches!(
            unwrap_file_key(&record, true, &bucket_kek, Some(b"wrong-pw-Z1!")),
            Err(XferError::AuthFailed(_))
        ));

        // Right password recovers the CEK.
        let recovered =
            unwrap_file_key(&record, true, &bucket_kek, Some(b"pw2-Strong!")).unwrap();
        assert_eq!(recovered.as_bytes(), file_cek.as_bytes());
    }

    #[test]
    fn test_unwrap_with_wrong_bucket_kek_fails() {
        let bucket_kek = SecretKey::random();
        let file_cek = SecretKey::random();
        let wrap = wrap_file_key(&bucket_kek, None, &file_cek).unwrap();
        let record = cipher_record(&wrap, &[0u8; 12], &[1u8; 32]);

        let result = unwrap_file_key(&record, false, &SecretKey::random(), None);
        assert!(matches!(result, Err(XferError::AuthFailed(_))));
    }

    #[test]
    fn test_bucket_kek_round_trips_through_salt() {
        let keys = EnvelopeKeys::new(session_with_cek());

        let (kek, salt) = keys.bucket_kek_fresh().unwrap();
        let again = keys.bucket_kek_for_salt(&salt).unwrap();
        assert_eq!(kek.as_bytes(), again.as_bytes());
    }

    #[test]
    fn test_bucket_seal_open_roundtrip() {
        let keys = EnvelopeKeys::new(session_with_cek());

        let (enc, nonce) = keys.seal_with_bucket(b"file info json").unwrap();
        let dec = keys.open_with_bucket(&enc, &nonce).unwrap();
        assert_eq!(dec, b"file info json");
    }

    #[test]
    fn test_envelope_ops_require_live_session() {
        let keys = EnvelopeKeys::new(Arc::new(Session::new()));
        assert!(matches!(
            keys.seal_with_bucket(b"x"),
            Err(XferError::NotAuthenticated(_))
        ));
        assert!(matches!(
            keys.bucket_kek_for_salt(&[0u8; 32]),
            Err(XferError::NotAuthenticated(_))
        ));
    }
}
