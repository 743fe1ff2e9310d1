//! Wire DTOs shared across the engines.
//!
//! Field names mirror the server's JSON exactly. Every binary value is
//! base64 (standard, padded) inside a plain string field; an empty string
//! stands for an absent value, which keeps the encoding identical to what
//! existing server records hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, XferError};

// =============================================================================
// Registration / login
// =============================================================================

/// Request for registration step 1.
#[derive(Debug, Serialize)]
pub struct CreateBucketS1Req {
    /// base64(OPAQUE registration request).
    #[serde(rename = "s1Req")]
    pub s1_req: String,
}

/// Response for registration step 1.
#[derive(Debug, Deserialize)]
pub struct CreateBucketS1Resp {
    /// base64(OPAQUE registration response).
    #[serde(rename = "s1Resp")]
    pub s1_resp: String,
    #[serde(rename = "reqID")]
    pub req_id: String,
    /// base64(server identity).
    #[serde(rename = "serverID")]
    pub server_id: String,
}

/// Request for registration step 2.
#[derive(Debug, Serialize)]
pub struct CreateBucketS2Req {
    #[serde(rename = "bucName")]
    pub buc_name: String,
    /// base64(OPAQUE registration record).
    #[serde(rename = "s2Req")]
    pub s2_req: String,
    #[serde(rename = "reqID")]
    pub req_id: String,
    /// base64(bucket cipher descriptor JSON).
    pub cipher: String,
}

/// Response for registration step 2.
#[derive(Debug, Deserialize)]
pub struct CreateBucketS2Resp {
    #[serde(rename = "bucketKey")]
    pub bucket_key: String,
    /// Canonical display name the server stored.
    pub name: String,
}

/// Response for the login configuration fetch.
#[derive(Debug, Deserialize)]
pub struct OpenConfigResp {
    /// base64(server identity).
    #[serde(rename = "serverID")]
    pub server_id: String,
    /// Identifier of the OPAQUE suite the server runs.
    pub config: String,
}

/// Request for login step 1.
#[derive(Debug, Serialize)]
pub struct OpenBucketS1Req {
    /// base64(bucket key).
    #[serde(rename = "bucketKey")]
    pub bucket_key: String,
    /// base64(OPAQUE KE1).
    pub ke1: String,
}

/// Response for login step 1.
#[derive(Debug, Deserialize)]
pub struct OpenBucketS1Resp {
    /// base64(OPAQUE KE2).
    pub ke2: String,
    /// base64(client identity the server registered).
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "loginID")]
    pub login_id: String,
}

/// Request for login step 2.
#[derive(Debug, Serialize)]
pub struct OpenBucketS2Req {
    /// base64(OPAQUE KE3).
    pub ke3: String,
    #[serde(rename = "loginID")]
    pub login_id: String,
}

/// Response for login step 2.
#[derive(Debug, Deserialize)]
pub struct OpenBucketS2Resp {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    /// Session lifetime in seconds.
    #[serde(rename = "sessionTTL")]
    pub session_ttl: i64,
    /// base64(bucket cipher descriptor JSON).
    pub cipher: String,
}

// =============================================================================
// Bucket cipher descriptor
// =============================================================================

/// Persisted alongside the bucket record on the server; returned at login.
///
/// `unwrap(wek, kdf(password, kek_salt), wek_nonce)` yields the bucket CEK
/// iff the password is correct. Created at registration, immutable after.
#[derive(Debug, Serialize, Deserialize)]
pub struct BucketCipher {
    /// base64(32-byte KDF salt).
    #[serde(rename = "KEKSalt")]
    pub kek_salt: String,
    /// base64(wrapped bucket CEK).
    #[serde(rename = "WEK")]
    pub wek: String,
    /// base64(12-byte wrap nonce).
    #[serde(rename = "WEKNonce")]
    pub wek_nonce: String,
}

// =============================================================================
// Upload
// =============================================================================

/// Request for upload initiation.
#[derive(Debug, Serialize)]
pub struct InitUploadReq {
    /// Measured upload speed in bytes per millisecond.
    #[serde(rename = "upSpeed")]
    pub up_speed: f32,
    /// Size of the ciphertext file in bytes.
    #[serde(rename = "fileSize")]
    pub file_size: u64,
}

/// Server-chosen upload plan.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadPlan {
    #[serde(rename = "uploadID")]
    pub upload_id: String,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u64,
    #[serde(rename = "parallelConns")]
    pub parallel_conns: u32,
}

impl UploadPlan {
    /// Checks the plan covers `ciphertext_size` with no spare whole chunk.
    pub fn validate(&self, ciphertext_size: u64) -> Result<()> {
        if self.chunk_size == 0 || self.total_chunks == 0 || self.parallel_conns == 0 {
            return Err(XferError::Transport("degenerate upload plan".into()));
        }
        if self.total_chunks * self.chunk_size < ciphertext_size
            || (self.total_chunks - 1) * self.chunk_size >= ciphertext_size
        {
            return Err(XferError::Transport(format!(
                "upload plan does not cover file: {} chunks x {} bytes for {} bytes",
                self.total_chunks, self.chunk_size, ciphertext_size
            )));
        }
        Ok(())
    }
}

/// Request for upload completion.
#[derive(Debug, Serialize)]
pub struct CompleteUploadReq {
    #[serde(rename = "uploadID")]
    pub upload_id: String,

    /// base64(seal(FileInfo)).
    #[serde(rename = "encFileInfo")]
    pub enc_file_info: String,
    #[serde(rename = "encFileInfoNonce")]
    pub enc_file_info_nonce: String,

    /// base64(seal(MetaWrapper)).
    #[serde(rename = "metadata")]
    pub enc_meta: String,
    #[serde(rename = "metaNonce")]
    pub meta_nonce: String,

    /// base64(sha256(ciphertext file)).
    #[serde(rename = "dataChecksum")]
    pub data_checksum: String,
    /// base64(sha256(enc_meta)).
    #[serde(rename = "metaChecksum")]
    pub meta_checksum: String,
}

// =============================================================================
// Metadata envelope
// =============================================================================

/// Inner metadata record, HMAC-tagged and sealed under the bucket CEK.
///
/// The HMAC in [`MetaWrapper`] covers the exact JSON serialization of this
/// struct, so field order is part of the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaData {
    #[serde(rename = "FileName")]
    pub file_name: String,
    #[serde(rename = "FileExt")]
    pub file_ext: String,
    #[serde(rename = "FileSize")]
    pub file_size: u64,

    /// base64(HMAC(bucket KEK, plaintext file)).
    #[serde(rename = "RawDataChecksum")]
    pub raw_data_hmac: String,
    #[serde(rename = "HasFilePassword")]
    pub has_file_password: bool,
    #[serde(rename = "fileCipherData")]
    pub file_cipher: FileCipherData,
}

/// Outer metadata wrapper: the inner record plus its HMAC.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetaWrapper {
    /// base64(HMAC(bucket KEK, json(meta))).
    #[serde(rename = "RawMetaChecksum")]
    pub raw_meta_hmac: String,
    #[serde(rename = "Meta")]
    pub meta: MetaData,
}

/// Lightweight per-file record sealed under the bucket CEK for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "FileName")]
    pub file_name: String,
    #[serde(rename = "FileExt")]
    pub file_ext: String,
    #[serde(rename = "FileSize")]
    pub file_size: u64,
    #[serde(rename = "HasFilePassword")]
    pub has_file_password: bool,
}

// =============================================================================
// File cipher descriptor
// =============================================================================

/// Per-file key-wrap descriptor.
///
/// The stored wrapped key is `wrap(pwd_kek, wrap(bucket_kek, file_cek))`
/// when a file password is set, otherwise `wrap(bucket_kek, file_cek)`.
/// Empty strings stand for absent optional fields.
///
/// Two wire variants exist: the current one written below, and a legacy
/// single-wrap variant (`wrappingKeySalt` + `wrappedKeyNonce` only) that
/// older server records still hold. Both are accepted on read; only the
/// current variant is ever written.
#[derive(Debug, Clone, Serialize)]
pub struct FileCipherData {
    /// base64(nonce from sealing the file under the file CEK).
    #[serde(rename = "fileNonce")]
    pub file_nonce: String,
    /// base64(salt for the bucket KEK).
    #[serde(rename = "bKeySalt")]
    pub b_kek_salt: String,
    /// base64(salt for the file-password KEK); empty when no file password.
    #[serde(rename = "pKeySalt")]
    pub p_kek_salt: String,
    /// base64(wrapped file CEK, possibly double-wrapped).
    #[serde(rename = "wrappedKey")]
    pub wrapped_key: String,
    /// base64(nonce of the bucket-KEK wrap).
    #[serde(rename = "bWrappedKeyNonce")]
    pub b_wrap_nonce: String,
    /// base64(nonce of the file-password wrap); empty when no file password.
    #[serde(rename = "wrappedKeyNonce")]
    pub p_wrap_nonce: String,
}

/// Raw superset of both wire variants, used during deserialization.
#[derive(Deserialize)]
struct RawFileCipherData {
    #[serde(rename = "fileNonce")]
    file_nonce: String,
    #[serde(rename = "wrappedKey")]
    wrapped_key: String,
    #[serde(rename = "bKeySalt", default)]
    b_kek_salt: Option<String>,
    #[serde(rename = "pKeySalt", default)]
    p_kek_salt: Option<String>,
    #[serde(rename = "bWrappedKeyNonce", default)]
    b_wrap_nonce: Option<String>,
    #[serde(rename = "wrappedKeyNonce", default)]
    wrapped_key_nonce: Option<String>,
    /// Legacy variant: the single bucket-KEK salt.
    #[serde(rename = "wrappingKeySalt", default)]
    legacy_salt: Option<String>,
}

impl<'de> Deserialize<'de> for FileCipherData {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let raw = RawFileCipherData::deserialize(deserializer)?;
        let nonempty = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.is_empty());

        if nonempty(&raw.b_kek_salt) {
            // Current variant: wrappedKeyNonce is the file-password wrap nonce.
            Ok(FileCipherData {
                file_nonce: raw.file_nonce,
                b_kek_salt: raw.b_kek_salt.unwrap_or_default(),
                p_kek_salt: raw.p_kek_salt.unwrap_or_default(),
                wrapped_key: raw.wrapped_key,
                b_wrap_nonce: raw
                    .b_wrap_nonce
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| D::Error::missing_field("bWrappedKeyNonce"))?,
                p_wrap_nonce: raw.wrapped_key_nonce.unwrap_or_default(),
            })
        } else if nonempty(&raw.legacy_salt) {
            // Legacy variant: single bucket wrap, wrappedKeyNonce is its nonce.
            Ok(FileCipherData {
                file_nonce: raw.file_nonce,
                b_kek_salt: raw.legacy_salt.unwrap_or_default(),
                p_kek_salt: String::new(),
                wrapped_key: raw.wrapped_key,
                b_wrap_nonce: raw
                    .wrapped_key_nonce
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| D::Error::missing_field("wrappedKeyNonce"))?,
                p_wrap_nonce: String::new(),
            })
        } else {
            Err(D::Error::missing_field("bKeySalt"))
        }
    }
}

// =============================================================================
// Listing / download
// =============================================================================

/// Response for the file listing.
#[derive(Debug, Deserialize)]
pub struct FilesListResp {
    pub files: Vec<FilesListItem>,
}

/// One raw (still encrypted) listing entry.
#[derive(Debug, Deserialize)]
pub struct FilesListItem {
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "fileUUID")]
    pub file_uuid: String,
    /// base64(seal(FileInfo)).
    #[serde(rename = "encFileInfo")]
    pub enc_file_info: String,
    #[serde(rename = "fileInfoNonce")]
    pub file_info_nonce: String,
}

/// One decrypted listing entry returned to the caller.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub created_at: DateTime<Utc>,
    pub file_uuid: String,
    pub file_name: String,
    pub file_ext: String,
    pub file_size: u64,
    pub has_file_password: bool,
}

/// Response for the metadata download.
#[derive(Debug, Deserialize)]
pub struct DownloadMetaResp {
    #[serde(rename = "metadata")]
    pub enc_meta: String,
    #[serde(rename = "metaNonce")]
    pub meta_nonce: String,
}

/// Response for the digest download.
#[derive(Debug, Deserialize)]
pub struct DownloadDigestResp {
    /// base64(sha256(ciphertext file)).
    #[serde(rename = "dataChecksum")]
    pub data_checksum: String,
    /// base64(sha256(enc_meta)).
    #[serde(rename = "metaChecksum")]
    pub meta_checksum: String,
}
